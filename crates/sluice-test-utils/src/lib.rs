//! Test doubles shared by Sluice crates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sluice_core::{
    ErrorKind, ManagedQueryExecution, QueryError, QueryId, QueryState, RetryPolicy,
    StateChangeListener,
};

type SharedListener = Arc<dyn Fn(QueryState) + Send + Sync>;

struct Inner {
    state: QueryState,
    memory_bytes: u64,
    cpu_time: Duration,
    failure: Option<QueryError>,
    listeners: Vec<SharedListener>,
}

/// In-memory [`ManagedQueryExecution`] whose usage is driven by the test.
pub struct TestQuery {
    id: QueryId,
    priority: i32,
    retry_policy: RetryPolicy,
    inner: Mutex<Inner>,
}

impl TestQuery {
    pub fn new(id: impl AsRef<str>) -> Arc<Self> {
        Self::builder(id).build()
    }

    /// Query with a generated unique id (`q1`, `q2`, ...).
    pub fn next() -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("q{n}"))
    }

    pub fn builder(id: impl AsRef<str>) -> TestQueryBuilder {
        TestQueryBuilder {
            id: QueryId::new(id),
            priority: 1,
            retry_policy: RetryPolicy::None,
            memory_bytes: 0,
        }
    }

    pub fn set_memory_bytes(&self, bytes: u64) {
        self.inner.lock().memory_bytes = bytes;
    }

    pub fn set_cpu_millis(&self, millis: u64) {
        self.inner.lock().cpu_time = Duration::from_millis(millis);
    }

    pub fn add_cpu_millis(&self, millis: u64) {
        let mut inner = self.inner.lock();
        inner.cpu_time = inner.cpu_time.saturating_add(Duration::from_millis(millis));
    }

    /// Finishes the query successfully.
    pub fn complete(&self) {
        self.transition(QueryState::Finished, None);
    }

    /// Fails the query as if the engine reported `kind`.
    pub fn fail_with(&self, kind: ErrorKind) {
        self.transition(
            QueryState::Failed,
            Some(QueryError::new(kind, "query failed")),
        );
    }

    pub fn failure(&self) -> Option<QueryError> {
        self.inner.lock().failure.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    fn transition(&self, next: QueryState, failure: Option<QueryError>) {
        let listeners = {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition_to(next) {
                tracing::debug!(
                    target: "sluice.test",
                    query_id = %self.id,
                    from = %inner.state,
                    to = %next,
                    "ignoring illegal transition"
                );
                return;
            }
            inner.state = next;
            if failure.is_some() {
                inner.failure = failure;
            }
            inner.listeners.clone()
        };

        for listener in listeners {
            listener(next);
        }
    }
}

impl ManagedQueryExecution for TestQuery {
    fn query_id(&self) -> &QueryId {
        &self.id
    }

    fn state(&self) -> QueryState {
        self.inner.lock().state
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn memory_reservation_bytes(&self) -> u64 {
        self.inner.lock().memory_bytes
    }

    fn total_cpu_time(&self) -> Duration {
        self.inner.lock().cpu_time
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        self.inner.lock().failure.as_ref().map(|failure| failure.kind)
    }

    fn start_waiting_for_resources(&self) {
        self.transition(QueryState::Running, None);
    }

    fn fail(&self, error: QueryError) {
        self.transition(QueryState::Failed, Some(error));
    }

    fn add_state_change_listener(&self, listener: StateChangeListener) {
        let listener: SharedListener = Arc::from(listener);
        let done_state = {
            let mut inner = self.inner.lock();
            inner.listeners.push(listener.clone());
            inner.state.is_done().then_some(inner.state)
        };
        if let Some(state) = done_state {
            listener(state);
        }
    }
}

pub struct TestQueryBuilder {
    id: QueryId,
    priority: i32,
    retry_policy: RetryPolicy,
    memory_bytes: u64,
}

impl TestQueryBuilder {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn build(self) -> Arc<TestQuery> {
        Arc::new(TestQuery {
            id: self.id,
            priority: self.priority,
            retry_policy: self.retry_policy,
            inner: Mutex::new(Inner {
                state: QueryState::Queued,
                memory_bytes: self.memory_bytes,
                cpu_time: Duration::ZERO,
                failure: None,
                listeners: Vec::new(),
            }),
        })
    }
}
