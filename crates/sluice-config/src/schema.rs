use schemars::r#gen::SchemaGenerator;
use schemars::schema::{RootSchema, Schema};
use schemars::{schema_for, JsonSchema};
use serde_json::json;

use crate::{ByteSize, SluiceConfig};

/// JSON schema for `sluice.toml`, for editor tooling and CI validation.
#[must_use]
pub fn json_schema() -> RootSchema {
    let mut schema = schema_for!(SluiceConfig);
    // The group tree has a single root.
    push_all_of(
        &mut schema,
        schema_from_json(json!({
            "properties": {
                "resource_groups": { "maxItems": 1 }
            }
        })),
    );
    schema
}

impl JsonSchema for ByteSize {
    fn schema_name() -> String {
        "ByteSize".to_owned()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        schema_from_json(json!({
            "description": "Byte count, either an integer or a string such as \"512MiB\" (units are binary).",
            "anyOf": [
                { "type": "integer", "minimum": 0 },
                {
                    "type": "string",
                    "pattern": "^\\s*[0-9]*\\.?[0-9]*\\s*([kKmMgGtTpP]([iI]?[bB])?|[bB])?\\s*$"
                }
            ]
        }))
    }
}

pub(crate) fn scheduling_policy_schema(_generator: &mut SchemaGenerator) -> Schema {
    schema_from_json(json!({
        "type": "string",
        "enum": ["fair", "weighted", "weighted_fair", "query_priority"]
    }))
}

pub(crate) fn killer_policy_schema(_generator: &mut SchemaGenerator) -> Schema {
    schema_from_json(json!({
        "type": "string",
        "enum": ["none", "total-reservation", "total-reservation-on-blocked-nodes"],
        "default": "total-reservation-on-blocked-nodes"
    }))
}

fn push_all_of(root: &mut RootSchema, schema: Schema) {
    let subschemas = root.schema.subschemas();
    subschemas.all_of.get_or_insert_with(Vec::new).push(schema);
}

fn schema_from_json(value: serde_json::Value) -> Schema {
    serde_json::from_value(value).unwrap_or(Schema::Bool(true))
}
