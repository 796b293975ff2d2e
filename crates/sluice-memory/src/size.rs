use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseByteSizeError {
    #[error("byte size is empty")]
    Empty,
    #[error("invalid number in byte size {0:?}")]
    InvalidNumber(String),
    #[error("unknown unit in byte size {0:?}")]
    UnknownUnit(String),
    #[error("byte size {0:?} does not fit in 64 bits")]
    Overflow(String),
}

/// Parses a human-friendly byte size such as `"512MiB"`, `"2G"` or `"1.5 GB"`.
///
/// Units are case-insensitive and always binary: `K`, `KB` and `KiB` all mean
/// 1024 bytes. A bare number is a byte count. Fractional values are rounded
/// down to whole bytes.
pub fn parse_byte_size(input: &str) -> Result<u64, ParseByteSizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseByteSizeError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let shift = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        "p" | "pb" | "pib" => 50,
        _ => return Err(ParseByteSizeError::UnknownUnit(input.to_owned())),
    };
    let multiplier = 1u128 << shift;

    let invalid = || ParseByteSizeError::InvalidNumber(input.to_owned());
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    // Cap the precision so the denominator cannot overflow.
    if fraction.len() > 18 || fraction.contains('.') {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut bytes = whole
        .checked_mul(multiplier)
        .ok_or_else(|| ParseByteSizeError::Overflow(input.to_owned()))?;
    if !fraction.is_empty() {
        let numerator: u128 = fraction.parse().map_err(|_| invalid())?;
        let denominator = 10u128.pow(fraction.len() as u32);
        bytes += numerator * multiplier / denominator;
    }

    u64::try_from(bytes).map_err(|_| ParseByteSizeError::Overflow(input.to_owned()))
}
