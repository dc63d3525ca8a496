//! Human-readable byte sizes such as `50M` or `1.5GiB`.

/// A size string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid byte size {input:?}: {reason}")]
pub struct InvalidByteSize {
    pub input: String,
    pub reason: String,
}

/// Parses a positive byte size with an optional unit.
///
/// Units are `K`, `M`, `G` and `T`, optionally followed by `B` or `iB`, in
/// any case. All units are powers of 1024. A bare number or `B` means bytes.
/// The number may have a fractional part.
///
/// # Errors
///
/// - `InvalidByteSize` - If the number or unit is malformed, or the size is zero
pub fn parse_byte_size(input: &str) -> Result<u64, InvalidByteSize> {
    let invalid = |reason: &str| InvalidByteSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing number"));
    }

    let value: f64 = number.parse().map_err(|_| invalid("malformed number"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(invalid("unknown unit")),
    };

    let bytes = value * multiplier as f64;
    if bytes < 1.0 {
        return Err(invalid("size must be at least one byte"));
    }
    if bytes >= u64::MAX as f64 {
        return Err(invalid("size too large"));
    }
    Ok(bytes as u64)
}
