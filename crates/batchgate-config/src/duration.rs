//! Duration strings such as `500ms`, `5s`, `2m`, `1h`.

use std::time::Duration;

/// Parse a duration with a unit suffix.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration '{input}'"))?;
    let (digits, unit) = input.split_at(split);
    if digits.is_empty() {
        return Err(format!("missing amount in duration '{input}'"));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{input}': {e}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(format!("unknown unit '{unit}' in duration '{input}'")),
    }
}
