use std::time::Duration;

/// Parse `500ms`, `5s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid duration '{}'", input));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        other => Err(format!(
            "invalid duration unit '{}' in '{}' (use ms, s, m or h)",
            other, input
        )),
    }
}

/// Like [`parse_duration`], for settings kept in whole seconds. Values with a
/// sub-second part are rejected rather than truncated.
pub fn parse_duration_secs(input: &str) -> Result<u64, String> {
    let duration = parse_duration(input)?;
    if duration.subsec_nanos() != 0 {
        return Err(format!(
            "'{}' has a sub-second part; this setting takes whole seconds",
            input.trim()
        ));
    }
    Ok(duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_parse_duration_secs() {
        assert_eq!(parse_duration_secs("2m").unwrap(), 120);
        assert_eq!(parse_duration_secs("3000ms").unwrap(), 3);
        assert_eq!(parse_duration_secs("45").unwrap(), 45);

        let err = parse_duration_secs("1500ms").unwrap_err();
        assert!(err.contains("whole seconds"));
        assert!(parse_duration_secs("500ms").is_err());
    }
}
