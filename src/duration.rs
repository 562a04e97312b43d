//! ISO-8601 durations as used by the examination catalog (`PT40M`, `PT1H30M`).

use std::time::Duration;

/// Parse an ISO-8601 duration of the form `P[nD][T[nH][nM][nS]]`.
///
/// Years, months and weeks are rejected since they have no fixed length.
pub fn parse_iso_duration(input: &str) -> Option<Duration> {
    let rest = input.trim().strip_prefix(['P', 'p'])?;
    if rest.is_empty() {
        return None;
    }

    let mut secs: u64 = 0;
    let mut in_time = false;
    let mut digits = String::new();
    let mut saw_component = false;

    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            'T' | 't' => {
                if in_time || !digits.is_empty() {
                    return None;
                }
                in_time = true;
            }
            _ => {
                if digits.is_empty() {
                    return None;
                }
                let n: u64 = digits.parse().ok()?;
                digits.clear();
                let unit = match (in_time, c.to_ascii_uppercase()) {
                    (false, 'D') => 86_400,
                    (true, 'H') => 3_600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    _ => return None,
                };
                secs = secs.checked_add(n.checked_mul(unit)?)?;
                saw_component = true;
            }
        }
    }

    if !digits.is_empty() || !saw_component {
        return None;
    }
    Some(Duration::from_secs(secs))
}

/// Whole minutes of an ISO-8601 duration, rounded down.
pub fn iso_duration_minutes(input: &str) -> Option<i64> {
    parse_iso_duration(input).map(|d| (d.as_secs() / 60) as i64)
}
