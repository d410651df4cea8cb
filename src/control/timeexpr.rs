//! Splunk-like time expressions for the `logs` and `stats` queries.
//!
//! Supported forms: `now`, relative offsets (`-1h`, `-30m`, `+2d`), snapped
//! offsets (`-1h@h`), bare snaps (`@d`), ISO 8601 / RFC 3339 timestamps, and
//! Unix epoch values in seconds or milliseconds.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Parse an expression against a reference instant (Unix seconds).
pub fn parse(expr: &str, now: i64) -> crate::Result<i64> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty time expression".into());
    }

    if expr == "now" {
        return Ok(now);
    }

    if let Some(unit) = expr.strip_prefix('@') {
        return snap(now, unit);
    }

    if expr.starts_with('-') || expr.starts_with('+') {
        let (rel, snap_unit) = match expr.split_once('@') {
            Some((rel, unit)) => (rel, Some(unit)),
            None => (expr, None),
        };
        let mut t = now + parse_offset(rel)?;
        if let Some(unit) = snap_unit {
            t = snap(t, unit)?;
        }
        return Ok(t);
    }

    if expr.chars().all(|c| c.is_ascii_digit()) {
        let value: i64 = expr.parse().map_err(|_| "epoch value out of range")?;
        // Heuristic: 13-digit values are milliseconds.
        return Ok(if value >= 1_000_000_000_000 {
            value / 1000
        } else {
            value
        });
    }

    match OffsetDateTime::parse(expr, &Rfc3339) {
        Ok(dt) => Ok(dt.unix_timestamp()),
        Err(_) => Err(format!("unrecognized time expression: {}", expr).into()),
    }
}

fn parse_offset(rel: &str) -> crate::Result<i64> {
    let (sign, rest) = match rel.split_at(1) {
        ("-", rest) => (-1i64, rest),
        ("+", rest) => (1i64, rest),
        _ => return Err(format!("bad relative offset: {}", rel).into()),
    };
    if rest.is_empty() {
        return Err(format!("bad relative offset: {}", rel).into());
    }
    let unit_at = rest
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in offset: {}", rel))?;
    let (digits, unit) = rest.split_at(unit_at);
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("bad amount in offset: {}", rel))?;
    Ok(sign * amount * unit_secs(unit)?)
}

fn unit_secs(unit: &str) -> crate::Result<i64> {
    match unit {
        "s" => Ok(1),
        "m" => Ok(60),
        "h" => Ok(3600),
        "d" => Ok(86400),
        "w" => Ok(604800),
        other => Err(format!("unknown time unit: {}", other).into()),
    }
}

/// Floor to the start of the given unit, UTC.
fn snap(t: i64, unit: &str) -> crate::Result<i64> {
    let size = match unit {
        "s" | "m" | "h" | "d" => unit_secs(unit)?,
        other => return Err(format!("cannot snap to unit: {}", other).into()),
    };
    Ok(t - t.rem_euclid(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-05-01T10:30:45Z
    const NOW: i64 = 1714559445;

    #[test]
    fn now_and_relative() {
        assert_eq!(parse("now", NOW).unwrap(), NOW);
        assert_eq!(parse("-1h", NOW).unwrap(), NOW - 3600);
        assert_eq!(parse("-30m", NOW).unwrap(), NOW - 1800);
        assert_eq!(parse("+2d", NOW).unwrap(), NOW + 2 * 86400);
        assert_eq!(parse("-1w", NOW).unwrap(), NOW - 604800);
    }

    #[test]
    fn snapped_offsets() {
        let one_hour_ago_floored = parse("-1h@h", NOW).unwrap();
        assert_eq!(one_hour_ago_floored % 3600, 0);
        assert!(one_hour_ago_floored <= NOW - 3600);
        assert!(one_hour_ago_floored > NOW - 2 * 3600);

        let today = parse("@d", NOW).unwrap();
        assert_eq!(today % 86400, 0);
        assert!(today <= NOW);
    }

    #[test]
    fn epoch_seconds_and_millis() {
        assert_eq!(parse("1714559445", NOW).unwrap(), 1714559445);
        assert_eq!(parse("1714559445123", NOW).unwrap(), 1714559445);
    }

    #[test]
    fn iso_8601() {
        assert_eq!(parse("2024-05-01T10:30:45Z", NOW).unwrap(), NOW);
    }

    #[test]
    fn garbage_rejected() {
        assert!(parse("", NOW).is_err());
        assert!(parse("yesterday", NOW).is_err());
        assert!(parse("-1x", NOW).is_err());
        assert!(parse("@y", NOW).is_err());
        assert!(parse("-h", NOW).is_err());
    }
}
