//! Expresiones cron y zonas horarias de las registraciones recurrentes.
//!
//! Se acepta la sintaxis del crate `cron` (6 o 7 campos, con segundos). Una
//! expresión clásica de 5 campos se normaliza anteponiendo `0` segundos.
//! Las zonas se expresan como `UTC`/`Z` o un offset fijo `+HH:MM`/`-HH:MM`;
//! cualquier otro nombre se evalúa en UTC.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use cron::Schedule;
use log::warn;

use crate::errors::QueueError;

pub fn parse_cron(pattern: &str) -> Result<Schedule, QueueError> {
    let trimmed = pattern.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|_| QueueError::InvalidPattern(pattern.to_string()))
}

pub fn parse_timezone(tz: Option<&str>) -> FixedOffset {
    let utc = Utc.fix();
    let Some(raw) = tz.map(str::trim).filter(|s| !s.is_empty()) else {
        return utc;
    };
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return utc;
    }
    match parse_offset(raw) {
        Some(off) => off,
        None => {
            warn!("cron:timezone '{raw}' not understood, using UTC");
            utc
        }
    }
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = h.parse().ok()?;
    let minutes: i32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Próximo disparo estrictamente posterior a `after`.
pub fn next_tick(pattern: &str, tz: Option<&str>, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, QueueError> {
    let schedule = parse_cron(pattern)?;
    let offset = parse_timezone(tz);
    let local = after.with_timezone(&offset);
    Ok(schedule.after(&local).next().map(|t| t.with_timezone(&Utc)))
}
