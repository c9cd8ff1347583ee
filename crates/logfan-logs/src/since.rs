//! `--since` parsing: relative durations and absolute times of day.

use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone};

use crate::error::{LogsError, LogsResult};

/// Resolve a `--since` value to a relative window ending at `now`
///
/// Accepts durations (`5m`, `1h30m`, `90s`) and times of day (`14:30`,
/// `14:30:15`). A time of day later than `now` refers to yesterday. The
/// result is never shorter than one second.
pub fn resolve_since<Tz: TimeZone>(input: &str, now: &DateTime<Tz>) -> LogsResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(LogsError::InvalidSince(input.to_string()));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        return Ok(duration);
    }

    let time = NaiveTime::parse_from_str(input, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M"))
        .map_err(|_| LogsError::InvalidSince(input.to_string()))?;

    let today = now.date_naive().and_time(time);
    let mut target = now
        .timezone()
        .from_local_datetime(&today)
        .earliest()
        .ok_or_else(|| LogsError::InvalidSince(input.to_string()))?;
    if target > *now {
        target = target - chrono::Duration::days(1);
    }

    let elapsed = (now.clone() - target).to_std().unwrap_or_default();
    Ok(elapsed.max(Duration::from_secs(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 14, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_relative_durations() {
        let now = at(12, 0);
        assert_eq!(resolve_since("5m", &now).unwrap(), Duration::from_secs(300));
        assert_eq!(resolve_since("1h30m", &now).unwrap(), Duration::from_secs(5400));
        assert_eq!(resolve_since(" 30s ", &now).unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_time_of_day_earlier_today() {
        let since = resolve_since("14:30", &at(15, 0)).unwrap();
        assert_eq!(since, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_time_of_day_with_seconds() {
        let since = resolve_since("14:59:30", &at(15, 0)).unwrap();
        assert_eq!(since, Duration::from_secs(30));
    }

    #[test]
    fn test_future_time_of_day_rolls_back_a_day() {
        let since = resolve_since("14:30", &at(14, 0)).unwrap();
        assert_eq!(since, Duration::from_secs(23 * 3600 + 30 * 60));
    }

    #[test]
    fn test_now_is_at_least_one_second() {
        let since = resolve_since("15:00", &at(15, 0)).unwrap();
        assert_eq!(since, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_since() {
        let now = at(12, 0);
        assert!(matches!(
            resolve_since("yesterday", &now),
            Err(LogsError::InvalidSince(_))
        ));
        assert!(resolve_since("25:00", &now).is_err());
        assert!(resolve_since("", &now).is_err());
    }
}
