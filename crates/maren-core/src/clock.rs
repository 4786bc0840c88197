//! Wall-clock helpers.
//!
//! Durations are measured with `std::time::Instant` at call sites; this
//! module only deals in UTC wall-clock and the persona-local rendering used
//! inside prompt text.

use chrono::{DateTime, Duration, FixedOffset, Utc};

/// Current UTC time. Single call site for wall-clock reads so tests can
/// pass explicit timestamps instead.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Render `now` in the persona's declared timezone for prompt text.
///
/// Falls back to UTC when the configured offset is out of range.
#[must_use]
pub fn persona_local(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    match FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)) {
        Some(offset) => now
            .with_timezone(&offset)
            .format("%A %Y-%m-%d %H:%M")
            .to_string(),
        None => now.format("%A %Y-%m-%d %H:%M").to_string(),
    }
}

/// Humanize a message age for the recovery preamble ("about 2 hours").
#[must_use]
pub fn humanize_age(age: Duration) -> String {
    let minutes = age.num_minutes().max(0);
    if minutes < 2 {
        "moments".to_string()
    } else if minutes < 60 {
        format!("about {minutes} minutes")
    } else {
        let hours = age.num_hours();
        if hours == 1 {
            "about an hour".to_string()
        } else {
            format!("about {hours} hours")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_persona_local_applies_offset() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        // UTC-5
        let rendered = persona_local(now, -300);
        assert!(rendered.contains("07:00"), "got {rendered}");
    }

    #[test]
    fn test_persona_local_bad_offset_falls_back_to_utc() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let rendered = persona_local(now, 100_000);
        assert!(rendered.contains("12:00"), "got {rendered}");
    }

    #[test]
    fn test_humanize_age() {
        assert_eq!(humanize_age(Duration::seconds(30)), "moments");
        assert_eq!(humanize_age(Duration::minutes(10)), "about 10 minutes");
        assert_eq!(humanize_age(Duration::minutes(70)), "about an hour");
        assert_eq!(humanize_age(Duration::hours(5)), "about 5 hours");
    }
}
