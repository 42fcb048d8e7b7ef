//! Next-fire computations for reminder schedules.
//!
//! Everything here is a pure function of "now"; arming real timers lives in the daemon.

use chrono::{DateTime, Days, Duration, NaiveTime, TimeZone, Utc};

use crate::ScheduleEntry;

/// Live schedule shape for one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Fires every `every`, counted from the moment it is armed.
    Interval { every: Duration },
    /// Fires daily at a local wall-clock time.
    DailyAt { hour: u32, minute: u32 },
    /// Fires once at an absolute instant.
    OneShot { at: DateTime<Utc> },
}

impl ScheduleKind {
    /// Interpret a recurring entry. The interval form wins when both are valid.
    pub fn from_entry(entry: &ScheduleEntry) -> Option<Self> {
        if let Some(every) = entry.every_minutes.and_then(interval_from_minutes) {
            return Some(Self::Interval { every });
        }
        let (hour, minute) = parse_clock_time(entry.at.as_deref()?)?;
        Some(Self::DailyAt { hour, minute })
    }
}

/// Decision for a one-shot reminder relative to the grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotPlan {
    Future(DateTime<Utc>),
    FireNow,
    Missed,
}

/// Next instant strictly after `now` at which `kind` fires.
///
/// `DailyAt` resolves the wall-clock time in the zone of `now`. Ambiguous local
/// times pick the earliest instant; nonexistent ones roll to the next day.
pub fn next_fire_time<Tz: TimeZone>(kind: &ScheduleKind, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    match kind {
        ScheduleKind::Interval { every } => now.with_timezone(&Utc).checked_add_signed(*every),
        ScheduleKind::DailyAt { hour, minute } => next_daily(*hour, *minute, now),
        ScheduleKind::OneShot { at } => (*at > now.with_timezone(&Utc)).then_some(*at),
    }
}

/// Classify a one-shot fire time: future, just missed (fire now), or stale.
pub fn plan_one_shot(at: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> OneShotPlan {
    if let Some(target) = next_fire_time(&ScheduleKind::OneShot { at }, &now) {
        return OneShotPlan::Future(target);
    }
    // `now - at` cannot overflow for valid instants, unlike `now - grace`.
    if now - at <= grace {
        OneShotPlan::FireNow
    } else {
        OneShotPlan::Missed
    }
}

/// Convert `everyMinutes` to a whole-millisecond interval.
pub fn interval_from_minutes(minutes: f64) -> Option<Duration> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return None;
    }
    let millis = (minutes * 60_000.0).floor();
    // Sub-millisecond intervals would re-arm in a tight loop.
    if millis < 1.0 || millis >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis as i64)
}

/// Parse a zero-padded 24-hour `HH:MM`.
pub fn parse_clock_time(value: &str) -> Option<(u32, u32)> {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let hour = u32::from(digits[0] - b'0') * 10 + u32::from(digits[1] - b'0');
    let minute = u32::from(digits[2] - b'0') * 10 + u32::from(digits[3] - b'0');
    (hour < 24 && minute < 60).then_some((hour, minute))
}

fn next_daily<Tz: TimeZone>(hour: u32, minute: u32, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let zone = now.timezone();
    let today = now.date_naive();
    (0..=2u64).find_map(|offset| {
        let date = today.checked_add_days(Days::new(offset))?;
        let candidate = zone.from_local_datetime(&date.and_time(time)).earliest()?;
        (candidate > *now).then(|| candidate.with_timezone(&Utc))
    })
}
