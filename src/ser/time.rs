//! Container timestamps: 100 ns ticks since 0001-01-01T00:00:00 UTC

use chrono::{DateTime, Local, Utc};

pub const TICKS_PER_SECOND: u64 = 10_000_000;
pub const NANOS_PER_TICK: u32 = 100;

/// Seconds from 0001-01-01 to the Unix epoch
pub const SECONDS_TO_UNIX_EPOCH: i64 = 62_135_596_800;

/// Converts a UTC instant to ticks, truncating below 100 ns.
///
/// `None` for instants before year 1 or beyond the u64 tick range.
pub fn datetime_to_ticks(instant: DateTime<Utc>) -> Option<u64> {
    let seconds = instant.timestamp().checked_add(SECONDS_TO_UNIX_EPOCH)?;
    let seconds = u64::try_from(seconds).ok()?;

    // Leap-second nanos (>= 1e9) fold into the last tick of the second
    let sub_ticks = u64::from(instant.timestamp_subsec_nanos().min(999_999_999) / NANOS_PER_TICK);

    seconds.checked_mul(TICKS_PER_SECOND)?.checked_add(sub_ticks)
}

/// Inverse of [`datetime_to_ticks`]
pub fn ticks_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(ticks / TICKS_PER_SECOND).ok()? - SECONDS_TO_UNIX_EPOCH;
    let nanos = (ticks % TICKS_PER_SECOND) as u32 * NANOS_PER_TICK;
    DateTime::from_timestamp(seconds, nanos)
}

/// Current UTC time in ticks
pub fn now_ticks() -> u64 {
    datetime_to_ticks(Utc::now()).unwrap_or(0)
}

/// Current local wall-clock time in ticks (the header's `date_time` field)
pub fn local_now_ticks() -> u64 {
    datetime_to_ticks(Local::now().naive_local().and_utc()).unwrap_or(0)
}

/// Tick difference as a duration
pub fn ticks_to_duration(ticks: u64) -> std::time::Duration {
    std::time::Duration::new(
        ticks / TICKS_PER_SECOND,
        (ticks % TICKS_PER_SECOND) as u32 * NANOS_PER_TICK,
    )
}
