use time::OffsetDateTime;

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
