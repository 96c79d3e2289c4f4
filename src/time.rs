use chrono::{DateTime, TimeDelta, Utc};

/// Returns the current wall-clock time in UTC.
///
/// Probe timestamps are compared across hosts, so wall-clock time is used
/// everywhere instead of a monotonic clock.
///
/// ```
/// use matrix_irc_ping_exporter::time::{now, to_unix_nanos};
/// let timestamp = to_unix_nanos(now());
/// println!("Timestamp is {}", timestamp);
/// ```
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Converts a timestamp to nanoseconds since the Unix epoch, as used on the wire.
///
/// Saturates for dates outside the ~584 year range representable in an `i64`.
pub fn to_unix_nanos(date: DateTime<Utc>) -> i64 {
    date.timestamp_nanos_opt().unwrap_or(if date.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Converts nanoseconds since the Unix epoch into a timestamp.
pub fn from_unix_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Converts milliseconds since the Unix epoch into a timestamp.
///
/// Returns `None` when the value is out of range for `DateTime`.
pub fn from_unix_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Converts a signed duration into fractional seconds.
pub fn as_seconds(delta: TimeDelta) -> f64 {
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1_000_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_nanos_test() {
        const TEST_CASES: &[(i64, u32)] = &[(1_525_987, 0), (0, 0), (2_584_229, 151_000_000)];

        for &(secs, nanos) in TEST_CASES {
            let sample = DateTime::<Utc>::from_timestamp(secs, nanos).expect("Invalid timestamp");
            let wire = to_unix_nanos(sample);

            assert_eq!(wire, secs * 1_000_000_000 + nanos as i64);
            assert_eq!(from_unix_nanos(wire), sample);
        }
    }

    #[test]
    fn unix_millis_test() {
        let ts = from_unix_millis(1_700_000_000_123).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 123);
        assert!(from_unix_millis(i64::MAX).is_none());
    }

    #[test]
    fn as_seconds_test() {
        assert!((as_seconds(TimeDelta::milliseconds(1500)) - 1.5).abs() < 1e-9);
        assert!((as_seconds(TimeDelta::milliseconds(-250)) + 0.25).abs() < 1e-9);
        assert_eq!(as_seconds(TimeDelta::zero()), 0.0);
    }
}
