//! Microsecond wall-clock helpers used for record timestamps and liveness

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch
pub type Microsec = i64;

/// Current wall-clock time in microseconds
pub fn now_micros() -> Microsec {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as Microsec,
        // clock set before 1970
        Err(e) => -(e.duration().as_micros() as Microsec),
    }
}

/// Convert a duration to microseconds, saturating at `i64::MAX`
pub fn duration_micros(d: Duration) -> Microsec {
    Microsec::try_from(d.as_micros()).unwrap_or(Microsec::MAX)
}

/// Render a timestamp as `seconds.micros` since the epoch
pub fn format_micros(when: Microsec) -> String {
    if when == 0 {
        return "never".to_string();
    }
    format!("{}.{:06}", when.div_euclid(1_000_000), when.rem_euclid(1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotone_enough() {
        let a = now_micros();
        std::thread::sleep(Duration::from_millis(2));
        let b = now_micros();
        assert!(b > a);
    }

    #[test]
    fn test_format() {
        assert_eq!(format_micros(0), "never");
        assert_eq!(format_micros(1_500_000), "1.500000");
        assert_eq!(duration_micros(Duration::from_millis(3)), 3_000);
    }
}
