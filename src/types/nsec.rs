//! Campbell time values: seconds and nanoseconds since 1990-01-01 UTC.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign};

/// Seconds between the Unix epoch and 1990-01-01 00:00:00 UTC.
pub const SECS_BEFORE_1990: i64 = 631_152_000;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A time value as `{seconds, nanoseconds}` measured from the 1990-01-01
/// UTC epoch. This is the native timestamp representation of the logger:
/// table base times, sample intervals and record timestamps all arrive in
/// this form.
///
/// Ordering is lexicographic on `(sec, nsec)`; addition normalizes the
/// nanosecond component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NSec {
    /// Seconds since 1990-01-01 UTC.
    pub sec: u32,
    /// Nanosecond component, always below 1e9 after normalization.
    pub nsec: u32,
}

impl NSec {
    /// Create a new time value. The nanosecond component is normalized into
    /// the seconds field if it overflows.
    pub fn new(sec: u32, nsec: u32) -> Self {
        let mut value = NSec { sec, nsec };
        value.normalize();
        value
    }

    /// The zero instant (1990-01-01 00:00:00.000 UTC).
    pub const fn zero() -> Self {
        NSec { sec: 0, nsec: 0 }
    }

    /// Whether this is the zero instant.
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    fn normalize(&mut self) {
        if self.nsec >= NANOS_PER_SEC {
            self.sec = self.sec.wrapping_add(self.nsec / NANOS_PER_SEC);
            self.nsec %= NANOS_PER_SEC;
        }
    }

    /// Seconds since the Unix epoch.
    pub fn unix_seconds(&self) -> i64 {
        i64::from(self.sec) + SECS_BEFORE_1990
    }

    /// Convert a Unix timestamp into the 1990 epoch. Times before 1990
    /// clamp to the epoch.
    pub fn from_unix_seconds(secs: i64) -> Self {
        let rel = (secs - SECS_BEFORE_1990).max(0);
        NSec { sec: rel as u32, nsec: 0 }
    }

    /// The value as a UTC wall-clock time.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.unix_seconds(), self.nsec).single()
    }

    /// Quoted record timestamp in the form `"YYYY-MM-DD HH:MM:SS.mmm"`
    /// used in data file rows.
    pub fn record_timestamp(&self) -> String {
        match self.to_utc() {
            Some(utc) => format!("\"{}\"", utc.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => String::from("\"0000-00-00 00:00:00.000\""),
        }
    }

    /// Compact timestamp `YYYYMMDD_HHMMSS` used in finalized data file
    /// names.
    pub fn file_timestamp(&self) -> Option<String> {
        if self.is_zero() {
            return None;
        }
        self.to_utc().map(|utc| utc.format("%Y%m%d_%H%M%S").to_string())
    }
}

impl Add for NSec {
    type Output = NSec;

    fn add(self, other: NSec) -> NSec {
        let mut sum = NSec {
            sec: self.sec.wrapping_add(other.sec),
            nsec: self.nsec + other.nsec,
        };
        sum.normalize();
        sum
    }
}

impl AddAssign for NSec {
    fn add_assign(&mut self, other: NSec) {
        *self = *self + other;
    }
}

impl PartialOrd for NSec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NSec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then(self.nsec.cmp(&other.nsec))
    }
}

impl fmt::Display for NSec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_identity() {
        let t = NSec::new(1_000, 500);
        assert_eq!(t + NSec::zero(), t);
    }

    #[test]
    fn nanosecond_carry() {
        let t = NSec::new(10, NANOS_PER_SEC - 1);
        let sum = t + NSec::new(0, 1);
        assert_eq!(sum, NSec::new(11, 0));

        // Adding one more nanosecond keeps the original nsec component
        // offset by one full second.
        let base = NSec::new(5, 250);
        let bumped = base + NSec::new(0, NANOS_PER_SEC - 1) + NSec::new(0, 1);
        assert_eq!(bumped.sec, base.sec + 1);
        assert_eq!(bumped.nsec, base.nsec);
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(NSec::new(1, 0) < NSec::new(2, 0));
        assert!(NSec::new(1, 5) < NSec::new(1, 6));
        assert!(NSec::new(2, 0) > NSec::new(1, 999_999_999));
        assert_eq!(NSec::new(3, 3).cmp(&NSec::new(3, 3)), Ordering::Equal);
    }

    #[test]
    fn epoch_conversion() {
        // 1990-01-01 00:00:00 UTC
        assert_eq!(NSec::zero().unix_seconds(), SECS_BEFORE_1990);
        let t = NSec::from_unix_seconds(SECS_BEFORE_1990 + 86_400);
        assert_eq!(t.sec, 86_400);
        // Pre-epoch clamps instead of wrapping
        assert_eq!(NSec::from_unix_seconds(0), NSec::zero());
    }

    #[test]
    fn record_timestamp_format() {
        // 86400 s after the epoch, 123 ms in
        let t = NSec::new(86_400, 123_000_000);
        assert_eq!(t.record_timestamp(), "\"1990-01-02 00:00:00.123\"");
    }

    #[test]
    fn file_timestamp_format() {
        let t = NSec::new(86_400 + 3_661, 0);
        assert_eq!(t.file_timestamp().as_deref(), Some("19900102_010101"));
        assert_eq!(NSec::zero().file_timestamp(), None);
    }
}
