use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// A point on the recording timeline, in seconds and nanoseconds since the
/// epoch of the recording.  Ordering is lexicographic over `(sec, nsec)`,
/// which the derived impls provide as long as the field order stays put.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, nsec: 0 };

    /// Builds a timestamp from possibly denormalized parts, carrying excess
    /// nanoseconds into seconds.
    pub fn new(sec: i64, nsec: i64) -> Timestamp {
        Self::from_total_nanos(sec as i128 * NANOS_PER_SEC + nsec as i128)
    }

    pub fn from_total_nanos(total: i128) -> Timestamp {
        let sec = total.div_euclid(NANOS_PER_SEC);
        let nsec = total.rem_euclid(NANOS_PER_SEC);
        Timestamp {
            sec: sec as i64,
            nsec: nsec as u32,
        }
    }

    pub fn total_nanos(&self) -> i128 {
        self.sec as i128 * NANOS_PER_SEC + self.nsec as i128
    }

    pub fn add_nanos(self, nanos: i64) -> Timestamp {
        Self::from_total_nanos(self.total_nanos() + nanos as i128)
    }

    pub fn add_duration(self, d: Duration) -> Timestamp {
        Self::from_total_nanos(self.total_nanos() + d.as_nanos() as i128)
    }

    /// Signed distance from `earlier` to `self` in nanoseconds.
    pub fn nanos_since(&self, earlier: Timestamp) -> i128 {
        self.total_nanos() - earlier.total_nanos()
    }

    pub fn clamp_to(self, lo: Timestamp, hi: Timestamp) -> Timestamp {
        if self < lo {
            lo
        } else if self > hi {
            hi
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_excess_nanos() {
        let t = Timestamp::new(1, 1_500_000_000);
        assert_eq!(t, Timestamp { sec: 2, nsec: 500_000_000 });

        let t = Timestamp::new(1, -1);
        assert_eq!(t, Timestamp { sec: 0, nsec: 999_999_999 });
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Timestamp { sec: 1, nsec: 999_999_999 };
        let b = Timestamp { sec: 2, nsec: 0 };
        let c = Timestamp { sec: 2, nsec: 1 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn arithmetic_round_trips() {
        let t = Timestamp { sec: 41, nsec: 999_999_999 };
        assert_eq!(t.add_nanos(1), Timestamp { sec: 42, nsec: 0 });
        assert_eq!(t.add_nanos(1).add_nanos(-1), t);
        assert_eq!(t.add_nanos(1).nanos_since(t), 1);
    }

    #[test]
    fn clamps_into_bounds() {
        let lo = Timestamp { sec: 0, nsec: 0 };
        let hi = Timestamp { sec: 100, nsec: 0 };
        assert_eq!(Timestamp { sec: 150, nsec: 0 }.clamp_to(lo, hi), hi);
        assert_eq!(Timestamp { sec: -10, nsec: 0 }.clamp_to(lo, hi), lo);
        let mid = Timestamp { sec: 42, nsec: 7 };
        assert_eq!(mid.clamp_to(lo, hi), mid);
    }
}
