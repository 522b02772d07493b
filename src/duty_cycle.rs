//! Percentage handling and the active/idle split used by busy-loop generators.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Default length of one duty-cycle slice.
pub const DEFAULT_SLICE: Duration = Duration::from_millis(100);

/// Load percentage, always within `0..=100`.
///
/// Out-of-range input is clamped, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
#[serde(transparent)]
pub struct Percentage(f64);

impl Percentage {
    pub const ZERO: Percentage = Percentage(0.0);
    pub const FULL: Percentage = Percentage(100.0);

    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        Percentage(value.clamp(0.0, 100.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Fraction in `0.0..=1.0`.
    pub fn ratio(self) -> f64 {
        self.0 / 100.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }
}

impl From<f64> for Percentage {
    fn from(value: f64) -> Self {
        Percentage::clamped(value)
    }
}

impl From<u32> for Percentage {
    fn from(value: u32) -> Self {
        Percentage::clamped(value as f64)
    }
}

impl<'de> Deserialize<'de> for Percentage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Percentage::clamped)
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Work/idle split of one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycle {
    pub active: Duration,
    pub idle: Duration,
}

impl DutyCycle {
    /// `active = interval * pct / 100`, `idle = interval - active`.
    pub fn new(percentage: Percentage, interval: Duration) -> Self {
        let active = if percentage.is_zero() {
            Duration::ZERO
        } else {
            // Any non-zero load gets at least one tick of work.
            let nanos = (interval.as_nanos() as f64 * percentage.ratio()).round() as u64;
            Duration::from_nanos(nanos.max(1)).min(interval)
        };
        DutyCycle {
            active,
            idle: interval - active,
        }
    }

    pub fn interval(&self) -> Duration {
        self.active + self.idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_percent_is_pure_idle() {
        let dc = DutyCycle::new(Percentage::ZERO, DEFAULT_SLICE);
        assert_eq!(dc.active, Duration::ZERO);
        assert_eq!(dc.idle, DEFAULT_SLICE);
    }

    #[test]
    fn full_load_never_idles() {
        let dc = DutyCycle::new(Percentage::FULL, DEFAULT_SLICE);
        assert_eq!(dc.active, DEFAULT_SLICE);
        assert_eq!(dc.idle, Duration::ZERO);
    }

    #[test]
    fn seventy_percent_split() {
        let dc = DutyCycle::new(Percentage::from(70u32), DEFAULT_SLICE);
        assert_eq!(dc.active, Duration::from_millis(70));
        assert_eq!(dc.idle, Duration::from_millis(30));
    }

    #[test]
    fn out_of_range_is_clamped() {
        assert_eq!(Percentage::clamped(150.0), Percentage::FULL);
        assert_eq!(Percentage::clamped(-3.0), Percentage::ZERO);
        assert_eq!(Percentage::clamped(f64::NAN), Percentage::ZERO);
    }

    #[test]
    fn deserialize_clamps() {
        let p: Percentage = serde_json::from_str("150").unwrap();
        assert_eq!(p, Percentage::FULL);
    }

    proptest! {
        #[test]
        fn slice_is_preserved(pct in 0.0f64..=100.0, ms in 1u64..2_000) {
            let interval = Duration::from_millis(ms);
            let dc = DutyCycle::new(Percentage::clamped(pct), interval);
            prop_assert_eq!(dc.interval(), interval);
        }

        #[test]
        fn active_zero_iff_percentage_zero(pct in 0.0f64..=100.0) {
            let p = Percentage::clamped(pct);
            let dc = DutyCycle::new(p, DEFAULT_SLICE);
            prop_assert_eq!(dc.active.is_zero(), p.is_zero());
        }

        #[test]
        fn clamp_stays_in_range(v in proptest::num::f64::ANY) {
            let p = Percentage::clamped(v).value();
            prop_assert!((0.0..=100.0).contains(&p));
        }
    }
}
