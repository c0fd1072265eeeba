//! Validity windows and confidence decay
//!
//! All timestamps in the knowledge model are epoch milliseconds. A record's
//! validity window is `[valid_from, valid_to]`, both ends inclusive, with a
//! missing end treated as unbounded.

use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Records that carry a validity window
pub trait Temporal {
    fn valid_from(&self) -> Option<i64>;
    fn valid_to(&self) -> Option<i64>;

    /// True unless both ends are set and `valid_from > valid_to`
    fn has_valid_time_range(&self) -> bool {
        match (self.valid_from(), self.valid_to()) {
            (Some(from), Some(to)) => from <= to,
            _ => true,
        }
    }

    /// Whether the record is in force at `timestamp`
    fn is_valid_at(&self, timestamp: i64) -> bool {
        self.valid_from().is_none_or(|from| from <= timestamp)
            && self.valid_to().is_none_or(|to| timestamp <= to)
    }
}

/// Parameters for exponential confidence decay
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecayOptions {
    /// Age in days at which confidence halves
    pub half_life_days: f64,
    /// Decayed confidence never drops below this floor
    pub min_confidence: f64,
    /// Time the decay is computed against; defaults to now
    pub reference_time: Option<i64>,
}

impl Default for DecayOptions {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            min_confidence: 0.1,
            reference_time: None,
        }
    }
}

impl DecayOptions {
    pub fn with_half_life_days(mut self, days: f64) -> Self {
        self.half_life_days = days;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn at(mut self, reference_time: i64) -> Self {
        self.reference_time = Some(reference_time);
        self
    }

    /// `confidence * 0.5^(age / half_life)`, floored at `min_confidence`.
    ///
    /// Ages in the future count as zero. A non-positive half-life disables
    /// decay.
    pub fn decay(&self, confidence: f64, age_millis: i64) -> f64 {
        if self.half_life_days <= 0.0 {
            return confidence;
        }
        let age_days = age_millis.max(0) as f64 / MILLIS_PER_DAY;
        let decayed = confidence * 0.5_f64.powf(age_days / self.half_life_days);
        // an original confidence below the floor is left as is
        decayed.max(self.min_confidence.min(confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Window(Option<i64>, Option<i64>);

    impl Temporal for Window {
        fn valid_from(&self) -> Option<i64> {
            self.0
        }
        fn valid_to(&self) -> Option<i64> {
            self.1
        }
    }

    #[test]
    fn test_time_range() {
        assert!(Window(None, None).has_valid_time_range());
        assert!(Window(Some(5), None).has_valid_time_range());
        assert!(Window(Some(5), Some(5)).has_valid_time_range());
        assert!(!Window(Some(6), Some(5)).has_valid_time_range());
    }

    #[test]
    fn test_is_valid_at_is_inclusive() {
        let window = Window(Some(10), Some(20));
        assert!(!window.is_valid_at(9));
        assert!(window.is_valid_at(10));
        assert!(window.is_valid_at(20));
        assert!(!window.is_valid_at(21));
        assert!(Window(None, None).is_valid_at(0));
    }

    #[test]
    fn test_decay_halves_at_half_life() {
        let opts = DecayOptions::default().with_half_life_days(10.0).with_min_confidence(0.0);
        let ten_days = (10.0 * MILLIS_PER_DAY) as i64;

        assert!((opts.decay(0.8, ten_days) - 0.4).abs() < 1e-9);
        assert!((opts.decay(0.8, 0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_decay_floor() {
        let opts = DecayOptions::default().with_half_life_days(1.0).with_min_confidence(0.2);
        let year = (365.0 * MILLIS_PER_DAY) as i64;

        assert!((opts.decay(0.9, year) - 0.2).abs() < 1e-9);
        // below the floor to begin with
        assert!((opts.decay(0.05, year) - 0.05).abs() < 1e-9);
    }
}
