/// Rolling window of probe outcomes and the health verdict derived from it
use super::{DEFAULT_FALL, DEFAULT_RISE, DEFAULT_SAMPLES};
use crate::core::Health;
use std::collections::VecDeque;

/// Pass ratio at or above which a passing sample makes the node GOOD
const GOOD_RATIO: f64 = 0.8;
/// Pass ratio below which a failing sample makes the node BAD
const BAD_RATIO: f64 = 0.5;

/// Fixed-size window of pass/fail samples.
///
/// The verdict blends the latest sample with the history:
///
/// * latest passed and (ratio >= 0.8 or at least `rise` passes in a row) => GOOD
/// * latest failed and (ratio < 0.5 or at least `fall` failures in a row) => BAD
/// * anything else => MEDIUM
/// * no samples yet => UNKNOWN
///
/// The ratio counts every sample in the window, the latest included.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<bool>,
    capacity: usize,
    passes: usize,
    streak: usize,
    rise: usize,
    fall: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize, rise: usize, fall: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            passes: 0,
            streak: 0,
            rise: rise.max(1),
            fall: fall.max(1),
        }
    }

    /// Record a sample and return the new verdict
    pub fn record(&mut self, passed: bool) -> Health {
        match self.samples.back() {
            Some(&last) if last == passed => self.streak += 1,
            _ => self.streak = 1,
        }

        if self.samples.len() == self.capacity {
            if let Some(true) = self.samples.pop_front() {
                self.passes -= 1;
            }
        }
        self.samples.push_back(passed);
        if passed {
            self.passes += 1;
        }

        self.verdict()
    }

    pub fn verdict(&self) -> Health {
        let Some(&latest) = self.samples.back() else {
            return Health::Unknown;
        };

        let ratio = self.pass_ratio();
        if latest {
            if ratio >= GOOD_RATIO || self.streak >= self.rise {
                return Health::Good;
            }
        } else if ratio < BAD_RATIO || self.streak >= self.fall {
            return Health::Bad;
        }
        Health::Medium
    }

    pub fn pass_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.passes as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES, DEFAULT_RISE, DEFAULT_FALL)
    }
}
