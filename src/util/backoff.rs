//! Bounded backoff for the worker poll loops.

use std::hint::spin_loop;
use std::thread;
use std::time::Duration;

/// Escalating idle strategy: spin, then yield, then park with a capped
/// timeout. Reset whenever the caller makes progress.
///
/// Parking uses `park_timeout`, so an `unpark` aimed at the idling thread
/// cuts the wait short.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    max_park: Duration,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 16;

    /// Create a backoff that never parks longer than `max_park` per step.
    pub fn new(max_park: Duration) -> Self {
        Self { step: 0, max_park }
    }

    /// Return to the spinning phase.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Perform one idle step.
    pub fn idle(&mut self) {
        let step = self.step;
        self.step = self.step.saturating_add(1);

        if step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << step.min(Self::SPIN_LIMIT)) {
                spin_loop();
            }
        } else if step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::park_timeout(self.max_park);
        }
    }

    /// Whether the next idle step would park.
    pub fn is_parking(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut backoff = Backoff::new(Duration::from_micros(10));

        assert!(!backoff.is_parking());

        for _ in 0..=Backoff::YIELD_LIMIT {
            backoff.idle();
        }

        assert!(backoff.is_parking());
        // must still return promptly with a tiny cap
        backoff.idle();
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_micros(10));

        for _ in 0..32 {
            backoff.idle();
        }
        assert!(backoff.is_parking());

        backoff.reset();
        assert!(!backoff.is_parking());
    }
}
