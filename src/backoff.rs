//! Connection backoff.

use rand::Rng;
use std::time::Duration;

/// A stateful iterator yielding progressively longer, jittered delays
/// between reconnect attempts.
///
/// The defaults follow the standard connection backoff parameters: 1s
/// initial delay, 1.6x growth, ±20% jitter, capped at 120s. After a
/// connection succeeds the owner calls [`Backoff::reset`] so the next
/// failure starts over from the initial delay.
///
/// See: <https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md>
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    jitter: f64,
    max: Duration,
    /// The unjittered delay the next call to `next_delay` is based on.
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.6, 0.2, Duration::from_secs(120))
    }
}

impl Backoff {
    /// Creates a backoff iterator.
    ///
    /// # Panics
    ///
    /// Panics if `multiplier < 1.0` or `jitter` is outside `[0, 1)`.
    pub fn new(initial: Duration, multiplier: f64, jitter: f64, max: Duration) -> Self {
        assert!(multiplier >= 1.0, "backoff must not shrink");
        assert!((0.0..1.0).contains(&jitter), "jitter must be in [0, 1)");
        Self {
            initial,
            multiplier,
            jitter,
            max,
            next: initial,
        }
    }

    /// The next delay to sleep before reconnecting.
    ///
    /// Advances the internal state, so consecutive calls yield growing
    /// delays until the cap is hit.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        let grown = base.as_secs_f64() * self.multiplier;
        self.next = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));

        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Restarts the schedule from the initial delay. Called after a
    /// connection attempt succeeds.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_up_to_the_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            2.0,
            0.0,
            Duration::from_secs(8),
        );
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            2.0,
            0.0,
            Duration::from_secs(60),
        );
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(
            Duration::from_secs(10),
            1.0,
            0.2,
            Duration::from_secs(60),
        );
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(8), "{delay:?} below jitter floor");
            assert!(delay <= Duration::from_secs(12), "{delay:?} above jitter ceiling");
        }
    }
}
