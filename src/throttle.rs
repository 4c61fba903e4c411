//! Admission control for retries and hedging.

use std::sync::Mutex;
use tracing::debug;

/// Entries are scaled by 1000 so three fractional digits of the token
/// ratio can be represented without floating-point arithmetic.
const SCALE: i64 = 1000;

/// A token bucket deciding whether retry and hedge attempts are permitted.
///
/// Each failure drains one token, each success refunds `token_ratio`
/// tokens. Attempts are admitted only while more than half of the bucket
/// remains, so a run of failures cuts retry traffic off quickly while
/// steady successes restore it.
///
/// One throttle exists per transport; it is shared by every RPC running on
/// it and is safe to call from any task. The critical section only updates
/// the counter, so a `std::sync::Mutex` is used rather than the async one.
///
/// See: <https://github.com/grpc/proposal/blob/master/A6-client-retries.md#throttling-retry-attempts-and-hedged-rpcs>
#[derive(Debug)]
pub struct RetryThrottle {
    /// Current token count, scaled. Kept in `[0, max_scaled]`.
    tokens_scaled: Mutex<i64>,
    max_scaled: i64,
    threshold_scaled: i64,
    ratio_scaled: i64,
}

impl RetryThrottle {
    /// Creates a throttle with a full bucket.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= max_tokens <= 1000` and `token_ratio >= 0.001`.
    /// `token_ratio` is kept with three decimal digits of precision.
    pub fn new(max_tokens: u64, token_ratio: f64) -> Self {
        assert!(
            (1..=1000).contains(&max_tokens),
            "max_tokens must be in [1, 1000]"
        );
        let ratio_scaled = (token_ratio * SCALE as f64).round() as i64;
        assert!(ratio_scaled >= 1, "token_ratio must be at least 0.001");

        let max_scaled = max_tokens as i64 * SCALE;
        Self {
            tokens_scaled: Mutex::new(max_scaled),
            max_scaled,
            threshold_scaled: max_scaled / 2,
            ratio_scaled,
        }
    }

    /// Records a successful attempt, refunding `token_ratio` tokens.
    pub fn record_success(&self) {
        let mut tokens = self.tokens_scaled.lock().unwrap();
        *tokens = (*tokens + self.ratio_scaled).min(self.max_scaled);
    }

    /// Records a failed attempt, draining one token.
    ///
    /// Returns `true` if retries are throttled as a result.
    pub fn record_failure(&self) -> bool {
        let mut tokens = self.tokens_scaled.lock().unwrap();
        *tokens = (*tokens - SCALE).max(0);
        let throttled = *tokens <= self.threshold_scaled;
        if throttled {
            debug!(tokens = *tokens, threshold = self.threshold_scaled, "retries throttled");
        }
        throttled
    }

    /// Whether a retry or hedge attempt may be made right now.
    pub fn is_retry_permitted(&self) -> bool {
        *self.tokens_scaled.lock().unwrap() > self.threshold_scaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn threshold_walk() {
        // max 10 tokens, ratio 0.1: start at 10_000 scaled, threshold 5_000.
        let throttle = RetryThrottle::new(10, 0.1);
        assert!(throttle.is_retry_permitted());

        for i in 0..5 {
            let throttled = throttle.record_failure();
            // The fifth failure lands exactly on the threshold.
            assert_eq!(throttled, i == 4);
        }
        assert!(!throttle.is_retry_permitted());

        // One success refunds 100 scaled tokens: 5_100 > 5_000.
        throttle.record_success();
        assert!(throttle.is_retry_permitted());
    }

    #[test]
    fn tokens_clamp_at_zero() {
        let throttle = RetryThrottle::new(1, 1.0);
        for _ in 0..10 {
            throttle.record_failure();
        }
        assert!(!throttle.is_retry_permitted());
        // A single success from zero must not overshoot past one ratio.
        throttle.record_success();
        assert_eq!(*throttle.tokens_scaled.lock().unwrap(), 1000);
    }

    #[test]
    fn tokens_clamp_at_max() {
        let throttle = RetryThrottle::new(2, 1.0);
        throttle.record_success();
        throttle.record_success();
        assert_eq!(*throttle.tokens_scaled.lock().unwrap(), 2000);
    }

    #[test]
    fn success_never_decreases_failure_never_increases() {
        let throttle = RetryThrottle::new(5, 0.3);
        let read = |t: &RetryThrottle| *t.tokens_scaled.lock().unwrap();

        let before = read(&throttle);
        throttle.record_success();
        assert!(read(&throttle) >= before);

        let before = read(&throttle);
        throttle.record_failure();
        assert!(read(&throttle) <= before);
    }

    #[test]
    fn fractional_ratio_keeps_three_digits() {
        let throttle = RetryThrottle::new(10, 0.123);
        throttle.record_failure();
        throttle.record_success();
        assert_eq!(*throttle.tokens_scaled.lock().unwrap(), 10_000 - 1000 + 123);
    }

    #[test]
    fn throttling_is_logged() {
        #[derive(Clone, Default)]
        struct Capture {
            buffer: Arc<Mutex<Vec<u8>>>,
        }

        impl std::io::Write for Capture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.buffer.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
            type Writer = Capture;

            fn make_writer(&'a self) -> Capture {
                self.clone()
            }
        }

        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(capture.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let throttle = RetryThrottle::new(1, 1.0);
            assert!(throttle.record_failure());
        });

        let logs = String::from_utf8(capture.buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("retries throttled"), "missing log line: {logs}");
    }

    #[test]
    #[should_panic(expected = "max_tokens")]
    fn zero_max_tokens_is_rejected() {
        let _ = RetryThrottle::new(0, 0.5);
    }

    #[test]
    #[should_panic(expected = "token_ratio")]
    fn vanishing_ratio_is_rejected() {
        let _ = RetryThrottle::new(10, 0.0001);
    }
}
