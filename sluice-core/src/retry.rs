use std::time::Duration;

use derive_builder::Builder;

/// Exponential backoff with a bounded interval and a bounded number of attempts.
///
/// Each time an operation fails the next attempt waits an increasing period of time, up to
/// `max_interval`. See <https://docs.rs/backoff/latest/backoff/> for more details.
#[derive(Debug, Clone, Copy, PartialEq, Builder)]
#[builder(default, build_fn(error = "anyhow::Error"))]
pub struct RetryParams {
    /// Wait before the first retry
    pub initial_interval: Duration,
    /// Upper bound of a single wait
    pub max_interval: Duration,
    /// The factor by which the interval is multiplied on each retry attempt
    pub multiplier: f64,
    /// Introduces randomness to avoid retry storms
    pub randomization_factor: f64,
    /// Retries allowed before giving up
    pub max_attempts: usize,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_attempts: 5,
        }
    }
}

impl RetryParams {
    pub fn builder() -> RetryParamsBuilder {
        RetryParamsBuilder::default()
    }

    /// Millisecond intervals without jitter.
    pub fn for_test() -> Self {
        Self {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_attempts: 3,
        }
    }

    /// Never gives up on elapsed time; the attempt budget is enforced by the caller.
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::default()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn test_interval_is_bounded() {
        let params = RetryParams::builder()
            .initial_interval(Duration::from_millis(100))
            .max_interval(Duration::from_millis(300))
            .randomization_factor(0.0)
            .build()
            .unwrap();
        let mut backoff = params.backoff();
        let waits: Vec<Duration> = (0..4).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }
}
