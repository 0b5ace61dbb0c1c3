//! Limit specifications and admission decisions.

use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// The shape of a rate limit: a sustained rate and the bucket size.
///
/// A `Limit` is always valid once constructed. Callers are expected to build
/// it when their configuration is loaded, so a bad rate is rejected there and
/// never reaches the hot path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    /// Tokens added per second
    rate: f64,
    /// Maximum number of tokens the bucket holds
    burst: u32,
}

impl Limit {
    /// Create a new limit, rejecting `rate <= 0`, a non-finite rate and `burst == 0`.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(GatekeeperError::Config(format!(
                "rate must be a positive number, got {}",
                rate
            )));
        }
        if burst < 1 {
            return Err(GatekeeperError::Config(
                "burst must be at least 1".to_string(),
            ));
        }
        Ok(Self { rate, burst })
    }

    /// Tokens refilled per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Clamp a request cost into `[1, burst]`.
    ///
    /// A cost above `burst` could never be satisfied, so it is treated as a
    /// request for the whole bucket instead of being denied forever.
    pub fn clamp_cost(&self, cost: u32) -> u32 {
        cost.clamp(1, self.burst)
    }

    /// The window length used by the Redis algorithms: `max(1, floor(1/rate))` seconds.
    pub fn period(&self) -> Duration {
        let secs = (1.0 / self.rate).floor().max(1.0);
        Duration::from_secs(secs as u64)
    }

    /// Tokens refilled over one [`period`](Self::period).
    pub fn tokens_per_period(&self) -> f64 {
        self.rate * self.period().as_secs_f64()
    }

    /// Time needed to accrue `missing` tokens.
    pub fn time_to_refill(&self, missing: f64) -> Duration {
        let secs = missing.max(0.0) / self.rate;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// The outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Advisory wait before retrying; zero when allowed
    pub retry_after: Duration,
}

impl Decision {
    /// An admitting decision.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    /// A denying decision with an advisory retry delay.
    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_rejects_invalid_rate() {
        assert!(Limit::new(0.0, 10).is_err());
        assert!(Limit::new(-1.0, 10).is_err());
        assert!(Limit::new(f64::NAN, 10).is_err());
        assert!(Limit::new(f64::INFINITY, 10).is_err());
    }

    #[test]
    fn test_limit_rejects_zero_burst() {
        let err = Limit::new(1.0, 0).unwrap_err();
        assert!(matches!(err, GatekeeperError::Config(_)));
    }

    #[test]
    fn test_clamp_cost() {
        let limit = Limit::new(10.0, 5).unwrap();
        assert_eq!(limit.clamp_cost(0), 1);
        assert_eq!(limit.clamp_cost(3), 3);
        assert_eq!(limit.clamp_cost(50), 5);
    }

    #[test]
    fn test_period() {
        assert_eq!(Limit::new(10.0, 1).unwrap().period(), Duration::from_secs(1));
        assert_eq!(Limit::new(1.0, 1).unwrap().period(), Duration::from_secs(1));
        assert_eq!(Limit::new(0.5, 1).unwrap().period(), Duration::from_secs(2));
        assert_eq!(Limit::new(0.1, 1).unwrap().period(), Duration::from_secs(10));
    }

    #[test]
    fn test_tokens_per_period() {
        let limit = Limit::new(0.1, 1).unwrap();
        assert!((limit.tokens_per_period() - 1.0).abs() < 1e-9);

        let limit = Limit::new(10.0, 1).unwrap();
        assert!((limit.tokens_per_period() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_to_refill() {
        let limit = Limit::new(2.0, 4).unwrap();
        assert_eq!(limit.time_to_refill(1.0), Duration::from_millis(500));
        assert_eq!(limit.time_to_refill(-3.0), Duration::ZERO);
    }

    #[test]
    fn test_decision_constructors() {
        assert_eq!(Decision::allow().retry_after, Duration::ZERO);
        assert!(Decision::allow().allowed);

        let denied = Decision::deny(Duration::from_secs(1));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));
    }
}
