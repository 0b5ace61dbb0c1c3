//! Per-key token bucket state for the in-memory store.

use std::time::Duration;

use super::limit::{Decision, Limit};

/// Token bucket record for a single key.
///
/// All arithmetic is floating point. The token count is clamped to
/// `[0, burst]` after every update so rounding drift can never produce a
/// negative or over-full bucket.
#[derive(Debug, Clone)]
pub struct BucketState {
    /// Tokens currently available
    tokens: f64,
    /// Clock reading of the last refill
    last_refill: Duration,
    /// The limit this bucket was shaped for
    limit: Limit,
}

impl BucketState {
    /// Create a full bucket for `limit`.
    pub fn new(limit: Limit, now: Duration) -> Self {
        Self {
            tokens: f64::from(limit.burst()),
            last_refill: now,
            limit,
        }
    }

    /// Whether this bucket was created for `limit`.
    pub fn matches(&self, limit: &Limit) -> bool {
        self.limit == *limit
    }

    /// Add the tokens accrued since the last refill and move the anchor to `now`.
    pub fn refill(&mut self, now: Duration) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.set_tokens(self.tokens + elapsed * self.limit.rate());
        self.last_refill = now;
    }

    /// Refill, then try to take `cost` tokens.
    ///
    /// On denial the bucket keeps its tokens and the decision carries the time
    /// until `cost` tokens will be available.
    pub fn try_consume(&mut self, cost: u32, now: Duration) -> Decision {
        self.refill(now);

        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.set_tokens(self.tokens - cost);
            Decision::allow()
        } else {
            Decision::deny(self.limit.time_to_refill(cost - self.tokens))
        }
    }

    /// Whether the bucket has seen no traffic for at least `ttl`.
    pub fn is_idle(&self, now: Duration, ttl: Duration) -> bool {
        now.saturating_sub(self.last_refill) >= ttl
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Clock reading of the last refill.
    pub fn last_refill(&self) -> Duration {
        self.last_refill
    }

    /// The limit this bucket was shaped for.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    fn set_tokens(&mut self, tokens: f64) {
        self.tokens = tokens.clamp(0.0, f64::from(self.limit.burst()));
    }
}
