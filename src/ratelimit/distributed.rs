//! Distributed limiter store backed by Redis.
//!
//! This module provides a limiter store whose state lives in Redis, so every
//! process pointed at the same server shares one budget per key. The store
//! holds no mutable state of its own. Atomicity comes from running each
//! decision as a single Lua script, and cleanup from key expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::LimiterStore;
use super::clock::{Clock, SystemClock};
use super::limit::{Decision, Limit};
use super::runner::{RedisScriptRunner, ScriptRunner};
use super::scripts::ScriptKind;
use crate::config::RedisStoreConfig;
use crate::error::{GatekeeperError, Result};

/// The algorithm a [`RedisStore`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// GET then INCRBY on a per-window counter. Cheapest option. Concurrent
    /// callers can both pass the GET, and up to `2 * burst` requests can land
    /// across a window edge. Every increment also pushes the key's expiry out
    /// by a full period, so a denial's `retry_after` (the key's remaining TTL)
    /// can overstate the wait by up to one period when the last admitted
    /// request landed near the end of its window.
    Counter,
    /// Token bucket hash updated by one script call.
    #[default]
    TokenBucket,
    /// Exact sliding window over a sorted set of hits.
    SlidingWindow,
    /// Per-window counter whose check and increment run as one script.
    /// The window is the configured default TTL.
    FixedWindow,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::Counter => "counter",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
        };
        f.write_str(name)
    }
}

/// A limiter store whose state lives in Redis.
///
/// Every backend failure, timeout or unexpected reply admits the request.
/// Rate limiting degrades to no limiting rather than blocking all traffic
/// when Redis is unreachable.
pub struct RedisStore<R: ScriptRunner = RedisScriptRunner> {
    runner: R,
    key_prefix: String,
    algorithm: Algorithm,
    default_ttl: Duration,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisStore<RedisScriptRunner> {
    /// Connect to the Redis server named in `config`.
    ///
    /// An unreachable server is an error here, bounded by the connect
    /// timeout. Only decisions fail open.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        config.validate()?;
        let runner = RedisScriptRunner::connect(&config.url, config.connect_timeout()).await?;
        Self::with_runner(runner, config, Arc::new(SystemClock))
    }
}

impl<R: ScriptRunner> RedisStore<R> {
    /// Build a store over any script runner.
    pub fn with_runner(runner: R, config: &RedisStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runner,
            key_prefix: config.key_prefix.clone(),
            algorithm: config.algorithm,
            default_ttl: config.default_ttl(),
            timeout: config.timeout(),
            clock,
        })
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The underlying runner.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Redis key for the token bucket and sliding window state: `prefix+key`.
    pub fn state_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Redis key for a fixed window: `prefix+key+":"+floor(now/window)`.
    pub fn window_key(&self, key: &str, window: Duration, now: Duration) -> String {
        let index = now.as_millis() / window.as_millis().max(1);
        format!("{}{}:{}", self.key_prefix, key, index)
    }

    async fn decide(&self, key: &str, limit: Limit, cost: u32, now: Duration) -> Result<Decision> {
        match self.algorithm {
            Algorithm::Counter => self.counter(key, limit, cost, now).await,
            Algorithm::TokenBucket => self.token_bucket(key, limit, cost, now).await,
            Algorithm::SlidingWindow => self.sliding_window(key, limit, cost, now).await,
            Algorithm::FixedWindow => self.fixed_window(key, limit, cost, now).await,
        }
    }

    async fn counter(&self, key: &str, limit: Limit, cost: u32, now: Duration) -> Result<Decision> {
        let period = limit.period();
        let window_key = self.window_key(key, period, now);

        let count = self.runner.get_count(&window_key).await?;
        if count >= i64::from(limit.burst()) {
            let retry_after = match self.runner.remaining_ttl(&window_key).await {
                Ok(Some(ttl)) => ttl,
                Ok(None) => period,
                Err(e) => {
                    debug!(key = %window_key, error = %e, "TTL lookup failed, using window period");
                    period
                }
            };
            return Ok(Decision::deny(retry_after));
        }

        self.runner.incr_with_expiry(&window_key, cost, period).await?;
        Ok(Decision::allow())
    }

    async fn token_bucket(&self, key: &str, limit: Limit, cost: u32, now: Duration) -> Result<Decision> {
        let args = [
            limit.tokens_per_period().to_string(),
            limit.burst().to_string(),
            limit.period().as_millis().to_string(),
            cost.to_string(),
            now.as_millis().to_string(),
        ];
        let reply = self
            .runner
            .eval(ScriptKind::TokenBucket, &[self.state_key(key)], &args)
            .await?;
        decode_reply(ScriptKind::TokenBucket, &reply)
    }

    async fn sliding_window(&self, key: &str, limit: Limit, cost: u32, now: Duration) -> Result<Decision> {
        let args = [
            limit.burst().to_string(),
            limit.period().as_millis().to_string(),
            now.as_millis().to_string(),
            cost.to_string(),
            rand::random::<u64>().to_string(),
        ];
        let reply = self
            .runner
            .eval(ScriptKind::SlidingWindow, &[self.state_key(key)], &args)
            .await?;
        decode_reply(ScriptKind::SlidingWindow, &reply)
    }

    async fn fixed_window(&self, key: &str, limit: Limit, cost: u32, now: Duration) -> Result<Decision> {
        let window = self.default_ttl;
        let args = [
            limit.burst().to_string(),
            cost.to_string(),
            window.as_millis().to_string(),
        ];
        let reply = self
            .runner
            .eval(ScriptKind::FixedWindow, &[self.window_key(key, window, now)], &args)
            .await?;
        decode_reply(ScriptKind::FixedWindow, &reply)
    }
}

/// Turn a `{allowed, retry_after_ms}` script reply into a decision.
fn decode_reply(script: ScriptKind, reply: &[i64]) -> Result<Decision> {
    match reply {
        [1, _] => Ok(Decision::allow()),
        [0, retry_ms] => Ok(Decision::deny(Duration::from_millis(
            u64::try_from(*retry_ms).unwrap_or(0),
        ))),
        other => Err(GatekeeperError::MalformedReply(format!(
            "{} script returned {:?}",
            script, other
        ))),
    }
}

impl<R: ScriptRunner> std::fmt::Debug for RedisStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("algorithm", &self.algorithm)
            .field("default_ttl", &self.default_ttl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl<R: ScriptRunner> LimiterStore for RedisStore<R> {
    async fn allow_n(&self, key: &str, limit: Limit, cost: u32) -> Decision {
        let cost = limit.clamp_cost(cost);
        let now = self.clock.now();

        let outcome = match tokio::time::timeout(self.timeout, self.decide(key, limit, cost, now)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatekeeperError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(decision) => {
                trace!(
                    key = %key,
                    algorithm = %self.algorithm,
                    cost = cost,
                    allowed = decision.allowed,
                    "Checked distributed rate limit"
                );
                if !decision.allowed {
                    debug!(
                        key = %key,
                        algorithm = %self.algorithm,
                        retry_after = ?decision.retry_after,
                        "Distributed rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                warn!(
                    key = %key,
                    algorithm = %self.algorithm,
                    error = %e,
                    "Rate limit backend failed, admitting request"
                );
                Decision::allow()
            }
        }
    }
}
