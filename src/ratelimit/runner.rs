//! Execution of distributed limiter operations against a remote store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{info, trace, warn};

use super::scripts::ScriptKind;
use crate::error::{GatekeeperError, Result};

/// The operations the distributed store needs from its backing store.
///
/// Script evaluation must be atomic. The plain counter operations need not
/// be; the counter algorithm documents the race it accepts.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `script` atomically and return its integer reply.
    async fn eval(&self, script: ScriptKind, keys: &[String], args: &[String]) -> Result<Vec<i64>>;

    /// Current value of a counter, or zero if it does not exist.
    async fn get_count(&self, key: &str) -> Result<i64>;

    /// Add `amount` to a counter and set its expiry, returning the new value.
    async fn incr_with_expiry(&self, key: &str, amount: u32, ttl: Duration) -> Result<i64>;

    /// Remaining lifetime of `key`, or `None` if it is missing or never expires.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;
}

/// [`ScriptRunner`] over a Redis connection.
///
/// Scripts are loaded by SHA and resent in full only when the server does
/// not have them cached.
#[derive(Clone)]
pub struct RedisScriptRunner {
    connection: ConnectionManager,
    token_bucket: Script,
    sliding_window: Script,
    fixed_window: Script,
}

impl RedisScriptRunner {
    /// Wrap an existing connection.
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            token_bucket: Script::new(ScriptKind::TokenBucket.source()),
            sliding_window: Script::new(ScriptKind::SlidingWindow.source()),
            fixed_window: Script::new(ScriptKind::FixedWindow.source()),
        }
    }

    /// Open a managed connection to `url`.
    ///
    /// The first connection must succeed within `connect_timeout`. After
    /// that the connection manager reconnects on its own after failures.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                warn!(url = %url, timeout = ?connect_timeout, "Timed out connecting to Redis");
                GatekeeperError::Timeout(connect_timeout)
            })??;
        info!(url = %url, "Connected to Redis");
        Ok(Self::new(connection))
    }

    fn script(&self, kind: ScriptKind) -> &Script {
        match kind {
            ScriptKind::TokenBucket => &self.token_bucket,
            ScriptKind::SlidingWindow => &self.sliding_window,
            ScriptKind::FixedWindow => &self.fixed_window,
        }
    }
}

impl std::fmt::Debug for RedisScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisScriptRunner").finish_non_exhaustive()
    }
}

#[async_trait]
impl ScriptRunner for RedisScriptRunner {
    async fn eval(&self, script: ScriptKind, keys: &[String], args: &[String]) -> Result<Vec<i64>> {
        trace!(script = %script, keys = ?keys, "Invoking script");

        let mut invocation = self.script(script).prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.connection.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }

    async fn get_count(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let count: Option<i64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn incr_with_expiry(&self, key: &str, amount: u32, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection.clone();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, amount)
            .pexpire(key, ttl_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        // -2: missing key, -1: no expiry
        let ttl_ms: i64 = conn.pttl(key).await?;
        Ok(u64::try_from(ttl_ms).ok().map(Duration::from_millis))
    }
}
