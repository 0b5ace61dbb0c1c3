//! Limiter store trait for abstracting local and distributed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::distributed::RedisStore;
use super::limit::{Decision, Limit};
use super::memory::MemoryStore;
use crate::config::{Backend, StoreConfig};
use crate::error::Result;

/// Trait for limiter store implementations.
///
/// This trait abstracts over both the in-process `MemoryStore` and the
/// Redis-backed `RedisStore` so callers can swap one for the other.
///
/// There is no error return. A store that cannot reach its backing state
/// admits the request, so admission control never causes an outage.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Try to consume `cost` tokens from `key`'s budget.
    ///
    /// When the decision is `allowed`, the tokens are consumed and there is no
    /// way to give them back. A `cost` outside `[1, burst]` is clamped into it.
    async fn allow_n(&self, key: &str, limit: Limit, cost: u32) -> Decision;

    /// Admission check taking the raw limit numbers.
    ///
    /// An invalid rate or burst is logged and the request is admitted.
    async fn allow(&self, key: &str, rate: f64, burst: u32, cost: u32) -> Decision {
        match Limit::new(rate, burst) {
            Ok(limit) => self.allow_n(key, limit, cost).await,
            Err(e) => {
                warn!(key = %key, error = %e, "Invalid limit, admitting request");
                Decision::allow()
            }
        }
    }

    /// Stop any background work owned by the store.
    async fn shutdown(&self) {}
}

/// Build the limiter store selected by `config`.
///
/// A memory store comes back with its janitor already running, so this must
/// be called from within a tokio runtime.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn LimiterStore>> {
    match config.backend {
        Backend::Memory => {
            let store = MemoryStore::new(&config.memory)?;
            store.start_janitor();
            Ok(Arc::new(store))
        }
        Backend::Redis => {
            let store = RedisStore::connect(&config.redis).await?;
            info!(
                algorithm = %store.algorithm(),
                key_prefix = %config.redis.key_prefix,
                "Redis limiter store ready"
            );
            Ok(Arc::new(store))
        }
    }
}
