//! In-process token bucket store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::backend::LimiterStore;
use super::bucket::BucketState;
use super::clock::{Clock, MonotonicClock};
use super::limit::{Decision, Limit};
use crate::config::MemoryStoreConfig;
use crate::error::{GatekeeperError, Result};

/// The key table shared between the store and its janitor.
#[derive(Debug)]
struct Buckets {
    /// Token buckets indexed by key. Sharded, so keys on different shards
    /// never contend.
    map: DashMap<String, BucketState>,
    clock: Arc<dyn Clock>,
    idle_ttl: Duration,
}

impl Buckets {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.map.len();
        self.map.retain(|_, bucket| !bucket.is_idle(now, self.idle_ttl));
        before.saturating_sub(self.map.len())
    }
}

struct Janitor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A token bucket store held entirely in process memory.
///
/// Each call runs refill, check and consume under the shard lock for its
/// key, so concurrent calls on one key are strictly serialized. Idle buckets
/// are evicted by an optional background janitor (see
/// [`start_janitor`](Self::start_janitor)).
pub struct MemoryStore {
    buckets: Arc<Buckets>,
    janitor: Mutex<Option<Janitor>>,
}

impl MemoryStore {
    /// Create a store on the monotonic clock.
    pub fn new(config: &MemoryStoreConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create a store on the given clock.
    pub fn with_clock(config: &MemoryStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let idle_ttl = config.idle_ttl();
        if idle_ttl.is_zero() {
            return Err(GatekeeperError::Config(
                "memory store idle TTL must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            buckets: Arc::new(Buckets {
                map: DashMap::new(),
                clock,
                idle_ttl,
            }),
            janitor: Mutex::new(None),
        })
    }

    /// Spawn the background sweep on the current tokio runtime.
    ///
    /// The janitor wakes every idle TTL and evicts buckets untouched for at
    /// least that long. Calling this while a janitor is running does nothing.
    /// Outside a runtime no janitor is started, and idle buckets stay until
    /// [`sweep`](Self::sweep) is called.
    pub fn start_janitor(&self) {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "No tokio runtime, bucket janitor not started");
                return;
            }
        };

        let mut janitor = self.janitor.lock();
        if janitor.as_ref().is_some_and(|j| !j.handle.is_finished()) {
            return;
        }

        let (stop, mut stop_rx) = oneshot::channel();
        let buckets = Arc::clone(&self.buckets);
        let period = buckets.idle_ttl;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = buckets.sweep();
                        if evicted > 0 {
                            debug!(evicted = evicted, remaining = buckets.map.len(), "Evicted idle buckets");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }

            debug!("Janitor stopped");
        });

        info!(idle_ttl = ?period, "Started bucket janitor");
        *janitor = Some(Janitor { stop, handle });
    }

    /// Whether the background janitor is currently running.
    pub fn janitor_running(&self) -> bool {
        self.janitor
            .lock()
            .as_ref()
            .is_some_and(|j| !j.handle.is_finished())
    }

    /// Run one eviction pass now, returning the number of buckets removed.
    pub fn sweep(&self) -> usize {
        self.buckets.sweep()
    }

    /// Tokens currently held for `key`, without refilling.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.map.get(key).map(|b| b.tokens())
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.map.len()
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.map.clear();
    }

    /// Stop the janitor and wait for it to exit.
    pub async fn stop_janitor(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            // A send error means the task already exited
            let _ = janitor.stop.send(());
            if let Err(e) = janitor.handle.await {
                warn!(error = %e, "Janitor task ended abnormally");
            }
            info!("Stopped bucket janitor");
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("buckets", &self.buckets.map.len())
            .field("idle_ttl", &self.buckets.idle_ttl)
            .field("janitor_running", &self.janitor_running())
            .finish()
    }
}

#[async_trait]
impl LimiterStore for MemoryStore {
    async fn allow_n(&self, key: &str, limit: Limit, cost: u32) -> Decision {
        let cost = limit.clamp_cost(cost);
        let now = self.buckets.clock.now();

        let mut bucket = self
            .buckets
            .map
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, rate = limit.rate(), burst = limit.burst(), "Creating new bucket");
                BucketState::new(limit, now)
            });

        if !bucket.matches(&limit) {
            debug!(
                key = %key,
                old_rate = bucket.limit().rate(),
                old_burst = bucket.limit().burst(),
                rate = limit.rate(),
                burst = limit.burst(),
                "Limit changed, resetting bucket"
            );
            *bucket = BucketState::new(limit, now);
        }

        let decision = bucket.try_consume(cost, now);

        trace!(
            key = %key,
            cost = cost,
            allowed = decision.allowed,
            tokens = bucket.tokens(),
            "Checked rate limit"
        );
        if !decision.allowed {
            debug!(key = %key, retry_after = ?decision.retry_after, "Rate limit exceeded");
        }

        decision
    }

    async fn shutdown(&self) {
        self.stop_janitor().await;
    }
}
