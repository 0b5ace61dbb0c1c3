//! Rate limiting stores and algorithms.

mod backend;
mod bucket;
mod clock;
mod distributed;
mod limit;
mod memory;
mod runner;
mod scripts;

#[cfg(test)]
mod sim;

pub use backend::{connect_store, LimiterStore};
pub use bucket::BucketState;
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use distributed::{Algorithm, RedisStore};
pub use limit::{Decision, Limit};
pub use memory::MemoryStore;
pub use runner::{RedisScriptRunner, ScriptRunner};
pub use scripts::{ScriptKind, FIXED_WINDOW_SCRIPT, SLIDING_WINDOW_SCRIPT, TOKEN_BUCKET_SCRIPT};
