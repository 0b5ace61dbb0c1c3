//! A single-threaded, in-process stand-in for Redis used by the tests.
//!
//! Each script kind is executed natively under one lock, which gives the same
//! all-or-nothing behavior as a Redis script. Expiry follows a [`ManualClock`]
//! so tests control when keys vanish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{ErrorKind, RedisError};

use super::clock::{Clock, ManualClock};
use super::runner::ScriptRunner;
use super::scripts::ScriptKind;
use crate::error::{GatekeeperError, Result};

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Hash { tokens: f64, last_time: f64 },
    SortedSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Duration>,
}

#[derive(Debug)]
pub struct SimulatedRedis {
    clock: ManualClock,
    data: Mutex<HashMap<String, Entry>>,
    failing: AtomicBool,
    stall: Mutex<Option<Duration>>,
    evals: AtomicUsize,
}

fn wrong_type() -> GatekeeperError {
    RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    ))
    .into()
}

fn arg(args: &[String], index: usize) -> Result<f64> {
    args.get(index)
        .and_then(|a| a.parse::<f64>().ok())
        .ok_or_else(|| RedisError::from((ErrorKind::ResponseError, "bad script argument")).into())
}

impl SimulatedRedis {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            stall: Mutex::new(None),
            evals: AtomicUsize::new(0),
        }
    }

    /// Make every following call fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every following call by `delay` before it runs.
    pub fn set_stall(&self, delay: Option<Duration>) {
        *self.stall.lock() = delay;
    }

    /// Number of script invocations served.
    pub fn eval_count(&self) -> usize {
        self.evals.load(Ordering::SeqCst)
    }

    /// Whether `key` currently exists.
    pub fn contains(&self, key: &str) -> bool {
        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        data.contains_key(key)
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        let mut keys: Vec<String> = data.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remaining lifetime of `key`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        let now = self.clock.now();
        data.get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_sub(now))
    }

    /// Tokens stored in a token bucket hash.
    pub fn bucket_tokens(&self, key: &str) -> Option<f64> {
        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        match data.get(key).map(|e| &e.value) {
            Some(Value::Hash { tokens, .. }) => Some(*tokens),
            _ => None,
        }
    }

    fn purge_expired(&self, data: &mut HashMap<String, Entry>) {
        let now = self.clock.now();
        data.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }

    async fn enter(&self) -> Result<()> {
        let stall = *self.stall.lock();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RedisError::from((ErrorKind::IoError, "simulated connection failure")).into());
        }
        Ok(())
    }

    fn token_bucket(&self, data: &mut HashMap<String, Entry>, key: &str, args: &[String]) -> Result<Vec<i64>> {
        let limit = arg(args, 0)?;
        let burst = arg(args, 1)?;
        let period = arg(args, 2)?;
        let cost = arg(args, 3)?;
        let now = arg(args, 4)?;

        let (tokens, last_time) = match data.get(key).map(|e| &e.value) {
            None => (burst, 0.0),
            Some(Value::Hash { tokens, last_time }) => (*tokens, *last_time),
            Some(_) => return Err(wrong_type()),
        };

        let elapsed = (now - last_time).max(0.0);
        let mut new_tokens = burst.min(tokens + elapsed / period * limit);

        let (allowed, retry_after) = if new_tokens >= cost {
            new_tokens -= cost;
            (1, 0)
        } else {
            (0, ((cost - new_tokens) * period / limit).ceil() as i64)
        };

        data.insert(
            key.to_string(),
            Entry {
                value: Value::Hash {
                    tokens: new_tokens,
                    last_time: now,
                },
                expires_at: Some(self.clock.now() + Duration::from_millis((period * 2.0) as u64)),
            },
        );
        Ok(vec![allowed, retry_after])
    }

    fn sliding_window(&self, data: &mut HashMap<String, Entry>, key: &str, args: &[String]) -> Result<Vec<i64>> {
        let limit = arg(args, 0)?;
        let window = arg(args, 1)?;
        let now = arg(args, 2)?;
        let cost = arg(args, 3)?;
        let member = args.get(4).cloned().unwrap_or_default();

        let (mut hits, expires_at) = match data.remove(key) {
            None => (Vec::new(), None),
            Some(Entry { value: Value::SortedSet(hits), expires_at }) => (hits, expires_at),
            Some(other) => {
                data.insert(key.to_string(), other);
                return Err(wrong_type());
            }
        };
        hits.retain(|(score, _)| *score >= now - window);

        if hits.len() as f64 + cost > limit {
            let retry_after = hits
                .iter()
                .map(|(score, _)| *score)
                .fold(None, |oldest: Option<f64>, s| Some(oldest.map_or(s, |o| o.min(s))))
                .map_or(window, |oldest| oldest + window - now);
            // A set emptied by the trim is deleted, as Redis does
            if !hits.is_empty() {
                data.insert(key.to_string(), Entry { value: Value::SortedSet(hits), expires_at });
            }
            return Ok(vec![0, retry_after as i64]);
        }

        for i in 1..=(cost as u64) {
            hits.push((now, format!("{}:{}:{}", now, member, i)));
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::SortedSet(hits),
                expires_at: Some(self.clock.now() + Duration::from_millis(window as u64)),
            },
        );
        Ok(vec![1, 0])
    }

    fn fixed_window(&self, data: &mut HashMap<String, Entry>, key: &str, args: &[String]) -> Result<Vec<i64>> {
        let burst = arg(args, 0)?;
        let cost = arg(args, 1)?;
        let ttl = arg(args, 2)?;

        let (count, expires_at) = match data.get(key) {
            None => (0, None),
            Some(Entry { value: Value::Counter(count), expires_at }) => (*count, *expires_at),
            Some(_) => return Err(wrong_type()),
        };

        if count as f64 + cost > burst {
            let remaining = expires_at
                .map(|at| at.saturating_sub(self.clock.now()).as_millis() as i64)
                .unwrap_or(ttl as i64);
            return Ok(vec![0, remaining]);
        }

        data.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(count + cost as i64),
                expires_at: Some(self.clock.now() + Duration::from_millis(ttl as u64)),
            },
        );
        Ok(vec![1, 0])
    }
}

#[async_trait]
impl ScriptRunner for SimulatedRedis {
    async fn eval(&self, script: ScriptKind, keys: &[String], args: &[String]) -> Result<Vec<i64>> {
        self.enter().await?;
        self.evals.fetch_add(1, Ordering::SeqCst);

        let key = keys
            .first()
            .ok_or_else(|| GatekeeperError::from(RedisError::from((ErrorKind::ResponseError, "missing key"))))?;

        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        match script {
            ScriptKind::TokenBucket => self.token_bucket(&mut data, key, args),
            ScriptKind::SlidingWindow => self.sliding_window(&mut data, key, args),
            ScriptKind::FixedWindow => self.fixed_window(&mut data, key, args),
        }
    }

    async fn get_count(&self, key: &str) -> Result<i64> {
        self.enter().await?;
        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        match data.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Counter(count)) => Ok(*count),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn incr_with_expiry(&self, key: &str, amount: u32, ttl: Duration) -> Result<i64> {
        self.enter().await?;
        let mut data = self.data.lock();
        self.purge_expired(&mut data);
        let count = match data.get(key).map(|e| &e.value) {
            None => 0,
            Some(Value::Counter(count)) => *count,
            Some(_) => return Err(wrong_type()),
        } + i64::from(amount);

        data.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(count),
                expires_at: Some(self.clock.now() + ttl),
            },
        );
        Ok(count)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.enter().await?;
        Ok(self.ttl(key))
    }
}
