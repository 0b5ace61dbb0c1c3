//! Lua scripts executed atomically by the distributed store.
//!
//! These bodies are shared with every other process using the same Redis
//! keys. Changing them changes the on-the-wire behavior, so treat edits as a
//! protocol change. All times are in milliseconds.

/// Token bucket over a `{tokens, last_time}` hash.
///
/// KEYS[1] bucket key.
/// ARGV: limit (tokens per period), burst, period, cost, now.
/// Returns `{allowed, retry_after}`.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_time')
local tokens = tonumber(state[1])
if tokens == nil then
  tokens = burst
end
local last_time = tonumber(state[2])
if last_time == nil then
  last_time = 0
end

local elapsed = math.max(0, now - last_time)
local new_tokens = math.min(burst, tokens + elapsed / period * limit)

local allowed = 0
local retry_after = 0
if new_tokens >= cost then
  new_tokens = new_tokens - cost
  allowed = 1
else
  retry_after = math.ceil((cost - new_tokens) * period / limit)
end

redis.call('HSET', key, 'tokens', new_tokens, 'last_time', now)
redis.call('PEXPIRE', key, period * 2)
return {allowed, retry_after}
"#;

/// Sliding window over a sorted set of hit timestamps.
///
/// KEYS[1] window key.
/// ARGV: limit, window, now, cost, member id.
/// Returns `{allowed, retry_after}`.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)

if count + cost > limit then
  local retry_after = window
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  if oldest[2] ~= nil then
    retry_after = tonumber(oldest[2]) + window - now
  end
  return {0, retry_after}
end

for i = 1, cost do
  redis.call('ZADD', key, now, now .. ':' .. member .. ':' .. i)
end
redis.call('PEXPIRE', key, window)
return {1, 0}
"#;

/// Fixed window counter with the check and increment in one step.
///
/// KEYS[1] window key (already suffixed with the window index).
/// ARGV: burst, cost, ttl.
/// Returns `{allowed, retry_after}`.
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local burst = tonumber(ARGV[1])
local cost = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local count = tonumber(redis.call('GET', key) or '0')
if count + cost > burst then
  local remaining = redis.call('PTTL', key)
  if remaining < 0 then
    remaining = ttl
  end
  return {0, remaining}
end

redis.call('INCRBY', key, cost)
redis.call('PEXPIRE', key, ttl)
return {1, 0}
"#;

/// The scripts a [`ScriptRunner`](super::runner::ScriptRunner) knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl ScriptKind {
    /// Every script kind.
    pub const ALL: [ScriptKind; 3] = [
        ScriptKind::TokenBucket,
        ScriptKind::SlidingWindow,
        ScriptKind::FixedWindow,
    ];

    /// The Lua body for this script.
    pub fn source(&self) -> &'static str {
        match self {
            ScriptKind::TokenBucket => TOKEN_BUCKET_SCRIPT,
            ScriptKind::SlidingWindow => SLIDING_WINDOW_SCRIPT,
            ScriptKind::FixedWindow => FIXED_WINDOW_SCRIPT,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ScriptKind::TokenBucket => "token_bucket",
            ScriptKind::SlidingWindow => "sliding_window",
            ScriptKind::FixedWindow => "fixed_window",
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
