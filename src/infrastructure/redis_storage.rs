//! Redis-backed stores.
//!
//! Lets several application instances share counters and sessions.
//!
//! ## Architecture
//!
//! - Counters: one integer key per counter, `INCR` + `PEXPIRE` + `PTTL` in a
//!   single Lua script so the window is set atomically with the first hit.
//! - Sessions: one key per session holding the bincode-encoded state with a
//!   `PX` expiry equal to the session's remaining lifetime. Updates are
//!   compare-and-set through a Lua script and retried on contention.
//!   Rotation deletes the old key and writes the new one in the same script.
//!
//! ## Runtime
//!
//! The store ports are synchronous. Calls made from inside a tokio runtime use
//! `block_in_place`, which requires the multi-threaded runtime; calls made
//! outside a runtime run on a temporary current-thread runtime. Every command
//! is bounded by [`RedisStorageConfig::command_timeout`].
//!
//! ## Limitations
//!
//! - `SessionStore::len` walks the keyspace with `SCAN`
//! - `SessionStore::retain` does nothing: Redis expires sessions on its own
//!
//! ## Example
//!
//! ```rust,ignore
//! use abuse_gate::{AbuseEngine, RedisCounterStore, RedisSessionStore, RedisStorageConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RedisStorageConfig::default();
//!     let counters = RedisCounterStore::connect_with_config("redis://127.0.0.1/", config.clone())
//!         .await
//!         .expect("Failed to connect to Redis");
//!     let sessions = RedisSessionStore::connect_with_config("redis://127.0.0.1/", config)
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let engine = AbuseEngine::builder()
//!         .with_counter_store(Arc::new(counters))
//!         .with_session_store(Arc::new(sessions))
//!         .build()
//!         .unwrap();
//! }
//! ```

use crate::application::ports::{CounterResult, CounterStore, SessionStore, SessionWrite, StoreError};
use crate::domain::session::{Session, SessionId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Attempts at a compare-and-set session update before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Keys requested per `SCAN` round trip when counting sessions.
const SCAN_BATCH: usize = 500;

const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

const TAKE_SCRIPT: &str = r"
local value = redis.call('GET', KEYS[1])
if value then
  redis.call('DEL', KEYS[1])
end
return value
";

const COMPARE_AND_SET_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
if ARGV[2] == '' then
  redis.call('DEL', KEYS[1])
else
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return 1
";

const REPLACE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
return 1
";

/// Error returned when connecting a Redis store fails.
#[derive(Debug, thiserror::Error)]
pub enum RedisConnectError {
    /// The configuration was rejected
    #[error("invalid redis storage configuration: {0}")]
    InvalidConfig(&'static str),
    /// Redis could not be reached
    #[error(transparent)]
    Redis(#[from] RedisError),
}

/// Configuration for the Redis stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStorageConfig {
    /// Key prefix for Redis keys (default: "abuse-gate:")
    pub key_prefix: String,
    /// Upper bound on one command round trip (default: 250 ms)
    pub command_timeout: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: "abuse-gate:".to_string(),
            command_timeout: Duration::from_millis(250),
        }
    }
}

impl RedisStorageConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), RedisConnectError> {
        if self.key_prefix.is_empty() {
            return Err(RedisConnectError::InvalidConfig("key prefix must not be empty"));
        }
        if self.command_timeout.is_zero() {
            return Err(RedisConnectError::InvalidConfig(
                "command timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

async fn open(url: &str, config: &RedisStorageConfig) -> Result<ConnectionManager, RedisConnectError> {
    config.validate()?;
    let client = Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Run a Redis future to completion from synchronous code, bounded by `timeout`.
fn run_bounded<F, T>(timeout: Duration, future: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let bounded = async move {
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    };

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        tokio::task::block_in_place(|| handle.block_on(bounded))
    } else {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        runtime.block_on(bounded)
    }
}

fn unavailable(error: RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Fixed-window counters in Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisStorageConfig,
    increment: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisConnectError> {
        Self::connect_with_config(url, RedisStorageConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStorageConfig,
    ) -> Result<Self, RedisConnectError> {
        let connection = open(url, &config).await?;
        Ok(Self {
            connection,
            config,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}counter:{}", self.config.key_prefix, key)
    }
}

impl CounterStore for RedisCounterStore {
    fn increment(&self, key: &str, window: Duration) -> Result<CounterResult, StoreError> {
        let redis_key = self.key(key);
        let mut conn = self.connection.clone();

        let (count, ttl_ms): (u64, i64) = run_bounded(self.config.command_timeout, async {
            self.increment
                .key(&redis_key)
                .arg(millis(window))
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)
        })?;

        Ok(CounterResult {
            count,
            ttl_remaining: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
        })
    }

    fn reset(&self, key: &str) -> Result<(), StoreError> {
        let redis_key = self.key(key);
        let mut conn = self.connection.clone();
        run_bounded(self.config.command_timeout, async {
            conn.del::<_, ()>(&redis_key).await.map_err(unavailable)
        })
    }

    fn get_count(&self, key: &str) -> Result<u64, StoreError> {
        let redis_key = self.key(key);
        let mut conn = self.connection.clone();
        let count: Option<u64> = run_bounded(self.config.command_timeout, async {
            conn.get(&redis_key).await.map_err(unavailable)
        })?;
        Ok(count.unwrap_or(0))
    }
}

/// Session table in Redis.
#[derive(Clone)]
pub struct RedisSessionStore {
    connection: ConnectionManager,
    config: RedisStorageConfig,
    take: Script,
    compare_and_set: Script,
    replace: Script,
}

impl fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSessionStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisSessionStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisConnectError> {
        Self::connect_with_config(url, RedisStorageConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStorageConfig,
    ) -> Result<Self, RedisConnectError> {
        let connection = open(url, &config).await?;
        Ok(Self {
            connection,
            config,
            take: Script::new(TAKE_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
            replace: Script::new(REPLACE_SCRIPT),
        })
    }

    fn key(&self, id: &SessionId) -> String {
        format!("{}session:{}", self.config.key_prefix, id.as_str())
    }

    fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection.clone();
        run_bounded(self.config.command_timeout, async {
            conn.get(key).await.map_err(unavailable)
        })
    }

    // Swap `expected` for `next` (or delete when `next` is empty) if the key
    // still holds `expected`. Returns whether the swap happened.
    fn swap(&self, key: &str, expected: &[u8], next: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let swapped: i64 = run_bounded(self.config.command_timeout, async {
            self.compare_and_set
                .key(key)
                .arg(expected)
                .arg(next)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)
        })?;
        Ok(swapped == 1)
    }

    // Delete `key` and store `next` under `next_key` in one script, if `key`
    // still holds `expected`.
    fn replace_with(
        &self,
        key: &str,
        expected: &[u8],
        next_key: &str,
        next: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let replaced: i64 = run_bounded(self.config.command_timeout, async {
            self.replace
                .key(key)
                .key(next_key)
                .arg(expected)
                .arg(next)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)
        })?;
        Ok(replaced == 1)
    }
}

fn encode(session: &Session) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(session).map_err(|e| StoreError::Corrupted(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Session, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Corrupted(e.to_string()))
}

impl SessionStore for RedisSessionStore {
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.read_raw(&self.key(id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn insert(&self, session: Session, ttl: Duration) -> Result<(), StoreError> {
        let key = self.key(&session.id);
        let bytes = encode(&session)?;
        let mut conn = self.connection.clone();
        run_bounded(self.config.command_timeout, async {
            conn.pset_ex::<_, _, ()>(&key, bytes, millis(ttl))
                .await
                .map_err(unavailable)
        })
    }

    fn remove(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let key = self.key(id);
        let mut conn = self.connection.clone();
        let bytes: Option<Vec<u8>> = run_bounded(self.config.command_timeout, async {
            self.take
                .key(&key)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)
        })?;
        bytes.map(|bytes| decode(&bytes)).transpose()
    }

    fn update<F, R>(
        &self,
        id: &SessionId,
        ttl_of: impl Fn(&Session) -> Duration,
        mut f: F,
    ) -> Result<Option<R>, StoreError>
    where
        F: FnMut(&mut Session) -> (SessionWrite, R),
    {
        let key = self.key(id);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(current) = self.read_raw(&key)? else {
                return Ok(None);
            };
            let mut session = decode(&current)?;
            let (write, result) = f(&mut session);

            let swapped = match write {
                SessionWrite::Keep => return Ok(Some(result)),
                SessionWrite::Remove => self.swap(&key, &current, &[], Duration::ZERO)?,
                SessionWrite::Save => {
                    let next = encode(&session)?;
                    self.swap(&key, &current, &next, ttl_of(&session))?
                }
                SessionWrite::Replace(next) => {
                    let bytes = encode(&next)?;
                    self.replace_with(&key, &current, &self.key(&next.id), &bytes, ttl_of(&next))?
                }
            };

            if swapped {
                return Ok(Some(result));
            }
            tracing::debug!(session = %id, attempt, "Concurrent session update, retrying");
        }

        tracing::warn!(session = %id, "Session update abandoned after repeated contention");
        Err(StoreError::Unavailable(
            "session update contention".to_string(),
        ))
    }

    /// Redis expires sessions itself; nothing to scan.
    fn retain<F>(&self, _keep: F) -> Result<usize, StoreError>
    where
        F: FnMut(&Session) -> bool,
    {
        Ok(0)
    }

    /// Counts session keys under the prefix with `SCAN`.
    ///
    /// Walks the whole keyspace, so keep it off hot paths. Returns 0 when
    /// Redis cannot be reached.
    fn len(&self) -> usize {
        let pattern = format!("{}session:*", self.config.key_prefix);
        let mut conn = self.connection.clone();
        let counted = run_bounded(self.config.command_timeout, async {
            let mut cursor: u64 = 0;
            let mut total = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                total += keys.len();
                if next == 0 {
                    return Ok::<_, StoreError>(total);
                }
                cursor = next;
            }
        });
        counted.unwrap_or_else(|error| {
            tracing::warn!(error = %error, "Counting sessions failed");
            0
        })
    }
}
