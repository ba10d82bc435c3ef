//! Rule result caching.
//!
//! Results are stored per (rule cache key, fingerprint) with a TTL. The cache
//! is only an optimization: a miss, an error or a missing backend all mean
//! "run the rule", never a wrong answer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use crate::models::RuleResult;
use crate::utils::format_cache_key;

#[cfg(test)]
use mockall::automock;

const SWEEP_EVERY: usize = 128;

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Storage for rule results keyed by rule and fingerprint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    /// Stored result and its remaining ttl in seconds, if still live
    async fn get(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<(RuleResult, u32)>, CacheError>;

    /// Store `value` for `ttl` seconds; a zero ttl stores nothing
    async fn set(
        &self,
        key: &str,
        fingerprint: &str,
        value: &RuleResult,
        ttl: u32,
    ) -> Result<(), CacheError>;
}

fn remaining_seconds(remaining: Duration) -> u32 {
    let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    u32::try_from(seconds).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone)]
struct Entry {
    value: RuleResult,
    expires_at: Instant,
}

/// In-process cache safe for concurrent callers
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(String, String), Entry>>,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn sweep(&self, now: Instant) {
        self.entries.write().retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<(RuleResult, u32)>, CacheError> {
        let now = Instant::now();
        let lookup = (key.to_string(), fingerprint.to_string());

        {
            let entries = self.entries.read();
            match entries.get(&lookup) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > now => {
                    let ttl = remaining_seconds(entry.expires_at - now);
                    return Ok(Some((entry.value.clone(), ttl)));
                }
                Some(_) => {}
            }
        }

        // expired; another caller may have refreshed it in between
        let mut entries = self.entries.write();
        if entries.get(&lookup).map_or(false, |entry| entry.expires_at <= now) {
            entries.remove(&lookup);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        fingerprint: &str,
        value: &RuleResult,
        ttl: u32,
    ) -> Result<(), CacheError> {
        if ttl == 0 {
            return Ok(());
        }
        let now = Instant::now();
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        self.entries.write().insert(
            (key.to_string(), fingerprint.to_string()),
            Entry {
                value: value.clone(),
                expires_at: now + Duration::from_secs(u64::from(ttl)),
            },
        );
        Ok(())
    }
}

/// Cache shared through Redis
pub struct RedisCache {
    /// Redis client
    redis: redis::Client,
    /// Prefix for every key written by this cache
    prefix: String,
}

impl RedisCache {
    /// Create a new Redis cache instance
    pub fn new(redis: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str, fingerprint: &str) -> String {
        format_cache_key(&self.prefix, key, fingerprint)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<(RuleResult, u32)>, CacheError> {
        let redis_key = self.key(key, fingerprint);
        let mut conn = self.redis.get_async_connection().await?;

        let (value, ttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&redis_key)
            .cmd("TTL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        match value {
            Some(json) if ttl > 0 => {
                let result: RuleResult = serde_json::from_str(&json)?;
                Ok(Some((result, u32::try_from(ttl).unwrap_or(u32::MAX))))
            }
            _ => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        fingerprint: &str,
        value: &RuleResult,
        ttl: u32,
    ) -> Result<(), CacheError> {
        if ttl == 0 {
            return Ok(());
        }
        let json = serde_json::to_string(value)?;
        let mut conn = self.redis.get_async_connection().await?;
        conn.set_ex::<_, _, ()>(self.key(key, fingerprint), json, ttl as usize)
            .await?;
        Ok(())
    }
}
