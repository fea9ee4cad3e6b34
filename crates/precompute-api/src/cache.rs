//! Tier-1 artifact cache: a fast, expiring, best-effort copy of tier-2.
//!
//! Nothing in tier-1 is authoritative. Every failure here is logged by the
//! caller and then ignored, so an implementation may drop entries at will.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use precompute_core::{CachedArtifact, Fingerprint};

/// Longest key accepted by common distributed caches (memcached).
pub const MAX_CACHE_KEY_LEN: usize = 250;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("tier-1 cache unavailable: {0}")]
    Unavailable(String),
    #[error("invalid tier-1 cache key: {0}")]
    InvalidKey(String),
}

/// Expiring key-value cache for artifacts.
///
/// Calls are made from async tasks, so implementations must answer quickly
/// (an in-process map, or a client with a tight socket timeout).
pub trait ArtifactCache: Send + Sync {
    /// # Errors
    /// Returns [`CacheError`] when the cache cannot be reached.
    fn get(&self, key: &str) -> Result<Option<CachedArtifact>, CacheError>;

    /// # Errors
    /// Returns [`CacheError`] when the cache cannot be reached.
    fn set(&self, key: &str, artifact: &CachedArtifact, ttl: Duration) -> Result<(), CacheError>;

    /// Re-arm the TTL of an existing entry. Returns `false` when the key is absent.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the cache cannot be reached.
    fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// # Errors
    /// Returns [`CacheError`] when the cache cannot be reached.
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Build the tier-1 key for a fingerprint.
///
/// # Errors
/// Returns [`CacheError::InvalidKey`] when the prefix makes the key unusable.
pub fn cache_key(prefix: &str, fingerprint: Fingerprint) -> Result<String, CacheError> {
    let key = format!("{prefix}{}", fingerprint.to_hex());
    if key.len() > MAX_CACHE_KEY_LEN {
        return Err(CacheError::InvalidKey(format!("{} bytes exceeds {MAX_CACHE_KEY_LEN}", key.len())));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::InvalidKey(key));
    }
    Ok(key)
}

struct Entry {
    artifact: CachedArtifact,
    expires: Instant,
}

/// In-process tier-1 cache with per-entry TTL and a capacity bound.
///
/// When full, expired entries are dropped first, then the entry closest to expiry.
pub struct MemoryCache {
    capacity: usize,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_one(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.expires > now);
    if let Some(victim) =
        entries.iter().min_by_key(|(_, entry)| entry.expires).map(|(key, _)| key.clone())
    {
        entries.remove(&victim);
    }
}

impl ArtifactCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CachedArtifact>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires > Instant::now())
            .map(|entry| entry.artifact.clone()))
    }

    fn set(&self, key: &str, artifact: &CachedArtifact, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            evict_one(&mut entries, now);
        }
        entries.insert(key.to_string(), Entry { artifact: artifact.clone(), expires: now + ttl });
        Ok(())
    }

    fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(entry) if entry.expires > now => {
                entry.expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }
}

/// Tier-1 that stores nothing; every lookup falls through to tier-2.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl ArtifactCache for NullCache {
    fn get(&self, _key: &str) -> Result<Option<CachedArtifact>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _artifact: &CachedArtifact, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    fn touch(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
