//! Shared key-value cache (memcached-like) used to share snapshots between processes and to
//! coordinate refreshes.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{Error, Result};

/// A distributed key-value cache with expiring entries.
///
/// Keys may only contain `A-Z`, `a-z`, `0-9`, `_`, `.` and `-`; implementations reject other keys
/// with [`Error::InvalidCacheKey`]. A `ttl` of [`Duration::ZERO`] means the entry never expires.
pub trait SharedCache: Send + Sync {
    /// Get the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Store `value` under `key` only if the key is absent. Returns `true` if the value was
    /// stored.
    fn set_exclusive(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Add `offset` to the counter under `key`, creating it with `initial_value` if absent.
    /// Returns the new value.
    fn increment(&self, key: &str, offset: u64, initial_value: u64, ttl: Duration)
        -> Result<u64>;
}

/// Fail with [`Error::InvalidCacheKey`] unless `key` only has characters allowed in cache keys.
pub fn validate_key(key: &str) -> Result<()> {
    if !key.is_empty() && key.chars().all(is_key_char) {
        Ok(())
    } else {
        Err(Error::InvalidCacheKey(key.to_owned()))
    }
}

/// Replace every character not allowed in cache keys with `_`.
pub(crate) fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if is_key_char(c) { c } else { '_' })
        .collect()
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Duration, now: Instant) -> Entry {
        Entry {
            value,
            expires_at: (ttl != Duration::ZERO).then(|| now + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// An in-process [`SharedCache`].
///
/// Shares data between clients living in the same process only. It is what the client falls
/// back to for update locking when no distributed cache is configured, and a convenient fake in
/// tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding cache lock should not panic");
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }
}

impl SharedCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.with_entries(|entries, _| entries.get(key).map(|entry| entry.value.clone())))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        validate_key(key)?;
        self.with_entries(|entries, now| {
            entries.insert(key.to_owned(), Entry::new(value.to_vec(), ttl, now));
        });
        Ok(())
    }

    fn set_exclusive(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        validate_key(key)?;
        Ok(self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(key.to_owned(), Entry::new(value.to_vec(), ttl, now));
            true
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.with_entries(|entries, _| {
            entries.remove(key);
        });
        Ok(())
    }

    fn increment(
        &self,
        key: &str,
        offset: u64,
        initial_value: u64,
        ttl: Duration,
    ) -> Result<u64> {
        validate_key(key)?;
        Ok(self.with_entries(|entries, now| {
            let current = entries
                .get(key)
                .and_then(|entry| parse_counter(&entry.value));
            let value = match current {
                Some(current) => current.saturating_add(offset),
                None => initial_value,
            };
            entries.insert(
                key.to_owned(),
                Entry::new(value.to_string().into_bytes(), ttl, now),
            );
            value
        }))
    }
}

impl<T: SharedCache + ?Sized> SharedCache for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        (**self).set(key, value, ttl)
    }

    fn set_exclusive(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        (**self).set_exclusive(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn increment(
        &self,
        key: &str,
        offset: u64,
        initial_value: u64,
        ttl: Duration,
    ) -> Result<u64> {
        (**self).increment(key, offset, initial_value, ttl)
    }
}

/// Counters are stored as ASCII decimal, the way memcached stores them.
pub(crate) fn parse_counter(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}
