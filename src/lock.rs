//! Advisory, time-boxed locks that keep concurrent refreshers from all hitting the server at once.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::cache::SharedCache;

/// An exclusive lock with "acquire if absent" semantics.
///
/// Losers do not wait. A holder that never releases the lock (e.g., because its process crashed)
/// loses it once `ttl` has passed.
pub trait ExclusiveLock: Send + Sync {
    /// Try to take the lock named `key` for at most `ttl`. Returns `false` if someone else holds
    /// it.
    fn try_acquire(&self, key: &str, ttl: Duration) -> bool;

    /// Release the lock named `key`.
    fn release(&self, key: &str);
}

/// A lock shared by every process using the same [`SharedCache`], built on
/// [`SharedCache::set_exclusive`].
///
/// If the cache cannot be reached the lock is reported as acquired: refreshing without
/// coordination is preferable to never refreshing at all.
#[derive(Debug)]
pub struct CacheLock<C> {
    cache: C,
}

impl<C: SharedCache> CacheLock<C> {
    /// Create a lock backed by `cache`.
    pub fn new(cache: C) -> CacheLock<C> {
        CacheLock { cache }
    }
}

impl<C: SharedCache> ExclusiveLock for CacheLock<C> {
    fn try_acquire(&self, key: &str, ttl: Duration) -> bool {
        match self.cache.set_exclusive(key, b"1", ttl) {
            Ok(acquired) => acquired,
            Err(err) => {
                log::warn!(target: "unleash", key; "failed to take update lock from shared cache, refreshing without it: {:?}", err);
                true
            }
        }
    }

    fn release(&self, key: &str) {
        if let Err(err) = self.cache.delete(key) {
            log::warn!(target: "unleash", key; "failed to release update lock: {:?}", err);
        }
    }
}

/// An in-process lock for single-process deployments.
#[derive(Debug, Default)]
pub struct LocalLock {
    held_until: Mutex<HashMap<String, Instant>>,
}

impl LocalLock {
    /// Create a lock with nothing held.
    pub fn new() -> LocalLock {
        LocalLock::default()
    }
}

impl ExclusiveLock for LocalLock {
    fn try_acquire(&self, key: &str, ttl: Duration) -> bool {
        let mut held_until = self
            .held_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match held_until.get(key) {
            Some(&until) if now < until => false,
            _ => {
                held_until.insert(key.to_owned(), now + ttl);
                true
            }
        }
    }

    fn release(&self, key: &str) {
        let mut held_until = self
            .held_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held_until.remove(key);
    }
}
