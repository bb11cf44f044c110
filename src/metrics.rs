//! Counting of evaluation results, reported to the server by
//! [`Client::flush_metrics`](crate::Client::flush_metrics).
use std::{collections::HashMap, sync::Mutex, time::Duration};

use serde::{Deserialize, Serialize};

use crate::cache::{parse_counter, sanitize_key, SharedCache};

/// How often a feature evaluated to on (`yes`) and off (`no`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStats {
    /// Number of evaluations that returned `true`.
    pub yes: u64,
    /// Number of evaluations that returned `false`.
    pub no: u64,
}

impl FeatureStats {
    /// Whether nothing has been counted.
    pub fn is_empty(&self) -> bool {
        self.yes == 0 && self.no == 0
    }
}

/// Collects evaluation results per feature.
///
/// Recording is fire-and-forget: implementations must not fail or block the caller for long.
pub trait MetricsCollector: Send + Sync {
    /// Count one evaluation of `feature` that returned `result`.
    fn add(&self, feature: &str, result: bool);

    /// Get the counts for `feature`, resetting them to zero if `clear` is set.
    fn get(&self, feature: &str, clear: bool) -> FeatureStats;
}

/// Counts evaluations in process memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    stats: Mutex<HashMap<String, FeatureStats>>,
}

impl MemoryMetrics {
    /// Create a collector with no counts.
    pub fn new() -> MemoryMetrics {
        MemoryMetrics::default()
    }
}

impl MetricsCollector for MemoryMetrics {
    fn add(&self, feature: &str, result: bool) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let entry = stats.entry(feature.to_owned()).or_default();
        if result {
            entry.yes += 1;
        } else {
            entry.no += 1;
        }
    }

    fn get(&self, feature: &str, clear: bool) -> FeatureStats {
        let Ok(mut stats) = self.stats.lock() else {
            return FeatureStats::default();
        };
        if clear {
            stats.remove(feature).unwrap_or_default()
        } else {
            stats.get(feature).copied().unwrap_or_default()
        }
    }
}

/// Counts evaluations in a [`SharedCache`], so that every process of an application instance
/// contributes to the same counters.
#[derive(Debug)]
pub struct CacheMetrics<C> {
    cache: C,
    prefix: String,
    ttl: Duration,
}

impl<C: SharedCache> CacheMetrics<C> {
    /// Default time-to-live of counters: one week.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Create a collector for `app_name`/`instance_id` storing counters in `cache`.
    pub fn new(cache: C, app_name: &str, instance_id: &str) -> CacheMetrics<C> {
        CacheMetrics {
            cache,
            prefix: format!("unleash-metrics-v1__{app_name}--{instance_id}"),
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Override how long counters live in the cache.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(&self, feature: &str, result: bool) -> String {
        let suffix = if result { "yes" } else { "no" };
        sanitize_key(&format!("{}-FEAT--{feature}--{suffix}", self.prefix))
    }

    fn read(&self, feature: &str, result: bool, clear: bool) -> u64 {
        let key = self.key(feature, result);
        let value = match self.cache.get(&key) {
            Ok(value) => value.as_deref().and_then(parse_counter).unwrap_or(0),
            Err(err) => {
                log::warn!(target: "unleash", feature_name = feature; "failed to read metrics counter: {:?}", err);
                0
            }
        };
        if clear {
            if let Err(err) = self.cache.delete(&key) {
                log::warn!(target: "unleash", feature_name = feature; "failed to clear metrics counter: {:?}", err);
            }
        }
        value
    }
}

impl<C: SharedCache> MetricsCollector for CacheMetrics<C> {
    fn add(&self, feature: &str, result: bool) {
        if let Err(err) = self
            .cache
            .increment(&self.key(feature, result), 1, 1, self.ttl)
        {
            log::warn!(target: "unleash", feature_name = feature; "failed to count evaluation: {:?}", err);
        }
    }

    fn get(&self, feature: &str, clear: bool) -> FeatureStats {
        FeatureStats {
            yes: self.read(feature, true, clear),
            no: self.read(feature, false, clear),
        }
    }
}

impl<T: MetricsCollector + ?Sized> MetricsCollector for std::sync::Arc<T> {
    fn add(&self, feature: &str, result: bool) {
        (**self).add(feature, result)
    }

    fn get(&self, feature: &str, clear: bool) -> FeatureStats {
        (**self).get(feature, clear)
    }
}
