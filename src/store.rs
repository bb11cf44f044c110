//! A thread-safe in-memory storage for the currently known feature set. [`LocalStore`] provides
//! concurrent access for readers (flag evaluation) and writers (the refresh orchestrator).
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{feature::Feature, Error, Result};

/// Features indexed by name.
pub type FeatureMap = HashMap<String, Arc<Feature>>;

/// An immutable view of the feature set together with its freshness metadata.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    features: Arc<FeatureMap>,
    last_updated: Option<DateTime<Utc>>,
    etag: Option<String>,
    has_data: bool,
}

impl Snapshot {
    /// Build a snapshot holding `features`, updated at `last_updated`.
    pub fn new(
        features: impl IntoIterator<Item = Feature>,
        etag: Option<String>,
        last_updated: DateTime<Utc>,
    ) -> Snapshot {
        let features = features
            .into_iter()
            .map(|feature| (feature.name().to_owned(), Arc::new(feature)))
            .collect();
        Snapshot {
            features: Arc::new(features),
            last_updated: Some(last_updated),
            etag,
            has_data: true,
        }
    }

    /// All features.
    pub fn features(&self) -> &Arc<FeatureMap> {
        &self.features
    }

    /// When the data was last confirmed against the server. `None` if it never was.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Revalidation tag (ETag) sent by the server along with the data.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// `false` until data has been loaded from somewhere. An empty feature set received from the
    /// server still counts as data.
    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Whether the data was confirmed less than `max_age` before `now`.
    ///
    /// A `last_updated` later than `now` (clock skew between processes sharing a cache) counts as
    /// stale.
    pub(crate) fn is_fresh(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        let Some(last_updated) = self.last_updated else {
            return false;
        };
        let age = now.signed_duration_since(last_updated);
        if age < chrono::Duration::zero() {
            return false;
        }
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => age < max_age,
            Err(_) => true,
        }
    }

    /// Copy of this snapshot with the same content and a new `last_updated`.
    fn touched(&self, now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            features: Arc::clone(&self.features),
            last_updated: Some(now),
            etag: self.etag.clone(),
            has_data: self.has_data,
        }
    }

    /// Encode the snapshot for the backup file or the shared cache.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut features: Vec<&Feature> = self.features.values().map(AsRef::as_ref).collect();
        features.sort_by(|a, b| a.name().cmp(b.name()));
        let persisted = PersistedSnapshotRef {
            e_tag: self.etag.as_deref(),
            last_updated: self.last_updated,
            features,
        };
        Ok(serde_json::to_vec(&persisted)?)
    }

    /// Decode a snapshot written by [`Snapshot::to_bytes`].
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Snapshot> {
        let persisted: PersistedSnapshot = serde_json::from_slice(bytes)?;
        let features = persisted
            .features
            .iter()
            .map(Feature::from_wire)
            .collect::<Result<Vec<_>>>()?;
        let features = features
            .into_iter()
            .map(|feature| (feature.name().to_owned(), Arc::new(feature)))
            .collect();
        Ok(Snapshot {
            features: Arc::new(features),
            last_updated: persisted.last_updated,
            etag: persisted.e_tag,
            has_data: true,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSnapshotRef<'a> {
    e_tag: Option<&'a str>,
    last_updated: Option<DateTime<Utc>>,
    features: Vec<&'a Feature>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSnapshot {
    e_tag: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    features: Vec<serde_json::Value>,
}

/// `LocalStore` holds the current [`Snapshot`] and replaces it atomically.
///
/// Readers get an `Arc` to an immutable snapshot and never observe a partially applied update.
/// The lock is only held for the duration of an `Arc` clone or swap.
#[derive(Debug, Default)]
pub struct LocalStore {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        LocalStore::default()
    }

    /// Get the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        // The lock only guards an Arc swap, so a writer that panicked cannot have left a partial
        // value behind. Recover from poisoning instead of crashing the app.
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        snapshot.clone()
    }

    /// Replace all features at once, marking the data fresh as of now.
    pub fn reset(&self, features: Vec<Feature>, etag: Option<String>) -> Arc<Snapshot> {
        self.replace(Snapshot::new(features, etag, Utc::now()))
    }

    /// Install `snapshot` as the current one.
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        // Constructing new value before requesting the lock to minimize lock span.
        let snapshot = Arc::new(snapshot);

        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = snapshot.clone();
        snapshot
    }

    /// Install `snapshot` unless the current one is at least as recent. Returns the installed
    /// snapshot, or `None` if it was older.
    ///
    /// The comparison happens under the write lock, so a concurrent `reset` is never rolled back.
    pub fn replace_if_newer(&self, snapshot: Snapshot) -> Option<Arc<Snapshot>> {
        let snapshot = Arc::new(snapshot);

        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.has_data && snapshot.last_updated <= slot.last_updated {
            return None;
        }
        *slot = snapshot.clone();
        Some(snapshot)
    }

    /// Mark the current data fresh as of now without changing its content.
    pub fn touch_last_updated(&self) -> Arc<Snapshot> {
        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = Arc::new(slot.touched(Utc::now()));
        *slot = snapshot.clone();
        snapshot
    }

    /// Whether a feature named `name` is known.
    pub fn has(&self, name: &str) -> bool {
        self.snapshot().features.contains_key(name)
    }

    /// Get a feature by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFeature`] if there is no such feature.
    pub fn get(&self, name: &str) -> Result<Arc<Feature>> {
        self.snapshot()
            .features
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFeature(name.to_owned()))
    }

    /// Get all features.
    pub fn get_all(&self) -> Arc<FeatureMap> {
        self.snapshot().features.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::Utc;

    use super::{LocalStore, Snapshot};
    use crate::{
        feature::{Feature, FeatureStrategy},
        Error,
    };

    fn feature(name: &str, enabled: bool) -> Feature {
        Feature::new(
            name,
            None,
            enabled,
            vec![FeatureStrategy::new(
                "userWithId",
                HashMap::from([("userIds".to_owned(), "1,2".to_owned())]),
            )],
            None,
        )
        .unwrap()
    }

    #[test]
    fn starts_without_data() {
        let store = LocalStore::new();
        let snapshot = store.snapshot();

        assert!(!snapshot.has_data());
        assert!(snapshot.last_updated().is_none());
        assert!(!snapshot.is_fresh(Utc::now(), Duration::from_secs(3600)));
        assert!(matches!(store.get("x"), Err(Error::UnknownFeature(_))));
    }

    #[test]
    fn reset_replaces_everything() {
        let store = LocalStore::new();
        store.reset(vec![feature("a", true), feature("b", false)], None);
        store.reset(vec![feature("c", true)], Some("v2".to_owned()));

        let all = store.get_all();
        assert_eq!(all.len(), 1);
        assert!(!store.has("a"));
        assert_eq!(*store.get("c").unwrap(), feature("c", true));
        assert_eq!(store.snapshot().etag(), Some("v2"));
    }

    #[test]
    fn reset_with_no_features_still_has_data() {
        let store = LocalStore::new();
        store.reset(vec![], None);

        assert!(store.snapshot().has_data());
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn get_all_matches_input() {
        let input = vec![feature("a", true), feature("b", false)];
        let store = LocalStore::new();
        store.reset(input.clone(), None);

        let all = store.get_all();
        for feature in input {
            let stored = &all[feature.name()];
            assert_eq!(stored.is_enabled(), feature.is_enabled());
            assert_eq!(stored.strategies(), feature.strategies());
        }
    }

    #[test]
    fn touch_keeps_content() {
        let store = LocalStore::new();
        let before = store.reset(vec![feature("a", true)], Some("etag".to_owned()));
        std::thread::sleep(Duration::from_millis(5));
        let after = store.touch_last_updated();

        assert!(Arc::ptr_eq(before.features(), after.features()));
        assert_eq!(after.etag(), Some("etag"));
        assert!(after.last_updated() > before.last_updated());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let store = LocalStore::new();
        store.reset(vec![feature("a", true)], None);
        let old = store.snapshot();

        store.reset(vec![feature("b", true)], None);

        assert!(old.features().contains_key("a"));
        assert!(!old.features().contains_key("b"));
        assert!(store.has("b"));
    }

    #[test]
    fn can_reset_from_another_thread() {
        let store = Arc::new(LocalStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.reset(vec![feature("a", true)], None);
            })
            .join();
        }

        assert!(store.has("a"));
    }

    #[test]
    fn freshness_window() {
        let now = Utc::now();
        let snapshot = Snapshot::new(vec![], None, now - chrono::Duration::seconds(10));

        assert!(snapshot.is_fresh(now, Duration::from_secs(15)));
        assert!(!snapshot.is_fresh(now, Duration::from_secs(10)));
        assert!(!snapshot.is_fresh(now, Duration::ZERO));
    }

    #[test]
    fn future_timestamp_is_stale() {
        let now = Utc::now();
        let snapshot = Snapshot::new(vec![], None, now + chrono::Duration::seconds(30));

        assert!(!snapshot.is_fresh(now, Duration::from_secs(60)));
    }

    #[test]
    fn replace_if_newer_never_goes_back_in_time() {
        let now = Utc::now();
        let store = LocalStore::new();

        let older = Snapshot::new(vec![feature("old", true)], None, now - chrono::Duration::seconds(10));
        assert!(store.replace_if_newer(older.clone()).is_some());

        store.replace(Snapshot::new(vec![feature("new", true)], None, now));
        assert!(store.replace_if_newer(older).is_none());
        assert!(store.has("new"));
        assert!(!store.has("old"));

        let newest = Snapshot::new(vec![feature("newest", true)], None, now + chrono::Duration::seconds(1));
        assert!(store.replace_if_newer(newest).is_some());
        assert!(store.has("newest"));
    }

    #[test]
    fn poisoned_lock_keeps_serving() {
        let store = Arc::new(LocalStore::new());
        store.reset(vec![feature("a", true)], None);

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                let _slot = store.snapshot.write().unwrap();
                panic!("writer panicked while holding the lock");
            })
            .join();
        }
        assert!(store.snapshot.is_poisoned());

        assert!(store.has("a"));
        store.reset(vec![feature("b", true)], None);
        assert!(store.has("b"));
        store.touch_last_updated();
    }

    #[test]
    fn persisted_snapshot_decodes_to_same_content() {
        let snapshot = Snapshot::new(
            vec![feature("a", true), feature("b", false)],
            Some("W/\"abc\"".to_owned()),
            Utc::now(),
        );

        let decoded = Snapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.features(), snapshot.features());
        assert_eq!(decoded.etag(), snapshot.etag());
        assert_eq!(decoded.last_updated(), snapshot.last_updated());
        assert!(decoded.has_data());
    }

    #[test]
    fn corrupt_persisted_snapshot_is_an_error() {
        assert!(matches!(
            Snapshot::from_bytes(b"{\"features\": 12}"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            Snapshot::from_bytes(br#"{"eTag": null, "lastUpdated": null, "features": [{"name": "x"}]}"#),
            Err(Error::InvalidFeature(_))
        ));
    }
}
