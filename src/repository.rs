//! Keeps the local feature set fresh: decides when to poll the server, coordinates refreshes
//! between processes, and falls back to the shared cache or the backup when the server is not
//! available.
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    api::{FetchOutcome, UnleashApi},
    backup::BackupStore,
    cache::{sanitize_key, SharedCache},
    feature::Feature,
    lock::ExclusiveLock,
    store::{FeatureMap, LocalStore, Snapshot},
    Error, Result, Settings,
};

/// How long a snapshot stays in the shared cache: one week.
const SNAPSHOT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Releases the update lock when dropped, whether the refresh succeeded, failed or panicked.
struct UpdateLockGuard<'a> {
    lock: &'a dyn ExclusiveLock,
    key: &'a str,
}

impl Drop for UpdateLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.key);
    }
}

pub(crate) struct Repository {
    settings: Arc<Settings>,
    store: LocalStore,
    api: UnleashApi,
    backup: Box<dyn BackupStore>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    lock: Box<dyn ExclusiveLock>,
    storage_key: String,
    /// Holds the `last_updated` of the cached snapshot, so that stale readers can tell whether
    /// the snapshot is worth decoding.
    marker_key: String,
    lock_key: String,
    loaded: OnceLock<()>,
}

impl Repository {
    pub fn new(
        settings: Arc<Settings>,
        api: UnleashApi,
        backup: Box<dyn BackupStore>,
        shared_cache: Option<Arc<dyn SharedCache>>,
        lock: Box<dyn ExclusiveLock>,
    ) -> Repository {
        let storage_key = sanitize_key(&format!("unleash-repo-v1-{}", settings.app_name));
        let marker_key = format!("{storage_key}.updated");
        let lock_key = sanitize_key(&format!("unleash-update-lock-{}", settings.app_name));
        Repository {
            settings,
            store: LocalStore::new(),
            api,
            backup,
            shared_cache,
            lock,
            storage_key,
            marker_key,
            lock_key,
            loaded: OnceLock::new(),
        }
    }

    /// Make sure the local data is fresh, refreshing it from the server if needed.
    ///
    /// Never waits for another refresher: if someone else holds the update lock, the current
    /// (possibly stale) data is kept. Failures to reach the server are absorbed as long as there
    /// is any data to serve.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDataAvailable`] if there is no data and none could be loaded.
    pub fn fetch(&self, force: bool) -> Result<()> {
        self.ensure_loaded();

        let now = Utc::now();
        if !force && self.store.snapshot().is_fresh(now, self.settings.update_interval) {
            return Ok(());
        }

        if !force && self.sync_from_shared_cache() {
            log::debug!(target: "unleash", "adopted fresher features from shared cache");
            return Ok(());
        }

        if !self.settings.server_refresh {
            return self.ignore_or_fail();
        }

        if !self
            .lock
            .try_acquire(&self.lock_key, self.settings.lock_ttl.max(Settings::MIN_LOCK_TTL))
        {
            log::debug!(target: "unleash", "another client is refreshing features, serving current data");
            return Ok(());
        }
        let _guard = UpdateLockGuard {
            lock: self.lock.as_ref(),
            key: &self.lock_key,
        };

        // Someone may have finished a refresh between the freshness check and taking the lock.
        if !force && self.store.snapshot().is_fresh(Utc::now(), self.settings.update_interval) {
            return Ok(());
        }

        match self.refresh() {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!(target: "unleash", "failed to refresh features from server: {:?}", err);
                self.ignore_or_fail()
            }
        }
    }

    /// Fetch from the server and apply the result. Must be called with the update lock held.
    fn refresh(&self) -> Result<()> {
        let snapshot = self.store.snapshot();

        match self.api.fetch_features(snapshot.etag())? {
            FetchOutcome::NotModified { etag } => {
                if !snapshot.has_data() || etag != snapshot.etag().unwrap_or("") {
                    log::warn!(target: "unleash", etag = etag.as_str(); "not modified response does not match stored data");
                    return Err(Error::UnexpectedStatus(304));
                }
                log::debug!(target: "unleash", "features not modified");
                let snapshot = self.store.touch_last_updated();
                self.persist(&snapshot);
            }
            FetchOutcome::Updated { features, etag } => {
                let snapshot = self.store.reset(features, etag);
                self.persist(&snapshot);
            }
        }
        Ok(())
    }

    fn ignore_or_fail(&self) -> Result<()> {
        if self.store.snapshot().has_data() {
            Ok(())
        } else {
            log::error!(target: "unleash", "could not load feature data from server, shared cache or backup");
            Err(Error::NoDataAvailable)
        }
    }

    /// Cold start: shared cache first, then backup, otherwise stay empty.
    fn ensure_loaded(&self) {
        self.loaded.get_or_init(|| {
            if let Some(snapshot) = self.load_from_shared_cache() {
                log::debug!(target: "unleash", "loaded features from shared cache");
                self.store.replace(snapshot);
                return;
            }
            if let Some(snapshot) = self.load_from_backup() {
                log::debug!(target: "unleash", "loaded features from backup");
                let snapshot = self.store.replace(snapshot);
                self.save_to_shared_cache(&snapshot);
            }
        });
    }

    /// Adopt the shared cache's snapshot if it is newer than ours. Returns `true` if the data is
    /// fresh afterwards.
    fn sync_from_shared_cache(&self) -> bool {
        let Some(cache) = &self.shared_cache else {
            return false;
        };
        let current = self.store.snapshot();
        if let Some(cached_last_updated) = self.cached_last_updated(cache.as_ref()) {
            if current.has_data() && Some(cached_last_updated) <= current.last_updated() {
                return false;
            }
        }

        let Some(cached) = self.load_from_shared_cache() else {
            return false;
        };
        match self.store.replace_if_newer(cached) {
            Some(adopted) => adopted.is_fresh(Utc::now(), self.settings.update_interval),
            None => false,
        }
    }

    /// `last_updated` of the snapshot in the shared cache, read from its marker. `None` if the
    /// marker is missing or unreadable, in which case the snapshot itself has to be consulted.
    fn cached_last_updated(&self, cache: &dyn SharedCache) -> Option<DateTime<Utc>> {
        let marker = match cache.get(&self.marker_key) {
            Ok(marker) => marker?,
            Err(err) => {
                log::warn!(target: "unleash", "failed to read features marker from shared cache: {:?}", err);
                return None;
            }
        };
        let marker = std::str::from_utf8(&marker).ok()?;
        DateTime::parse_from_rfc3339(marker)
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .ok()
    }

    fn load_from_shared_cache(&self) -> Option<Snapshot> {
        let cache = self.shared_cache.as_ref()?;
        let bytes = match cache.get(&self.storage_key) {
            Ok(bytes) => bytes?,
            Err(err) => {
                log::warn!(target: "unleash", "failed to read features from shared cache: {:?}", err);
                return None;
            }
        };
        match Snapshot::from_bytes(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                log::warn!(target: "unleash", "ignoring corrupt features in shared cache: {:?}", err);
                None
            }
        }
    }

    fn load_from_backup(&self) -> Option<Snapshot> {
        let load = || -> Result<Option<Snapshot>> {
            if !self.backup.exists(&self.storage_key)? {
                return Ok(None);
            }
            let bytes = self.backup.read(&self.storage_key)?;
            Snapshot::from_bytes(&bytes).map(Some)
        };
        match load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!(target: "unleash", "failed to load features from backup: {:?}", err);
                None
            }
        }
    }

    /// Write `snapshot` to the backup and the shared cache. Failures are logged: the data is
    /// already live in memory.
    fn persist(&self, snapshot: &Snapshot) {
        let bytes = match snapshot.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!(target: "unleash", "failed to encode features: {:?}", err);
                return;
            }
        };
        if let Err(err) = self.backup.write(&self.storage_key, &bytes) {
            log::warn!(target: "unleash", "failed to write features backup: {:?}", err);
        }
        self.save_bytes_to_shared_cache(&bytes, snapshot.last_updated());
    }

    fn save_to_shared_cache(&self, snapshot: &Snapshot) {
        if self.shared_cache.is_none() {
            return;
        }
        match snapshot.to_bytes() {
            Ok(bytes) => self.save_bytes_to_shared_cache(&bytes, snapshot.last_updated()),
            Err(err) => log::warn!(target: "unleash", "failed to encode features: {:?}", err),
        }
    }

    /// Write the snapshot, then its marker. A reader that sees the new marker finds the new
    /// snapshot.
    fn save_bytes_to_shared_cache(&self, bytes: &[u8], last_updated: Option<DateTime<Utc>>) {
        let Some(cache) = &self.shared_cache else {
            return;
        };
        if let Err(err) = cache.set(&self.storage_key, bytes, SNAPSHOT_CACHE_TTL) {
            log::warn!(target: "unleash", "failed to write features to shared cache: {:?}", err);
            return;
        }
        let Some(last_updated) = last_updated else {
            return;
        };
        let marker = last_updated.to_rfc3339_opts(SecondsFormat::Nanos, true);
        if let Err(err) = cache.set(&self.marker_key, marker.as_bytes(), SNAPSHOT_CACHE_TTL) {
            log::warn!(target: "unleash", "failed to write features marker to shared cache: {:?}", err);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.store.has(name)
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownFeature`] if there is no such feature.
    pub fn get(&self, name: &str) -> Result<Arc<Feature>> {
        self.store.get(name)
    }

    pub fn get_all(&self) -> Arc<FeatureMap> {
        self.store.get_all()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }
}
