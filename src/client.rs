use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    api::UnleashApi,
    feature::Feature,
    lock::{CacheLock, ExclusiveLock, LocalLock},
    metrics::MetricsCollector,
    processor::Processor,
    reporter::{MetricsReporter, MetricsThread},
    repository::Repository,
    store::FeatureMap,
    strategy::StrategyRegistry,
    ClientConfig, Context, Result, Settings,
};

/// A client for the Unleash API.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```no_run
/// # use unleash_client::{ClientConfig, Context};
/// let client = ClientConfig::new("my-app", "instance-1").to_client().unwrap();
/// let context = Context::new().with("userId", "42");
/// if client.is_enabled("new-checkout", &context, false).unwrap_or(false) {
///     // ...
/// }
/// ```
pub struct Client {
    settings: Arc<Settings>,
    repository: Arc<Repository>,
    processor: Processor,
    api: Arc<UnleashApi>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    reporter: Option<Arc<MetricsReporter>>,
    started: DateTime<Utc>,
    short_circuited: AtomicBool,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Does not contact the server unless [`ClientConfig::register_on_start`] is set. Features are
    /// loaded on the first evaluation or [`Client::fetch`].
    ///
    /// # Errors
    ///
    /// See [`ClientConfig::to_client`].
    pub fn new(mut config: ClientConfig) -> Result<Client> {
        let transport = config.take_transport()?;
        let ClientConfig {
            settings,
            backup,
            shared_cache,
            metrics,
            strategies,
            ..
        } = config;
        let settings = Arc::new(settings);

        let api = Arc::new(UnleashApi::new(settings.clone(), transport));
        api.validate()?;

        let mut registry = StrategyRegistry::with_standard_strategies();
        for strategy in strategies {
            registry.register_boxed(strategy)?;
        }

        let lock: Box<dyn ExclusiveLock> = match &shared_cache {
            Some(cache) => Box::new(CacheLock::new(cache.clone())),
            None => Box::new(LocalLock::new()),
        };
        let repository = Arc::new(Repository::new(
            settings.clone(),
            UnleashApi::clone(&api),
            backup,
            shared_cache,
            lock,
        ));

        let reporter = metrics.as_ref().map(|metrics| {
            Arc::new(MetricsReporter::new(
                api.clone(),
                repository.clone(),
                metrics.clone(),
            ))
        });

        let client = Client {
            settings,
            repository,
            processor: Processor::new(registry),
            api,
            metrics,
            reporter,
            started: Utc::now(),
            short_circuited: AtomicBool::new(false),
        };

        if client.settings.register_on_start {
            // Registration is informational: a failure is logged by `register` and otherwise
            // ignored.
            let _ = client.register();
        }

        Ok(client)
    }

    /// Check whether feature `key` is enabled for `context`.
    ///
    /// Refreshes the features first if they are stale. Unknown features evaluate to
    /// `default_result`, as does a feature none of whose strategies activate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDataAvailable`](crate::Error::NoDataAvailable) if no feature data has
    /// ever been loaded and none can be loaded now. Callers usually fall back to a default:
    ///
    /// ```no_run
    /// # use unleash_client::{ClientConfig, Context};
    /// # let client = ClientConfig::new("my-app", "instance-1").to_client().unwrap();
    /// let enabled = client
    ///     .is_enabled("new-checkout", &Context::new(), false)
    ///     .unwrap_or(false);
    /// ```
    pub fn is_enabled(&self, key: &str, context: &Context, default_result: bool) -> Result<bool> {
        if self.short_circuited.load(Ordering::Relaxed) {
            return Ok(default_result);
        }

        self.repository.fetch(false)?;

        let Ok(feature) = self.repository.get(key) else {
            log::debug!(target: "unleash", feature_name = key; "feature is not known, using default");
            return Ok(default_result);
        };

        let result = self.processor.process(&feature, context, default_result);

        log::trace!(target: "unleash",
                    feature_name = key,
                    context:serde = context,
                    result;
                    "evaluated a feature");

        if let Some(metrics) = &self.metrics {
            metrics.add(key, result);
        }

        Ok(result)
    }

    /// Kill switch: from now on every [`Client::is_enabled`] call returns its default without
    /// refreshing, evaluating or counting anything. Cannot be undone.
    pub fn short_circuit(&self) {
        log::warn!(target: "unleash", "client short-circuited, all features evaluate to their default");
        self.short_circuited.store(true, Ordering::Relaxed);
    }

    /// Make sure features are fresh, refreshing them from the server if they are stale or if
    /// `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDataAvailable`](crate::Error::NoDataAvailable) if there is no data to
    /// serve.
    pub fn fetch(&self, force: bool) -> Result<()> {
        self.repository.fetch(force)
    }

    /// Whether feature `name` is currently known. Does not refresh.
    pub fn has_feature(&self, name: &str) -> bool {
        self.repository.has(name)
    }

    /// Get feature `name` as currently known. Does not refresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFeature`](crate::Error::UnknownFeature) if there is no such
    /// feature.
    pub fn get_feature(&self, name: &str) -> Result<Arc<Feature>> {
        self.repository.get(name)
    }

    /// All currently known features. Does not refresh.
    pub fn get_features(&self) -> Arc<FeatureMap> {
        self.repository.get_all()
    }

    /// Strategies features are evaluated with.
    pub fn strategies(&self) -> &StrategyRegistry {
        self.processor.registry()
    }

    /// Settings the client was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Announce this client instance and its strategies to the server.
    ///
    /// # Errors
    ///
    /// Fails if the server cannot be reached or rejects the registration. Evaluation is never
    /// affected.
    pub fn register(&self) -> Result<()> {
        let strategies = self.processor.registry().names();
        self.api
            .register(&strategies, self.started)
            .inspect(|_| log::debug!(target: "unleash", "registered client"))
            .inspect_err(|err| {
                log::warn!(target: "unleash", "failed to register client: {:?}", err);
            })
    }

    /// Report evaluation counts collected since the previous report and reset them.
    ///
    /// Does nothing if no metrics collector is configured or nothing was counted.
    ///
    /// # Errors
    ///
    /// Fails if the report cannot be delivered. The counts of that report are lost.
    pub fn flush_metrics(&self) -> Result<()> {
        match &self.reporter {
            Some(reporter) => reporter.flush(),
            None => Ok(()),
        }
    }

    /// Start a thread reporting metrics every `interval`. Returns `None` if no metrics collector
    /// is configured.
    pub fn start_metrics_thread(&self, interval: Duration) -> Result<Option<MetricsThread>> {
        self.reporter
            .clone()
            .map(|reporter| MetricsThread::start(reporter, interval))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use serde_json::json;

    use crate::{
        backup::{BackupStore, MemoryBackup},
        cache::MemoryCache,
        metrics::{FeatureStats, MemoryMetrics, MetricsCollector},
        store::Snapshot,
        strategy::Strategy,
        transport::{HttpResponse, StubTransport},
        ClientConfig, Context, Error, Feature,
    };

    fn config(transport: &Arc<StubTransport>) -> ClientConfig {
        ClientConfig::new("app", "instance")
            .unleash_host("http://unleash.test")
            .backup(MemoryBackup::new())
            .transport(transport.clone())
    }

    #[test]
    fn backup_only_evaluation() {
        let transport = StubTransport::new();
        let backup = Arc::new(MemoryBackup::new());
        let snapshot = Snapshot::new(
            vec![Feature::from_wire(&json!({
                "name": "x",
                "enabled": true,
                "strategies": [{"name": "default"}]
            }))
            .unwrap()],
            None,
            chrono::Utc::now(),
        );
        backup
            .write("unleash-repo-v1-app", &snapshot.to_bytes().unwrap())
            .unwrap();

        let client = config(&transport)
            .backup(backup)
            .server_refresh(false)
            .to_client()
            .unwrap();

        assert!(client.is_enabled("x", &Context::new(), false).unwrap());
        assert!(!client.is_enabled("y", &Context::new(), false).unwrap());
        assert!(client.is_enabled("y", &Context::new(), true).unwrap());
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn server_evaluation() {
        let transport = StubTransport::new();
        let body = json!({"features": [{
            "name": "x",
            "enabled": true,
            "strategies": [{"name": "userWithId", "parameters": {"userIds": "42"}}]
        }]});
        transport.push(Ok(HttpResponse::new(200, body.to_string())));

        let client = config(&transport)
            .update_interval(Duration::from_secs(60))
            .to_client()
            .unwrap();

        assert!(client
            .is_enabled("x", &Context::new().with("userId", "42"), false)
            .unwrap());
        assert!(!client
            .is_enabled("x", &Context::new().with("userId", "7"), false)
            .unwrap());
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn short_circuit_returns_defaults_without_io() {
        let transport = StubTransport::new();
        let body = json!({"features": [
            {"name": "x", "enabled": true, "strategies": [{"name": "default"}]}
        ]});
        transport.push(Ok(HttpResponse::new(200, body.to_string())));
        let metrics = Arc::new(MemoryMetrics::new());
        let client = config(&transport)
            .metrics(metrics.clone())
            .to_client()
            .unwrap();
        assert!(client.is_enabled("x", &Context::new(), false).unwrap());

        client.short_circuit();

        assert!(!client.is_enabled("x", &Context::new(), false).unwrap());
        assert!(client.is_enabled("x", &Context::new(), true).unwrap());
        assert!(client.is_enabled("y", &Context::new(), true).unwrap());
        assert_eq!(transport.request_count(), 1);
        assert_eq!(metrics.get("x", false), FeatureStats { yes: 1, no: 0 });
    }

    #[test]
    fn short_circuit_needs_no_data() {
        let transport = StubTransport::new();
        let client = config(&transport).to_client().unwrap();

        client.short_circuit();

        assert!(client.is_enabled("x", &Context::new(), true).unwrap());
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn no_data_is_surfaced() {
        let transport = StubTransport::new();
        let client = config(&transport).to_client().unwrap();

        assert!(matches!(
            client.is_enabled("x", &Context::new(), true),
            Err(Error::NoDataAvailable)
        ));
    }

    #[test]
    fn invalid_host_is_rejected() {
        let transport = StubTransport::new();
        let result = config(&transport).unleash_host("not a url").to_client();

        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    struct AlwaysOn;

    impl Strategy for AlwaysOn {
        fn name(&self) -> &str {
            "alwaysOn"
        }

        fn is_enabled(&self, _parameters: &HashMap<String, String>, _context: &Context) -> bool {
            true
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl Strategy for Counting {
        fn name(&self) -> &str {
            "default"
        }

        fn is_enabled(&self, _parameters: &HashMap<String, String>, _context: &Context) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn custom_strategies() {
        let transport = StubTransport::new();
        let body = json!({"features": [{
            "name": "x",
            "enabled": true,
            "strategies": [{"name": "alwaysOn", "parameters": {}}]
        }]});
        transport.push(Ok(HttpResponse::new(200, body.to_string())));

        let client = config(&transport).strategy(AlwaysOn).to_client().unwrap();

        assert!(client.strategies().has("alwaysOn"));
        assert!(client.is_enabled("x", &Context::new(), false).unwrap());
    }

    #[test]
    fn duplicate_strategy_is_rejected() {
        let transport = StubTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = config(&transport)
            .strategy(Counting(calls.clone()))
            .to_client();

        assert!(matches!(result, Err(Error::DuplicateStrategy(name)) if name == "default"));
    }

    #[test]
    fn evaluations_are_counted() {
        let transport = StubTransport::new();
        let body = json!({"features": [
            {"name": "on", "enabled": true, "strategies": [{"name": "default"}]},
            {"name": "off", "enabled": false, "strategies": [{"name": "default"}]}
        ]});
        transport.push(Ok(HttpResponse::new(200, body.to_string())));
        let metrics = Arc::new(MemoryMetrics::new());

        let client = config(&transport)
            .update_interval(Duration::from_secs(60))
            .metrics(metrics.clone())
            .to_client()
            .unwrap();

        client.is_enabled("on", &Context::new(), false).unwrap();
        client.is_enabled("on", &Context::new(), false).unwrap();
        client.is_enabled("off", &Context::new(), true).unwrap();
        client.is_enabled("unknown", &Context::new(), true).unwrap();

        assert_eq!(metrics.get("on", false), FeatureStats { yes: 2, no: 0 });
        assert_eq!(metrics.get("off", false), FeatureStats { yes: 0, no: 1 });
        assert!(metrics.get("unknown", false).is_empty());

        transport.push(Ok(HttpResponse::new(202, "")));
        client.flush_metrics().unwrap();

        let request = &transport.requests()[1];
        assert_eq!(request.url.path(), "/api/client/metrics");
        assert!(metrics.get("on", false).is_empty());
    }

    #[test]
    fn flush_without_metrics_does_nothing() {
        let transport = StubTransport::new();
        let client = config(&transport).to_client().unwrap();

        client.flush_metrics().unwrap();

        assert_eq!(transport.request_count(), 0);
        assert!(client
            .start_metrics_thread(Duration::from_secs(60))
            .unwrap()
            .is_none());
    }

    #[test]
    fn registers_on_start() {
        let transport = StubTransport::new();
        transport.push(Ok(HttpResponse::new(202, "")));

        let client = config(&transport)
            .register_on_start(true)
            .to_client()
            .unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/api/client/register");
        let body: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["strategies"].as_array().unwrap().len(), 7);
        assert_eq!(body["interval"], 15);

        // A failed registration is reported to explicit callers only.
        assert!(client.register().is_err());
    }

    #[test]
    fn shared_cache_is_used_across_clients() {
        let transport = StubTransport::new();
        let body = json!({"features": [
            {"name": "x", "enabled": true, "strategies": [{"name": "default"}]}
        ]});
        transport.push(Ok(HttpResponse::new(200, body.to_string())));
        let cache = Arc::new(MemoryCache::new());

        let first = config(&transport)
            .shared_cache(cache.clone())
            .to_client()
            .unwrap();
        let second = config(&transport)
            .shared_cache(cache)
            .server_refresh(false)
            .to_client()
            .unwrap();

        assert!(first.is_enabled("x", &Context::new(), false).unwrap());
        assert!(second.is_enabled("x", &Context::new(), false).unwrap());
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn client_is_shared_between_threads() {
        let transport = StubTransport::new();
        let body = json!({"features": [
            {"name": "x", "enabled": true, "strategies": [{"name": "default"}]}
        ]});
        transport.push(Ok(HttpResponse::new(200, body.to_string())));
        let client = Arc::new(
            config(&transport)
                .update_interval(Duration::from_secs(60))
                .to_client()
                .unwrap(),
        );
        client.fetch(false).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let client = client.clone();
                std::thread::spawn(move || client.is_enabled("x", &Context::new(), false))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().unwrap());
        }
        assert_eq!(transport.request_count(), 1);
    }
}
