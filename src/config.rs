use std::{sync::Arc, time::Duration};

use crate::{
    backup::{BackupStore, FileBackup},
    cache::SharedCache,
    metrics::MetricsCollector,
    strategy::Strategy,
    transport::{ReqwestTransport, Transport},
    Client, Result,
};

/// Resolved, immutable client settings shared by every component of a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Logical application name. Identifies the app to the server and namespaces storage keys.
    pub app_name: String,
    /// Identifier of this application instance.
    pub instance_id: String,
    /// Base URL of the Unleash server, without trailing slashes.
    pub unleash_host: String,
    /// How long fetched data is considered fresh.
    pub update_interval: Duration,
    /// Whether stale data is refreshed from the server. When `false` the client serves whatever
    /// the shared cache or backup holds, however old.
    pub server_refresh: bool,
    /// Whether the client announces itself to the server when created.
    pub register_on_start: bool,
    /// Timeout of each request to the server.
    pub request_timeout: Duration,
    /// How long an update lock is held at most before it expires on its own.
    pub lock_ttl: Duration,
}

impl Settings {
    /// Default value for [`Settings::unleash_host`].
    pub const DEFAULT_UNLEASH_HOST: &'static str = "http://localhost:4242";
    /// Default value for [`Settings::update_interval`].
    pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(15);
    /// Default value for [`Settings::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default value for [`Settings::lock_ttl`].
    pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
    /// Shortest [`Settings::lock_ttl`] in effect. A lock must always expire on its own, and a
    /// zero TTL means "never expires" to a [`SharedCache`].
    pub const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

    /// Create settings with default values.
    pub fn new(app_name: impl Into<String>, instance_id: impl Into<String>) -> Settings {
        Settings {
            app_name: app_name.into(),
            instance_id: instance_id.into(),
            unleash_host: Settings::DEFAULT_UNLEASH_HOST.to_owned(),
            update_interval: Settings::DEFAULT_UPDATE_INTERVAL,
            server_refresh: true,
            register_on_start: false,
            request_timeout: Settings::DEFAULT_REQUEST_TIMEOUT,
            lock_ttl: Settings::DEFAULT_LOCK_TTL,
        }
    }

    /// Read settings from the environment.
    ///
    /// | variable | setting | default |
    /// |---|---|---|
    /// | `UNLEASH_APP_NAME` | [`app_name`](Settings::app_name) | `"default"` |
    /// | `UNLEASH_INSTANCE_ID` | [`instance_id`](Settings::instance_id) | machine hostname |
    /// | `UNLEASH_URL` | [`unleash_host`](Settings::unleash_host) | `http://localhost:4242` |
    /// | `UNLEASH_UPDATE_INTERVAL_SECS` | [`update_interval`](Settings::update_interval) | 15 |
    pub fn from_env() -> Settings {
        let app_name = std::env::var("UNLEASH_APP_NAME").unwrap_or_else(|_| "default".to_owned());
        let instance_id = std::env::var("UNLEASH_INSTANCE_ID")
            .unwrap_or_else(|_| gethostname::gethostname().to_string_lossy().into_owned());

        let mut settings = Settings::new(app_name, instance_id);
        if let Ok(url) = std::env::var("UNLEASH_URL") {
            settings.unleash_host = strip_trailing_slashes(&url);
        }
        if let Some(secs) = std::env::var("UNLEASH_UPDATE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            settings.update_interval = Duration::from_secs(secs);
        }
        settings
    }
}

fn strip_trailing_slashes(url: &str) -> String {
    url.trim_end_matches('/').to_owned()
}

/// Configuration for [`Client`].
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use unleash_client::ClientConfig;
/// let client = ClientConfig::new("my-app", "instance-1")
///     .unleash_host("https://unleash.example.com/")
///     .update_interval(Duration::from_secs(30))
///     .to_client()
///     .unwrap();
/// ```
pub struct ClientConfig {
    pub(crate) settings: Settings,
    pub(crate) backup: Box<dyn BackupStore>,
    pub(crate) shared_cache: Option<Arc<dyn SharedCache>>,
    pub(crate) metrics: Option<Arc<dyn MetricsCollector>>,
    pub(crate) strategies: Vec<Box<dyn Strategy>>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl ClientConfig {
    /// Create a default configuration for application `app_name`, instance `instance_id`.
    ///
    /// ```
    /// # use unleash_client::ClientConfig;
    /// ClientConfig::new("my-app", "instance-1");
    /// ```
    pub fn new(app_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        ClientConfig::from_settings(Settings::new(app_name, instance_id))
    }

    /// Create a configuration from already resolved settings, e.g. [`Settings::from_env`].
    pub fn from_settings(settings: Settings) -> Self {
        ClientConfig {
            settings,
            backup: Box::new(FileBackup::in_temp_dir()),
            shared_cache: None,
            metrics: None,
            strategies: Vec::new(),
            transport: None,
        }
    }

    /// Override the Unleash server URL. Trailing slashes are removed.
    pub fn unleash_host(mut self, unleash_host: impl AsRef<str>) -> Self {
        self.settings.unleash_host = strip_trailing_slashes(unleash_host.as_ref());
        self
    }

    /// Set how long fetched data is considered fresh.
    pub fn update_interval(mut self, update_interval: Duration) -> Self {
        self.settings.update_interval = update_interval;
        self
    }

    /// Enable or disable refreshing from the server. Enabled by default.
    pub fn server_refresh(mut self, server_refresh: bool) -> Self {
        self.settings.server_refresh = server_refresh;
        self
    }

    /// Announce the client to the server when it is created. Disabled by default.
    pub fn register_on_start(mut self, register_on_start: bool) -> Self {
        self.settings.register_on_start = register_on_start;
        self
    }

    /// Set the timeout of requests to the server.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.settings.request_timeout = request_timeout;
        self
    }

    /// Set how long an update lock may be held before it expires on its own. Values below
    /// [`Settings::MIN_LOCK_TTL`] are raised to it.
    pub fn lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.settings.lock_ttl = lock_ttl.max(Settings::MIN_LOCK_TTL);
        self
    }

    /// Set where backups are kept. Defaults to a file in the OS temporary directory.
    pub fn backup(mut self, backup: impl BackupStore + 'static) -> Self {
        self.backup = Box::new(backup);
        self
    }

    /// Share data and update locks with other processes through `shared_cache`.
    pub fn shared_cache(mut self, shared_cache: impl SharedCache + 'static) -> Self {
        self.shared_cache = Some(Arc::new(shared_cache));
        self
    }

    /// Count evaluation results in `metrics`.
    pub fn metrics(mut self, metrics: impl MetricsCollector + 'static) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    /// Register a custom strategy in addition to the standard ones.
    pub fn strategy(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Send requests through `transport` instead of the default `reqwest` client.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn take_transport(&mut self) -> Result<Arc<dyn Transport>> {
        match self.transport.take() {
            Some(transport) => Ok(transport),
            None => Ok(Arc::new(ReqwestTransport::new(
                self.settings.request_timeout,
            )?)),
        }
    }

    /// Create a new [`Client`] using this configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the server URL is invalid.
    /// - [`Error::DuplicateStrategy`](crate::Error::DuplicateStrategy) if a custom strategy
    ///   reuses a registered name.
    /// - [`Error::Network`](crate::Error::Network) if the HTTP client cannot be initialized.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
