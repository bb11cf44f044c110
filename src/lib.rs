//! A client for Unleash, an open-source feature toggle service.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that answers "is this feature enabled?" for a request
//! [`Context`]. Features are fetched from the Unleash server, kept in memory, and evaluated
//! locally by walking their activation [strategies](Strategy).
//!
//! The client refreshes its data lazily: an evaluation first checks whether the data is older
//! than the configured update interval and only then contacts the server. When several processes
//! share a [`SharedCache`], an update lock makes sure only one of them refreshes at a time while
//! the others keep serving what they have and pick up the new data from the cache. Every
//! successful fetch is also written to a [`BackupStore`], so a process can start and serve
//! features while the server is down.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag evaluation fails in one case only: the process has never had any data and can't load
//! any now ([`Error::NoDataAvailable`]). Network failures with data at hand are logged and
//! absorbed, and unknown features evaluate to the caller-supplied default. In production it is
//! recommended to fall back to the default on errors.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, under the `unleash` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into client operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/simple` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod api;
mod backup;
mod cache;
mod client;
mod config;
pub mod context;
mod error;
mod feature;
mod lock;
mod metrics;
mod processor;
mod reporter;
mod repository;
mod sharder;
mod store;
pub mod strategy;
mod transport;

pub use backup::{BackupStore, FileBackup, MemoryBackup};
pub use cache::{validate_key, MemoryCache, SharedCache};
pub use client::Client;
pub use config::{ClientConfig, Settings};
pub use context::Context;
pub use error::{Error, Result};
pub use feature::{Feature, FeatureStrategy};
pub use lock::{CacheLock, ExclusiveLock, LocalLock};
pub use metrics::{CacheMetrics, FeatureStats, MemoryMetrics, MetricsCollector};
pub use processor::Processor;
pub use reporter::MetricsThread;
pub use sharder::{Murmur3Sharder, Sharder};
pub use store::{FeatureMap, LocalStore, Snapshot};
pub use strategy::{Strategy, StrategyRegistry};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
