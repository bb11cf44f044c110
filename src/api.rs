//! Requests the client sends to the Unleash server.
use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    feature::{Feature, FeaturesResponse},
    metrics::FeatureStats,
    transport::{HttpRequest, HttpResponse, Method, Transport},
    Error, Result, Settings,
};

const FEATURES_ENDPOINT: &str = "/api/features";
const REGISTER_ENDPOINT: &str = "/api/client/register";
const METRICS_ENDPOINT: &str = "/api/client/metrics";

/// Outcome of a successful conditional feature fetch.
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    /// `304 Not Modified`, along with the revalidation tag the server sent (empty if none).
    NotModified { etag: String },
    /// A full, already hydrated feature set.
    Updated {
        features: Vec<Feature>,
        etag: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration<'a> {
    app_name: &'a str,
    instance_id: &'a str,
    strategies: &'a [&'a str],
    started: String,
    interval: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsReport<'a> {
    app_name: &'a str,
    instance_id: &'a str,
    bucket: MetricsBucket<'a>,
}

#[derive(Serialize)]
struct MetricsBucket<'a> {
    start: String,
    stop: String,
    toggles: &'a BTreeMap<String, FeatureStats>,
}

/// Client of the Unleash server API.
#[derive(Clone)]
pub(crate) struct UnleashApi {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
}

impl UnleashApi {
    pub fn new(settings: Arc<Settings>, transport: Arc<dyn Transport>) -> UnleashApi {
        UnleashApi {
            settings,
            transport,
        }
    }

    fn url(&self, endpoint: &str) -> Result<url::Url> {
        url::Url::parse(&format!("{}{}", self.settings.unleash_host, endpoint))
            .map_err(Error::InvalidBaseUrl)
    }

    /// Fail early on a server URL that can never work.
    pub fn validate(&self) -> Result<()> {
        self.url(FEATURES_ENDPOINT).map(|_| ())
    }

    /// Conditionally fetch the feature set, sending `etag` as `If-None-Match`.
    ///
    /// # Errors
    ///
    /// Any status other than `304` or `2xx` is [`Error::UnexpectedStatus`]. A body that isn't a
    /// valid feature list fails with [`Error::Json`] or [`Error::InvalidFeature`].
    pub fn fetch_features(&self, etag: Option<&str>) -> Result<FetchOutcome> {
        let request = HttpRequest {
            method: Method::Get,
            url: self.url(FEATURES_ENDPOINT)?,
            headers: vec![
                ("If-None-Match".to_owned(), etag.unwrap_or("").to_owned()),
                ("Content-Type".to_owned(), "application/json".to_owned()),
                ("UNLEASH-APPNAME".to_owned(), self.settings.app_name.clone()),
                (
                    "UNLEASH-INSTANCEID".to_owned(),
                    self.settings.instance_id.clone(),
                ),
            ],
            body: None,
        };

        log::debug!(target: "unleash", "fetching features");
        let response = self.transport.send(&request)?;
        let response_etag = response.joined_header("ETag");

        if response.status == 304 {
            return Ok(FetchOutcome::NotModified {
                etag: response_etag.unwrap_or_default(),
            });
        }
        if !response.is_success() {
            return Err(Error::UnexpectedStatus(response.status));
        }

        let features = serde_json::from_slice::<FeaturesResponse>(&response.body)?.into_features()?;
        log::debug!(target: "unleash", count = features.len(); "successfully fetched features");

        Ok(FetchOutcome::Updated {
            features,
            etag: response_etag,
        })
    }

    /// Announce this client instance and the strategies it implements.
    pub fn register(&self, strategies: &[&str], started: DateTime<Utc>) -> Result<()> {
        let body = serde_json::to_vec(&Registration {
            app_name: &self.settings.app_name,
            instance_id: &self.settings.instance_id,
            strategies,
            started: started.to_rfc3339(),
            interval: self.settings.update_interval.as_secs(),
        })?;
        let response = self.post(REGISTER_ENDPOINT, body)?;
        if !response.is_success() {
            return Err(Error::UnexpectedStatus(response.status));
        }
        Ok(())
    }

    /// Report evaluation counts collected between `start` and `stop`.
    ///
    /// # Errors
    ///
    /// The server acknowledges reports with `202 Accepted`; anything else is
    /// [`Error::UnexpectedStatus`].
    pub fn send_metrics(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        toggles: &BTreeMap<String, FeatureStats>,
    ) -> Result<()> {
        let body = serde_json::to_vec(&MetricsReport {
            app_name: &self.settings.app_name,
            instance_id: &self.settings.instance_id,
            bucket: MetricsBucket {
                start: start.to_rfc3339(),
                stop: stop.to_rfc3339(),
                toggles,
            },
        })?;
        let response = self.post(METRICS_ENDPOINT, body)?;
        if response.status != 202 {
            return Err(Error::UnexpectedStatus(response.status));
        }
        Ok(())
    }

    fn post(&self, endpoint: &str, body: Vec<u8>) -> Result<HttpResponse> {
        let request = HttpRequest {
            method: Method::Post,
            url: self.url(endpoint)?,
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
            body: Some(body),
        };
        self.transport.send(&request)
    }
}
