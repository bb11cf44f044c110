//! Feature toggle definitions and their hydration from the server wire format.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fields every wire feature record must carry. A record that lacks one of them is rejected
/// instead of being filled with defaults.
const REQUIRED_FEATURE_FIELDS: [&str; 3] = ["name", "enabled", "strategies"];
const REQUIRED_STRATEGY_FIELDS: [&str; 1] = ["name"];

/// A feature toggle: a named on/off gate with an ordered list of activation strategies.
///
/// `Feature` is immutable once constructed and always has at least one strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    name: String,
    description: Option<String>,
    enabled: bool,
    strategies: Vec<FeatureStrategy>,
    created_at: Option<String>,
}

/// A reference to a registered strategy together with the parameters configured for this
/// particular feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureStrategy {
    name: String,
    parameters: HashMap<String, String>,
}

impl FeatureStrategy {
    /// Create a new strategy entry.
    pub fn new(name: impl Into<String>, parameters: HashMap<String, String>) -> FeatureStrategy {
        FeatureStrategy {
            name: name.into(),
            parameters,
        }
    }

    /// Name of the strategy this entry refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters passed to the strategy.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }
}

impl Feature {
    /// Create a new feature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFeature`] if `strategies` is empty. A feature without strategies
    /// can never be produced by the server, so this indicates a programming error.
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        enabled: bool,
        strategies: Vec<FeatureStrategy>,
        created_at: Option<String>,
    ) -> Result<Feature> {
        let name = name.into();
        if strategies.is_empty() {
            return Err(Error::InvalidFeature(format!(
                "feature {name:?} has no strategies"
            )));
        }
        Ok(Feature {
            name,
            description,
            enabled,
            strategies,
            created_at,
        })
    }

    /// Hydrate a feature from a single record of the `features` array returned by the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFeature`] if a required field is missing or has the wrong type.
    pub fn from_wire(value: &serde_json::Value) -> Result<Feature> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidFeature("feature record is not an object".to_owned()))?;
        check_required_fields("feature", object, &REQUIRED_FEATURE_FIELDS)?;

        let name = object["name"]
            .as_str()
            .ok_or_else(|| Error::InvalidFeature("field `name` must be a string".to_owned()))?;
        let description = match object.get("description") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            _ => {
                return Err(Error::InvalidFeature(format!(
                    "feature {name:?}: field `description` must be a string"
                )))
            }
        };
        let enabled = object["enabled"].as_bool().ok_or_else(|| {
            Error::InvalidFeature(format!("feature {name:?}: field `enabled` must be a bool"))
        })?;
        let strategies = object["strategies"]
            .as_array()
            .ok_or_else(|| {
                Error::InvalidFeature(format!(
                    "feature {name:?}: field `strategies` must be an array"
                ))
            })?
            .iter()
            .map(FeatureStrategy::from_wire)
            .collect::<Result<Vec<_>>>()?;
        let created_at = object
            .get("createdAt")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);

        Feature::new(name, description, enabled, strategies, created_at)
    }

    /// Unique name of the feature.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether the feature gate is on. A disabled feature is never enabled, whatever its
    /// strategies say.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Strategies in the order they are evaluated.
    pub fn strategies(&self) -> &[FeatureStrategy] {
        &self.strategies
    }

    /// Creation timestamp as reported by the server. Informational only.
    pub fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }
}

impl FeatureStrategy {
    fn from_wire(value: &serde_json::Value) -> Result<FeatureStrategy> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidFeature("strategy record is not an object".to_owned()))?;
        check_required_fields("strategy", object, &REQUIRED_STRATEGY_FIELDS)?;

        let name = object["name"].as_str().ok_or_else(|| {
            Error::InvalidFeature("strategy field `name` must be a string".to_owned())
        })?;

        // Parameters are strings on the wire, but older servers send bare numbers for
        // percentages.
        let parameters = match object.get("parameters") {
            None | Some(serde_json::Value::Null) => HashMap::new(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        serde_json::Value::Null => return None,
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Some((key.clone(), value))
                })
                .collect(),
            _ => {
                return Err(Error::InvalidFeature(format!(
                    "strategy {name:?}: field `parameters` must be an object"
                )))
            }
        };

        Ok(FeatureStrategy::new(name, parameters))
    }
}

fn check_required_fields(
    kind: &str,
    object: &serde_json::Map<String, serde_json::Value>,
    required: &[&str],
) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidFeature(format!(
            "{kind} record is missing fields: {}",
            missing.join(", ")
        )))
    }
}

/// Body of a successful `GET /api/features` response.
#[derive(Debug, Deserialize)]
pub(crate) struct FeaturesResponse {
    pub features: Vec<serde_json::Value>,
}

impl FeaturesResponse {
    /// Hydrate every record. One malformed record rejects the whole response.
    pub fn into_features(self) -> Result<Vec<Feature>> {
        self.features.iter().map(Feature::from_wire).collect()
    }
}
