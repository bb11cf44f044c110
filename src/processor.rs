use crate::{feature::Feature, strategy::StrategyRegistry, Context};

/// Decides whether a feature is on for a given context by walking its strategies.
#[derive(Debug)]
pub struct Processor {
    registry: StrategyRegistry,
}

impl Processor {
    /// Create a processor evaluating features against `registry`.
    pub fn new(registry: StrategyRegistry) -> Processor {
        Processor { registry }
    }

    /// Strategies this processor knows about.
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Evaluate `feature` for `context`.
    ///
    /// A disabled feature is always off. Otherwise strategies are tried in order and the first
    /// one that activates wins; later strategies are not called. Strategies that are not
    /// registered are skipped. When nothing activates, `default_result` is returned.
    pub fn process(&self, feature: &Feature, context: &Context, default_result: bool) -> bool {
        if !feature.is_enabled() {
            return false;
        }

        for feature_strategy in feature.strategies() {
            let Ok(strategy) = self.registry.get(feature_strategy.name()) else {
                log::warn!(target: "unleash",
                           feature_name = feature.name(),
                           strategy_name = feature_strategy.name();
                           "strategy is not registered, skipping it");
                continue;
            };

            if strategy.is_enabled(feature_strategy.parameters(), context) {
                return true;
            }
        }

        default_result
    }
}
