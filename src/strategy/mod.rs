//! Activation strategies and the registry they are looked up in.
use std::{collections::HashMap, fmt};

use crate::{Context, Error, Result};

mod standard;

pub use standard::{
    ApplicationHostnameStrategy, DefaultStrategy, GradualRolloutRandomStrategy,
    GradualRolloutStrategy, RemoteAddressStrategy, UserWithIdStrategy,
};

/// A named, parameterized activation rule.
///
/// Implementations must be cheap and must not block: they are called on the hot path of every
/// flag check.
///
/// ```
/// # use std::collections::HashMap;
/// # use unleash_client::{Context, Strategy};
/// struct BetaTesters;
///
/// impl Strategy for BetaTesters {
///     fn name(&self) -> &str {
///         "betaTesters"
///     }
///
///     fn is_enabled(&self, _parameters: &HashMap<String, String>, context: &Context) -> bool {
///         context.get("beta") == Some("true")
///     }
/// }
/// ```
pub trait Strategy: Send + Sync {
    /// Name the server refers to this strategy by. Must be unique within a registry.
    fn name(&self) -> &str;

    /// Decide whether the strategy activates the feature for `context`.
    fn is_enabled(&self, parameters: &HashMap<String, String>, context: &Context) -> bool;
}

/// Holds the strategies known to the client. Populated once at startup, read-only afterwards.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
    by_name: HashMap<String, usize>,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new() -> StrategyRegistry {
        StrategyRegistry::default()
    }

    /// Create a registry holding every standard Unleash strategy.
    pub fn with_standard_strategies() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        let standard: [Box<dyn Strategy>; 7] = [
            Box::new(DefaultStrategy),
            Box::new(UserWithIdStrategy),
            Box::new(RemoteAddressStrategy),
            Box::new(ApplicationHostnameStrategy),
            Box::new(GradualRolloutRandomStrategy),
            Box::new(GradualRolloutStrategy::by_user_id()),
            Box::new(GradualRolloutStrategy::by_session_id()),
        ];
        for strategy in standard {
            // Standard strategy names are distinct, and the registry starts empty.
            let _ = registry.register_boxed(strategy);
        }
        registry
    }

    /// Register a strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStrategy`] if a strategy with the same name is already
    /// registered.
    pub fn register(&mut self, strategy: impl Strategy + 'static) -> Result<()> {
        self.register_boxed(Box::new(strategy))
    }

    pub(crate) fn register_boxed(&mut self, strategy: Box<dyn Strategy>) -> Result<()> {
        let name = strategy.name().to_owned();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateStrategy(name));
        }
        self.by_name.insert(name, self.strategies.len());
        self.strategies.push(strategy);
        Ok(())
    }

    /// Get a strategy by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStrategy`] if no such strategy is registered.
    pub fn get(&self, name: &str) -> Result<&dyn Strategy> {
        self.by_name
            .get(name)
            .map(|&index| self.strategies[index].as_ref())
            .ok_or_else(|| Error::UnknownStrategy(name.to_owned()))
    }

    /// Whether a strategy named `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Names of registered strategies in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

/// Split a comma-separated parameter into its non-empty, trimmed items.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{split_list, Strategy, StrategyRegistry};
    use crate::{Context, Error};

    struct Named(&'static str);

    impl Strategy for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn is_enabled(&self, _parameters: &HashMap<String, String>, _context: &Context) -> bool {
            true
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = StrategyRegistry::new();
        registry.register(Named("a")).unwrap();

        assert!(matches!(
            registry.register(Named("a")),
            Err(Error::DuplicateStrategy(name)) if name == "a"
        ));
    }

    #[test]
    fn unknown_strategy_lookup_fails() {
        let registry = StrategyRegistry::new();
        assert!(!registry.has("a"));
        assert!(matches!(
            registry.get("a"),
            Err(Error::UnknownStrategy(name)) if name == "a"
        ));
    }

    #[test]
    fn names_keep_registration_order() {
        let mut registry = StrategyRegistry::new();
        registry.register(Named("c")).unwrap();
        registry.register(Named("a")).unwrap();
        registry.register(Named("b")).unwrap();

        assert_eq!(registry.names(), vec!["c", "a", "b"]);
        assert_eq!(registry.get("a").unwrap().name(), "a");
    }

    #[test]
    fn standard_registry_contains_all_strategies() {
        let registry = StrategyRegistry::with_standard_strategies();
        assert_eq!(
            registry.names(),
            vec![
                "default",
                "userWithId",
                "remoteAddress",
                "applicationHostname",
                "gradualRolloutRandom",
                "gradualRolloutUserId",
                "gradualRolloutSessionId",
            ]
        );
    }

    #[test]
    fn split_list_trims_and_drops_empty_items() {
        let items: Vec<&str> = split_list(" a , b,,c ,").collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }
}
