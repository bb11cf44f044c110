//! The strategies every Unleash client implements.
use std::collections::HashMap;

use rand::{thread_rng, Rng};

use super::{split_list, Strategy};
use crate::{
    context::{HOSTNAME, REMOTE_ADDRESS, SESSION_ID, USER_ID},
    sharder::{normalized_value, Murmur3Sharder, Sharder},
    Context,
};

/// `default`: always on.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

impl Strategy for DefaultStrategy {
    fn name(&self) -> &str {
        "default"
    }

    fn is_enabled(&self, _parameters: &HashMap<String, String>, _context: &Context) -> bool {
        true
    }
}

/// `userWithId`: on for the users listed in the comma-separated `userIds` parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserWithIdStrategy;

impl Strategy for UserWithIdStrategy {
    fn name(&self) -> &str {
        "userWithId"
    }

    fn is_enabled(&self, parameters: &HashMap<String, String>, context: &Context) -> bool {
        list_contains(parameters.get("userIds"), context.get(USER_ID))
    }
}

/// `remoteAddress`: on for the addresses listed in the comma-separated `IPs` parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddressStrategy;

impl Strategy for RemoteAddressStrategy {
    fn name(&self) -> &str {
        "remoteAddress"
    }

    fn is_enabled(&self, parameters: &HashMap<String, String>, context: &Context) -> bool {
        list_contains(parameters.get("IPs"), context.get(REMOTE_ADDRESS))
    }
}

/// `applicationHostname`: on for the hosts listed in the comma-separated `hostNames` parameter.
///
/// The hostname is taken from the `HOSTNAME` context key, falling back to the hostname of the
/// local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplicationHostnameStrategy;

impl Strategy for ApplicationHostnameStrategy {
    fn name(&self) -> &str {
        "applicationHostname"
    }

    fn is_enabled(&self, parameters: &HashMap<String, String>, context: &Context) -> bool {
        let Some(host_names) = parameters.get("hostNames") else {
            return false;
        };
        match context.get(HOSTNAME) {
            Some(hostname) => split_list(host_names).any(|h| h == hostname),
            None => {
                let hostname = gethostname::gethostname();
                let hostname = hostname.to_string_lossy();
                split_list(host_names).any(|h| h == hostname)
            }
        }
    }
}

/// `gradualRolloutRandom`: on for a random `percentage` of calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradualRolloutRandomStrategy;

impl Strategy for GradualRolloutRandomStrategy {
    fn name(&self) -> &str {
        "gradualRolloutRandom"
    }

    fn is_enabled(&self, parameters: &HashMap<String, String>, _context: &Context) -> bool {
        let percentage = percentage(parameters);
        let random: u32 = thread_rng().gen_range(1..=100);
        percentage >= random
    }
}

/// Deterministic percentage rollout keyed by one context value.
///
/// The context value and the `groupId` parameter are hashed into `1..=100`; the strategy is on
/// when that value does not exceed `percentage`. The same `(value, groupId, percentage)` always
/// gives the same answer, in this process and in any other Unleash client.
#[derive(Debug, Clone)]
pub struct GradualRolloutStrategy<S = Murmur3Sharder> {
    name: &'static str,
    context_key: &'static str,
    sharder: S,
}

impl GradualRolloutStrategy {
    /// Rollout by `userId`, named `gradualRolloutUserId`.
    pub fn by_user_id() -> GradualRolloutStrategy {
        GradualRolloutStrategy::with_sharder("gradualRolloutUserId", USER_ID, Murmur3Sharder)
    }

    /// Rollout by `sessionId`, named `gradualRolloutSessionId`.
    pub fn by_session_id() -> GradualRolloutStrategy {
        GradualRolloutStrategy::with_sharder("gradualRolloutSessionId", SESSION_ID, Murmur3Sharder)
    }
}

impl<S: Sharder> GradualRolloutStrategy<S> {
    pub(crate) fn with_sharder(
        name: &'static str,
        context_key: &'static str,
        sharder: S,
    ) -> GradualRolloutStrategy<S> {
        GradualRolloutStrategy {
            name,
            context_key,
            sharder,
        }
    }
}

impl<S: Sharder + Send + Sync> Strategy for GradualRolloutStrategy<S> {
    fn name(&self) -> &str {
        self.name
    }

    fn is_enabled(&self, parameters: &HashMap<String, String>, context: &Context) -> bool {
        let Some(target) = context.get_non_empty(self.context_key) else {
            return false;
        };
        let percentage = percentage(parameters);
        let group_id = parameters.get("groupId").map(String::as_str).unwrap_or("");

        percentage > 0 && normalized_value(&self.sharder, target, group_id) <= percentage
    }
}

/// Parse the `percentage` parameter. Missing or malformed values count as 0.
fn percentage(parameters: &HashMap<String, String>) -> u32 {
    parameters
        .get("percentage")
        .and_then(|p| p.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p > 0.0)
        .map(|p| p.min(100.0) as u32)
        .unwrap_or(0)
}

fn list_contains(list: Option<&String>, value: Option<&str>) -> bool {
    match (list, value) {
        (Some(list), Some(value)) => split_list(list).any(|item| item == value),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sharder::DeterministicSharder;

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_is_always_on() {
        assert!(DefaultStrategy.is_enabled(&HashMap::new(), &Context::new()));
    }

    #[test]
    fn user_with_id_matches_listed_users() {
        let parameters = params(&[("userIds", " 1, 42 ,,7")]);

        assert!(UserWithIdStrategy.is_enabled(&parameters, &Context::new().with("userId", "42")));
        assert!(UserWithIdStrategy.is_enabled(&parameters, &Context::new().with("userId", "7")));
        assert!(!UserWithIdStrategy.is_enabled(&parameters, &Context::new().with("userId", "4")));
        assert!(!UserWithIdStrategy.is_enabled(&parameters, &Context::new()));
    }

    #[test]
    fn user_with_id_without_list_is_off() {
        let context = Context::new().with("userId", "42");
        assert!(!UserWithIdStrategy.is_enabled(&HashMap::new(), &context));
        assert!(!UserWithIdStrategy.is_enabled(&params(&[("userIds", "")]), &context));
    }

    #[test]
    fn remote_address_matches_listed_ips() {
        let parameters = params(&[("IPs", "10.0.0.1, 10.0.0.2")]);

        assert!(RemoteAddressStrategy
            .is_enabled(&parameters, &Context::new().with("remoteAddress", "10.0.0.2")));
        assert!(!RemoteAddressStrategy
            .is_enabled(&parameters, &Context::new().with("remoteAddress", "10.0.0.3")));
        assert!(!RemoteAddressStrategy.is_enabled(&parameters, &Context::new()));
        assert!(!RemoteAddressStrategy.is_enabled(
            &HashMap::new(),
            &Context::new().with("remoteAddress", "10.0.0.1")
        ));
    }

    #[test]
    fn application_hostname_uses_context_hostname() {
        let parameters = params(&[("hostNames", "web-1, web-2")]);

        assert!(ApplicationHostnameStrategy
            .is_enabled(&parameters, &Context::new().with("HOSTNAME", "web-2")));
        assert!(!ApplicationHostnameStrategy
            .is_enabled(&parameters, &Context::new().with("HOSTNAME", "web-3")));
        assert!(!ApplicationHostnameStrategy.is_enabled(&HashMap::new(), &Context::new()));
    }

    #[test]
    fn application_hostname_falls_back_to_machine_hostname() {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let parameters = params(&[("hostNames", &format!("unlikely-host, {hostname}"))]);

        assert!(ApplicationHostnameStrategy.is_enabled(&parameters, &Context::new()));
    }

    #[test]
    fn gradual_rollout_random_bounds() {
        let context = Context::new();
        for _ in 0..1000 {
            assert!(GradualRolloutRandomStrategy
                .is_enabled(&params(&[("percentage", "100")]), &context));
            assert!(!GradualRolloutRandomStrategy
                .is_enabled(&params(&[("percentage", "0")]), &context));
        }
    }

    #[test]
    fn gradual_rollout_random_converges() {
        let parameters = params(&[("percentage", "30")]);
        let context = Context::new();
        let trials = 100_000;

        let enabled = (0..trials)
            .filter(|_| GradualRolloutRandomStrategy.is_enabled(&parameters, &context))
            .count();

        let ratio = enabled as f64 / trials as f64;
        assert!((ratio - 0.30).abs() < 0.01, "ratio = {ratio}");
    }

    #[test]
    fn gradual_rollout_user_id_extremes() {
        let strategy = GradualRolloutStrategy::by_user_id();
        for user_id in ["1", "42", "alice", "bob@example.com", "7f9c2b"] {
            let context = Context::new().with("userId", user_id);
            assert!(strategy.is_enabled(
                &params(&[("percentage", "100"), ("groupId", "g")]),
                &context
            ));
            assert!(!strategy.is_enabled(
                &params(&[("percentage", "0"), ("groupId", "g")]),
                &context
            ));
        }
    }

    #[test]
    fn gradual_rollout_requires_target_value() {
        let strategy = GradualRolloutStrategy::by_user_id();
        let parameters = params(&[("percentage", "100")]);

        assert!(!strategy.is_enabled(&parameters, &Context::new()));
        assert!(!strategy.is_enabled(&parameters, &Context::new().with("userId", "")));
    }

    #[test]
    fn gradual_rollout_is_stable_across_calls() {
        // "user-3:rollout" hashes to 74.
        let strategy = GradualRolloutStrategy::by_user_id();
        let context = Context::new().with("userId", "user-3");

        for _ in 0..10 {
            assert!(strategy.is_enabled(
                &params(&[("percentage", "74"), ("groupId", "rollout")]),
                &context
            ));
            assert!(!strategy.is_enabled(
                &params(&[("percentage", "73"), ("groupId", "rollout")]),
                &context
            ));
        }
    }

    #[test]
    fn gradual_rollout_session_id_reads_session() {
        // "session-1:exp" hashes to 23.
        let strategy = GradualRolloutStrategy::by_session_id();
        let context = Context::new()
            .with("sessionId", "session-1")
            .with("userId", "unrelated");

        assert!(strategy.is_enabled(&params(&[("percentage", "23"), ("groupId", "exp")]), &context));
        assert!(
            !strategy.is_enabled(&params(&[("percentage", "22"), ("groupId", "exp")]), &context)
        );
    }

    #[test]
    fn gradual_rollout_uses_injected_sharder() {
        let sharder = DeterministicSharder(HashMap::from([("u:g".to_owned(), 9)]));
        let strategy = GradualRolloutStrategy::with_sharder("test", "userId", sharder);
        let context = Context::new().with("userId", "u");

        // Shard 9 normalizes to 10.
        assert!(strategy.is_enabled(&params(&[("percentage", "10"), ("groupId", "g")]), &context));
        assert!(!strategy.is_enabled(&params(&[("percentage", "9"), ("groupId", "g")]), &context));
    }

    #[test]
    fn malformed_percentage_counts_as_zero() {
        let strategy = GradualRolloutStrategy::by_user_id();
        let context = Context::new().with("userId", "42");

        assert!(!strategy.is_enabled(&params(&[("percentage", "lots")]), &context));
        assert!(!GradualRolloutRandomStrategy.is_enabled(&params(&[("percentage", "-5")]), &context));
    }
}
