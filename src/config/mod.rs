//! Configuration snapshots and the host-agnostic settings schema.
//!
//! A [`RateLimitConfig`] is immutable once built; live reconfiguration
//! replaces whole snapshots through [`ConfigHandle`](crate::config::ConfigHandle)
//! so one request never sees a half-updated rule set.

mod loader;

pub use loader::{spawn_reload, ConfigHandle, ConfigSource};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::extract::{CostSpec, IdentitySpec};
use crate::method::LimitMethod;
use crate::request::RequestView;
use crate::rule::{Rule, RuleMatcher};

/// One immutable configuration snapshot.
///
/// Rules are evaluated in declared order; the whitelist short-circuits
/// the entire evaluation; the unique name namespaces every counter key
/// so services sharing a store cannot collide.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    rules: Vec<Rule>,
    whitelist: Vec<RuleMatcher>,
    unique_name: String,
}

impl RateLimitConfig {
    /// Create an empty config for the given service name.
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            whitelist: Vec::new(),
            unique_name: unique_name.into(),
        }
    }

    /// The snapshot an engine runs with before any configuration has
    /// loaded: no rules, nothing throttled.
    pub fn empty() -> Self {
        Self::new("unconfigured")
    }

    /// Append a rule. Order matters: rules are evaluated as declared.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append a whitelist matcher.
    pub fn with_whitelist_entry(mut self, matcher: RuleMatcher) -> Self {
        self.whitelist.push(matcher);
        self
    }

    /// The rules in declared order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The whitelist matchers.
    pub fn whitelist(&self) -> &[RuleMatcher] {
        &self.whitelist
    }

    /// The service-unique namespace.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Whether any whitelist entry matches the request.
    pub fn whitelist_matches(&self, request: &dyn RequestView) -> bool {
        self.whitelist.iter().any(|m| m.matches(request))
    }
}

/// One rule in the settings schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Matching conditions, flattened into the rule object.
    #[serde(flatten)]
    pub matcher: RuleMatcher,

    /// The limit method, tagged by `Type`.
    #[serde(rename = "LimitMethod")]
    pub limit_method: LimitMethod,

    /// Maximum admission delay; 0 disables waiting.
    #[serde(rename = "MaxDelayInSeconds", default)]
    pub max_delay_in_seconds: u64,

    /// Declarative identity extractor.
    #[serde(
        rename = "IdentityIdExtractor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub identity_id_extractor: Option<IdentitySpec>,

    /// Declarative cost extractor.
    #[serde(
        rename = "CostExtractor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cost_extractor: Option<CostSpec>,
}

/// Host-agnostic settings schema.
///
/// Stable PascalCase field names so the same document can feed
/// deployments regardless of which host framework embeds the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RateLimitSettings {
    /// Rules in evaluation order.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    /// Requests matching any of these bypass all rules.
    #[serde(default)]
    pub white_list: Vec<RuleMatcher>,

    /// Service-unique namespace for counter keys.
    pub unique_name: String,
}

impl RateLimitSettings {
    /// Validate and compile the settings into a runtime snapshot.
    pub fn into_config(self) -> Result<RateLimitConfig> {
        if self.unique_name.is_empty() {
            return Err(ConfigError::MissingRequired("UniqueName".into()).into());
        }

        let mut config = RateLimitConfig::new(self.unique_name);

        for spec in self.rules {
            if spec.matcher.uri_pattern.is_empty() {
                return Err(ConfigError::InvalidRule("UriPattern must not be empty".into()).into());
            }
            spec.limit_method.validate()?;

            let mut rule = Rule::new(spec.matcher, spec.limit_method)
                .with_max_delay(Duration::from_secs(spec.max_delay_in_seconds));
            if let Some(identity) = &spec.identity_id_extractor {
                rule = rule.with_identity_fn(identity.compile());
            }
            if let Some(cost) = &spec.cost_extractor {
                rule = rule.with_cost_fn(cost.compile());
            }
            config = config.with_rule(rule);
        }

        for matcher in self.white_list {
            if matcher.uri_pattern.is_empty() {
                return Err(ConfigError::InvalidRule("UriPattern must not be empty".into()).into());
            }
            config = config.with_whitelist_entry(matcher);
        }

        Ok(config)
    }
}
