//! Rules: request matchers paired with a limit method.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::extract::{CostFn, IdentityFn};
use crate::method::{LimitMethod, LimitScope};
use crate::outcome::LimitExceededResult;
use crate::request::RequestView;
use crate::store::CounterStore;

/// Predicate over requests.
///
/// Used both as the matching half of a [`Rule`] and standalone as a
/// whitelist entry. All configured conditions must hold for a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleMatcher {
    /// URI pattern; `*` matches one path segment, `**` the rest.
    pub uri_pattern: String,

    /// HTTP method; any method when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Required header name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,

    /// Required header value; any value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_value: Option<String>,

    /// Required claim name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,

    /// Accepted claim values; any value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_values: Option<Vec<String>>,
}

impl RuleMatcher {
    /// Match requests whose path fits `pattern`.
    pub fn uri(pattern: impl Into<String>) -> Self {
        Self {
            uri_pattern: pattern.into(),
            method: None,
            header_name: None,
            header_value: None,
            claim_name: None,
            claim_values: None,
        }
    }

    /// Also require the HTTP method (case-insensitive).
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Also require a header, optionally with an exact value.
    pub fn with_header(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.header_name = Some(name.into());
        self.header_value = value;
        self
    }

    /// Also require a claim, optionally restricted to a value set.
    pub fn with_claim(mut self, name: impl Into<String>, values: Option<Vec<String>>) -> Self {
        self.claim_name = Some(name.into());
        self.claim_values = values;
        self
    }

    /// Test the matcher against a request.
    pub fn matches(&self, request: &dyn RequestView) -> bool {
        if !pattern_matches(&self.uri_pattern, request.path()) {
            return false;
        }

        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(request.method()) {
                return false;
            }
        }

        if let Some(header_name) = &self.header_name {
            match request.header(header_name) {
                None => return false,
                Some(actual) => {
                    if let Some(expected) = &self.header_value {
                        if actual != expected {
                            return false;
                        }
                    }
                }
            }
        }

        if let Some(claim_name) = &self.claim_name {
            match request.claim(claim_name) {
                None => return false,
                Some(actual) => {
                    if let Some(accepted) = &self.claim_values {
                        if !accepted.iter().any(|v| v == actual) {
                            return false;
                        }
                    }
                }
            }
        }

        true
    }
}

/// Check if a URI pattern matches a path.
///
/// Glob-style matching:
/// - `*` matches any single path segment
/// - `**` matches any number of segments
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut pi = 0; // pattern index
    let mut pa = 0; // path index

    while pi < pattern_parts.len() && pa < path_parts.len() {
        let p = pattern_parts[pi];

        if p == "**" {
            // ** matches rest of path
            return true;
        } else if p == "*" {
            // * matches single segment
            pi += 1;
            pa += 1;
        } else if p == path_parts[pa] {
            // Exact match
            pi += 1;
            pa += 1;
        } else {
            return false;
        }
    }

    // Pattern exhausted - check if path is also exhausted
    pi == pattern_parts.len() && pa == path_parts.len()
}

/// One rate limiting rule: a matcher, a limit method and the knobs that
/// shape its counter keys.
#[derive(Clone)]
pub struct Rule {
    matcher: RuleMatcher,
    limit: LimitMethod,
    max_delay: Duration,
    identity: Option<IdentityFn>,
    cost: Option<CostFn>,
    key_fragment: String,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("matcher", &self.matcher)
            .field("limit", &self.limit)
            .field("max_delay", &self.max_delay)
            .field("has_identity", &self.identity.is_some())
            .field("has_cost", &self.cost.is_some())
            .finish()
    }
}

impl Rule {
    /// Create a rule from a matcher and a limit method.
    ///
    /// The key fragment combines the matcher with a stable hash of the
    /// full rule shape, so two rules over the same URI pattern but with
    /// different limits count in separate cells.
    pub fn new(matcher: RuleMatcher, limit: LimitMethod) -> Self {
        use std::hash::{Hash, Hasher};

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        matcher.hash(&mut hasher);
        limit.hash(&mut hasher);

        let key_fragment = format!(
            "{}:{}:{:08x}",
            matcher.method.as_deref().unwrap_or("*"),
            matcher.uri_pattern,
            hasher.finish() as u32
        );
        Self {
            matcher,
            limit,
            max_delay: Duration::ZERO,
            identity: None,
            cost: None,
            key_fragment,
        }
    }

    /// Allow an exceeded request to wait up to `max_delay` for capacity.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set a per-rule identity extractor, overriding the engine global.
    pub fn with_identity<F>(mut self, extract: F) -> Self
    where
        F: Fn(&dyn RequestView) -> Option<String> + Send + Sync + 'static,
    {
        self.identity = Some(std::sync::Arc::new(extract));
        self
    }

    /// Set a pre-built identity extractor.
    pub fn with_identity_fn(mut self, extract: IdentityFn) -> Self {
        self.identity = Some(extract);
        self
    }

    /// Set a per-rule cost extractor, overriding the engine global.
    pub fn with_cost<F>(mut self, extract: F) -> Self
    where
        F: Fn(&dyn RequestView) -> u64 + Send + Sync + 'static,
    {
        self.cost = Some(std::sync::Arc::new(extract));
        self
    }

    /// Set a pre-built cost extractor.
    pub fn with_cost_fn(mut self, extract: CostFn) -> Self {
        self.cost = Some(extract);
        self
    }

    /// The rule's matcher.
    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    /// The rule's limit method.
    pub fn limit(&self) -> &LimitMethod {
        &self.limit
    }

    /// Maximum admission delay for this rule.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Fragment identifying this rule inside counter keys.
    pub fn key_fragment(&self) -> &str {
        &self.key_fragment
    }

    /// Resolve the effective identity: the rule's extractor wins over
    /// the engine global. Resolution never mutates the rule, so applying
    /// globals is idempotent by construction.
    pub fn resolve_identity(
        &self,
        request: &dyn RequestView,
        global: Option<&IdentityFn>,
    ) -> Option<String> {
        match self.identity.as_ref().or(global) {
            Some(extract) => extract(request),
            None => None,
        }
    }

    /// Resolve the effective cost: rule extractor, then engine global,
    /// then the constant 1.
    pub fn resolve_cost(&self, request: &dyn RequestView, global: Option<&CostFn>) -> u64 {
        match self.cost.as_ref().or(global) {
            Some(extract) => extract(request),
            None => 1,
        }
    }

    /// Evaluate this rule against a request.
    ///
    /// Returns `None` when the matcher rejects the request; otherwise
    /// delegates to the limit method.
    pub async fn evaluate<S: CounterStore>(
        &self,
        store: &S,
        request: &dyn RequestView,
        namespace: &str,
        global_identity: Option<&IdentityFn>,
        global_cost: Option<&CostFn>,
    ) -> Result<Option<LimitExceededResult>> {
        if !self.matcher.matches(request) {
            return Ok(None);
        }

        let identity = self.resolve_identity(request, global_identity);
        let cost = self.resolve_cost(request, global_cost);
        let scope = LimitScope::new(namespace, &self.key_fragment, identity.as_deref());

        self.limit
            .is_exceeded(store, &scope, cost)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PathRequest {
        method: &'static str,
        path: &'static str,
        api_key: Option<&'static str>,
        role: Option<&'static str>,
    }

    impl PathRequest {
        fn get(path: &'static str) -> Self {
            Self {
                method: "GET",
                path,
                api_key: None,
                role: None,
            }
        }
    }

    impl RequestView for PathRequest {
        fn method(&self) -> &str {
            self.method
        }

        fn path(&self) -> &str {
            self.path
        }

        fn uri(&self) -> &str {
            self.path
        }

        fn header(&self, name: &str) -> Option<&str> {
            name.eq_ignore_ascii_case("x-api-key")
                .then_some(self.api_key)
                .flatten()
        }

        fn query_param(&self, _name: &str) -> Option<&str> {
            None
        }

        fn claim(&self, name: &str) -> Option<&str> {
            (name == "role").then_some(self.role).flatten()
        }
    }

    #[test]
    fn test_pattern_matches_exact() {
        assert!(pattern_matches("/api/users", "/api/users"));
        assert!(!pattern_matches("/api/users", "/api/posts"));
    }

    #[test]
    fn test_pattern_matches_single_wildcard() {
        assert!(pattern_matches("/api/*/posts", "/api/users/posts"));
        assert!(pattern_matches("/api/*/posts", "/api/admins/posts"));
        assert!(!pattern_matches("/api/*/posts", "/api/users/comments"));
    }

    #[test]
    fn test_pattern_matches_double_wildcard() {
        assert!(pattern_matches("/api/**", "/api/users"));
        assert!(pattern_matches("/api/**", "/api/users/123/posts"));
        assert!(!pattern_matches("/api/**", "/v2/api/users"));
    }

    #[test]
    fn test_matcher_method() {
        let matcher = RuleMatcher::uri("/api/**").with_method("post");

        let mut request = PathRequest::get("/api/items");
        assert!(!matcher.matches(&request));

        request.method = "POST";
        assert!(matcher.matches(&request));
    }

    #[test]
    fn test_matcher_header_value() {
        let matcher = RuleMatcher::uri("/**").with_header("X-Api-Key", Some("secret".into()));

        let mut request = PathRequest::get("/anything");
        assert!(!matcher.matches(&request));

        request.api_key = Some("wrong");
        assert!(!matcher.matches(&request));

        request.api_key = Some("secret");
        assert!(matcher.matches(&request));
    }

    #[test]
    fn test_matcher_claim_values() {
        let matcher =
            RuleMatcher::uri("/**").with_claim("role", Some(vec!["admin".into(), "ops".into()]));

        let mut request = PathRequest::get("/x");
        assert!(!matcher.matches(&request));

        request.role = Some("viewer");
        assert!(!matcher.matches(&request));

        request.role = Some("ops");
        assert!(matcher.matches(&request));
    }

    #[test]
    fn test_matcher_schema_round_trip() {
        let matcher = RuleMatcher::uri("/api/**").with_method("GET");
        let json = serde_json::to_string(&matcher).unwrap();
        assert!(json.contains("\"UriPattern\":\"/api/**\""));

        let back: RuleMatcher = serde_json::from_str(&json).unwrap();
        assert_eq!(matcher, back);
    }

    #[test]
    fn test_key_fragment() {
        let rule = Rule::new(
            RuleMatcher::uri("/api/**").with_method("GET"),
            LimitMethod::fixed_window(10, 60),
        );
        assert!(rule.key_fragment().starts_with("GET:/api/**:"));

        let rule = Rule::new(RuleMatcher::uri("/api/**"), LimitMethod::fixed_window(10, 60));
        assert!(rule.key_fragment().starts_with("*:/api/**:"));
    }

    #[test]
    fn test_same_matcher_different_limits_get_distinct_fragments() {
        let generous = Rule::new(RuleMatcher::uri("/api/**"), LimitMethod::fixed_window(100, 60));
        let strict = Rule::new(RuleMatcher::uri("/api/**"), LimitMethod::fixed_window(1, 60));
        assert_ne!(generous.key_fragment(), strict.key_fragment());

        let twin = Rule::new(RuleMatcher::uri("/api/**"), LimitMethod::fixed_window(100, 60));
        assert_eq!(generous.key_fragment(), twin.key_fragment());
    }

    #[test]
    fn test_identity_override_beats_global() {
        let rule = Rule::new(RuleMatcher::uri("/**"), LimitMethod::fixed_window(10, 60))
            .with_identity(|_| Some("rule-level".into()));
        let global: IdentityFn = std::sync::Arc::new(|_| Some("global".into()));
        let request = PathRequest::get("/x");

        // Repeated resolution keeps honoring the override.
        for _ in 0..2 {
            assert_eq!(
                rule.resolve_identity(&request, Some(&global)),
                Some("rule-level".to_string())
            );
        }
    }

    #[test]
    fn test_global_identity_fallback() {
        let rule = Rule::new(RuleMatcher::uri("/**"), LimitMethod::fixed_window(10, 60));
        let global: IdentityFn = std::sync::Arc::new(|_| Some("global".into()));
        let request = PathRequest::get("/x");

        assert_eq!(
            rule.resolve_identity(&request, Some(&global)),
            Some("global".to_string())
        );
        assert_eq!(rule.resolve_identity(&request, None), None);
    }

    #[test]
    fn test_cost_defaults_to_one() {
        let rule = Rule::new(RuleMatcher::uri("/**"), LimitMethod::fixed_window(10, 60));
        let request = PathRequest::get("/x");
        assert_eq!(rule.resolve_cost(&request, None), 1);
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_evaluate_skips_non_matching() {
        use crate::store::MemoryCounterStore;

        let store = MemoryCounterStore::new();
        let rule = Rule::new(
            RuleMatcher::uri("/api/**"),
            LimitMethod::fixed_window(1, 60),
        );

        let request = PathRequest::get("/health");
        let result = rule
            .evaluate(&store, &request, "svc", None, None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.is_empty());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_evaluate_matching_rule() {
        use crate::store::MemoryCounterStore;

        let store = MemoryCounterStore::new();
        let rule = Rule::new(
            RuleMatcher::uri("/api/**"),
            LimitMethod::fixed_window(1, 60),
        );

        let request = PathRequest::get("/api/items");
        let first = rule
            .evaluate(&store, &request, "svc", None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!first.is_exceeded());

        let second = rule
            .evaluate(&store, &request, "svc", None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_exceeded());
    }
}
