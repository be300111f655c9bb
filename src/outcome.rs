//! Evaluation outcomes.
//!
//! One [`LimitExceededResult`] is produced per matching rule, plus at
//! most one synthetic entry when a downstream throttle signal is folded
//! back into the list. Consumers (the host's response fabric) read the
//! list to shape the response; the engine itself never shapes responses.

use std::fmt;
use std::time::Duration;

/// Identity of a single counter cell in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterId {
    key: String,
    namespace: String,
    window_start: Option<u64>,
}

impl CounterId {
    /// Create a counter id without a window component.
    pub fn new(key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            namespace: namespace.into(),
            window_start: None,
        }
    }

    /// Stamp the active window start (Unix milliseconds).
    pub fn with_window(mut self, window_start: u64) -> Self {
        self.window_start = Some(window_start);
        self
    }

    /// The full store key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The service-unique namespace embedded in the key.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Active window start, if the counter is window-based.
    pub fn window_start(&self) -> Option<u64> {
        self.window_start
    }
}

/// When a throttled caller may retry.
///
/// Either a relative delay computed by a limit method, or an absolute
/// time string propagated verbatim from a downstream `Retry-After`
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAfter {
    /// Retry after this much time has passed.
    Delay(Duration),
    /// Retry at this absolute time (HTTP-date, passed through untouched).
    At(String),
}

impl RetryAfter {
    /// Parse a `Retry-After` header value.
    ///
    /// Numeric values are seconds; anything else is kept verbatim as an
    /// absolute time.
    pub fn from_header_value(value: &str) -> Self {
        match value.trim().parse::<u64>() {
            Ok(secs) => Self::Delay(Duration::from_secs(secs)),
            Err(_) => Self::At(value.to_string()),
        }
    }

    /// Relative delay in whole seconds, if this is a delay.
    pub fn as_secs(&self) -> Option<u64> {
        match self {
            Self::Delay(d) => Some(d.as_secs()),
            Self::At(_) => None,
        }
    }

    /// Relative delay, if this is a delay.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Delay(d) => Some(*d),
            Self::At(_) => None,
        }
    }

    /// Value suitable for a `Retry-After` response header.
    pub fn header_value(&self) -> String {
        match self {
            Self::Delay(d) => d.as_secs().to_string(),
            Self::At(date) => date.clone(),
        }
    }
}

impl fmt::Display for RetryAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delay(d) => write!(f, "{}s", d.as_secs()),
            Self::At(date) => f.write_str(date),
        }
    }
}

/// How the request ultimately finished.
///
/// Fed to cleanup routines at request completion; the circuit breaker is
/// the one limit method that distinguishes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The request was processed normally.
    Success,
    /// The request failed.
    Failure,
}

impl RequestOutcome {
    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The result of evaluating one rule (or one propagated egress signal).
#[derive(Debug, Clone)]
pub struct LimitExceededResult {
    exceeded: bool,
    counter_id: Option<CounterId>,
    retry_after: Option<RetryAfter>,
    rule: Option<String>,
}

impl LimitExceededResult {
    /// A rule's limit was exceeded.
    pub fn exceeded(counter_id: CounterId, retry_after: RetryAfter, rule: impl Into<String>) -> Self {
        Self {
            exceeded: true,
            counter_id: Some(counter_id),
            retry_after: Some(retry_after),
            rule: Some(rule.into()),
        }
    }

    /// A rule matched and the request was admitted.
    pub fn admitted(counter_id: CounterId, rule: impl Into<String>) -> Self {
        Self {
            exceeded: false,
            counter_id: Some(counter_id),
            retry_after: None,
            rule: Some(rule.into()),
        }
    }

    /// Synthetic entry for a downstream throttle signal.
    ///
    /// Carries no rule and no counter; the retry-after is taken verbatim
    /// from the propagated signal.
    pub fn from_egress(retry_after: RetryAfter) -> Self {
        Self {
            exceeded: true,
            counter_id: None,
            retry_after: Some(retry_after),
            rule: None,
        }
    }

    /// Whether the limit was exceeded.
    pub fn is_exceeded(&self) -> bool {
        self.exceeded
    }

    /// The counter cell this result was computed from, if any.
    pub fn counter_id(&self) -> Option<&CounterId> {
        self.counter_id.as_ref()
    }

    /// When the caller may retry (set on exceeded results).
    pub fn retry_after(&self) -> Option<&RetryAfter> {
        self.retry_after.as_ref()
    }

    /// The rule that produced this result; `None` for egress entries.
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }
}
