//! Error types for the rate limiting engine.
//!
//! The crate-internal taxonomy lives in [`RateLimitError`] and its
//! sub-enums. [`EgressThrottled`] and [`CompositeError`] are standalone
//! `std::error::Error` types that belong to the next-action failure
//! surface: the engine inspects them, it never raises them itself.

use std::time::Duration;

use thiserror::Error;

use crate::outcome::RetryAfter;

/// Result type for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Main error type for rate limiting operations.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Counter store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Identity or cost extraction failed.
    #[error("extraction failed: {0}")]
    Extract(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RateLimitError {
    /// Whether this error wraps corrupt store state.
    ///
    /// Corrupt state is handled like a transient failure but logged at a
    /// higher level by the engine.
    pub fn is_store_corruption(&self) -> bool {
        matches!(self, Self::Store(StoreError::Corrupt(_)))
    }
}

/// Counter-store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unavailable or the operation failed.
    #[error("{message}")]
    Unavailable {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The backend did not answer in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed state read back from the backend.
    #[error("corrupt counter state: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Create a new unavailable error.
    pub fn unavailable(message: impl Into<String>, retryable: bool) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { retryable, .. } => *retryable,
            Self::Timeout(_) => true,
            Self::Corrupt(_) => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A rule is malformed.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A limit method carries impossible parameters.
    #[error("invalid limit method: {0}")]
    InvalidLimit(String),

    /// Missing required configuration.
    #[error("missing required configuration: {0}")]
    MissingRequired(String),

    /// Loading a configuration snapshot failed.
    #[error("configuration load failed: {0}")]
    Load(String),
}

/// A downstream service signalled that it is throttling.
///
/// Next actions surface this (directly, wrapped, or inside a
/// [`CompositeError`]) to have the engine fold the downstream throttle
/// into the ingress result list instead of failing the request.
#[derive(Debug, Clone)]
pub struct EgressThrottled {
    retry_after: RetryAfter,
}

impl EgressThrottled {
    /// Create a new throttle signal.
    pub fn new(retry_after: RetryAfter) -> Self {
        Self { retry_after }
    }

    /// Build the signal from a `Retry-After` header value.
    ///
    /// Numeric values are read as seconds; anything else is carried
    /// verbatim as an absolute time string.
    pub fn from_header_value(value: &str) -> Self {
        Self::new(RetryAfter::from_header_value(value))
    }

    /// The propagated retry-after value.
    pub fn retry_after(&self) -> &RetryAfter {
        &self.retry_after
    }

    /// Search an error and everything it wraps for a throttle signal.
    ///
    /// Walks the `source()` chain and recurses into [`CompositeError`]
    /// members. This is the only place the crate understands composite
    /// failures.
    pub fn find_in<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a EgressThrottled> {
        if let Some(throttled) = err.downcast_ref::<EgressThrottled>() {
            return Some(throttled);
        }
        if let Some(composite) = err.downcast_ref::<CompositeError>() {
            for inner in composite.errors() {
                let inner: &(dyn std::error::Error + 'static) = &**inner;
                if let Some(throttled) = Self::find_in(inner) {
                    return Some(throttled);
                }
            }
        }
        err.source().and_then(Self::find_in)
    }
}

impl std::fmt::Display for EgressThrottled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "downstream throttled, retry after {}", self.retry_after)
    }
}

impl std::error::Error for EgressThrottled {}

/// An aggregate of independent failures from a next action.
#[derive(Debug, Default)]
pub struct CompositeError {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl CompositeError {
    /// Create a composite from the given failures.
    pub fn new(errors: Vec<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self { errors }
    }

    /// Add a failure.
    pub fn push(&mut self, err: Box<dyn std::error::Error + Send + Sync>) {
        self.errors.push(err);
    }

    /// The wrapped failures.
    pub fn errors(&self) -> &[Box<dyn std::error::Error + Send + Sync>] {
        &self.errors
    }
}

impl std::fmt::Display for CompositeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s) occurred", self.errors.len())
    }
}

impl std::error::Error for CompositeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_retryable() {
        let err = StoreError::unavailable("connection refused", true);
        assert!(err.is_retryable());

        let err = StoreError::unavailable("bad request", false);
        assert!(!err.is_retryable());

        let err = StoreError::Timeout(Duration::from_secs(1));
        assert!(err.is_retryable());

        let err = StoreError::Corrupt("unparseable cell".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_corruption_detection() {
        let err = RateLimitError::from(StoreError::Corrupt("bad".into()));
        assert!(err.is_store_corruption());

        let err = RateLimitError::from(StoreError::unavailable("down", true));
        assert!(!err.is_store_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = RateLimitError::Extract("missing header".into());
        assert_eq!(err.to_string(), "extraction failed: missing header");

        let err = EgressThrottled::from_header_value("5");
        assert!(err.to_string().contains("retry after"));
    }

    #[test]
    fn test_find_throttle_direct() {
        let err: Box<dyn std::error::Error + Send + Sync> =
            Box::new(EgressThrottled::from_header_value("7"));
        let found = EgressThrottled::find_in(&*err).expect("should find direct signal");
        assert_eq!(found.retry_after().as_secs(), Some(7));
    }

    #[test]
    fn test_find_throttle_in_composite() {
        let composite = CompositeError::new(vec![
            Box::new(std::io::Error::new(std::io::ErrorKind::Other, "unrelated")),
            Box::new(EgressThrottled::from_header_value("12")),
        ]);
        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(composite);
        let found = EgressThrottled::find_in(&*err).expect("should find nested signal");
        assert_eq!(found.retry_after().as_secs(), Some(12));
    }

    #[test]
    fn test_find_throttle_absent() {
        let err: Box<dyn std::error::Error + Send + Sync> =
            Box::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(EgressThrottled::find_in(&*err).is_none());
    }

    #[test]
    fn test_find_throttle_through_source_chain() {
        #[derive(Debug)]
        struct Wrapper(EgressThrottled);

        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapper")
            }
        }

        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let err: Box<dyn std::error::Error + Send + Sync> =
            Box::new(Wrapper(EgressThrottled::from_header_value("3")));
        let found = EgressThrottled::find_in(&*err).expect("should follow source chain");
        assert_eq!(found.retry_after().as_secs(), Some(3));
    }
}
