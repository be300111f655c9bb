//! Request proxy contract.
//!
//! The engine never talks to an HTTP framework directly. Hosts adapt
//! their request type to [`RequestView`] and the engine reads everything
//! it needs through that one trait. The view is read-only; the engine
//! never mutates a request.

/// Read-only view over an in-flight request.
///
/// Implementations must be cheap to call repeatedly; the engine may read
/// the same field several times during one evaluation.
///
/// Header lookup is case-insensitive: `header("x-api-key")` and
/// `header("X-Api-Key")` must return the same value.
pub trait RequestView: Send + Sync {
    /// HTTP method (GET, POST, ...).
    fn method(&self) -> &str;

    /// Request path without the query string.
    fn path(&self) -> &str;

    /// Full request URI including the query string.
    fn uri(&self) -> &str;

    /// Header value by case-insensitive name.
    fn header(&self, name: &str) -> Option<&str>;

    /// Query parameter value by name.
    fn query_param(&self, name: &str) -> Option<&str>;

    /// Claim value from the request's claims bag (e.g. a decoded token).
    fn claim(&self, name: &str) -> Option<&str>;
}
