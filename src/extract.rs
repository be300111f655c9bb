//! Identity and cost extraction.
//!
//! Extractors decide which counter cell a request lands in (identity)
//! and how much it weighs (cost). At runtime both are cheap-clone
//! closures; configuration-driven rules describe them declaratively as
//! serde specs that compile into the same closures.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::request::RequestView;

/// Extracts a caller identity from a request.
///
/// `None` means the rule counts without identity: all matching requests
/// share one cell per window.
pub type IdentityFn = Arc<dyn Fn(&dyn RequestView) -> Option<String> + Send + Sync>;

/// Extracts a request's cost. Default cost is 1.
pub type CostFn = Arc<dyn Fn(&dyn RequestView) -> u64 + Send + Sync>;

/// Declarative identity extractor for configuration-driven rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "From")]
pub enum IdentitySpec {
    /// Take the identity from a header.
    #[serde(rename_all = "PascalCase")]
    Header {
        /// Header name (case-insensitive).
        name: String,
    },
    /// Take the identity from a claim.
    #[serde(rename_all = "PascalCase")]
    Claim {
        /// Claim name.
        name: String,
    },
    /// Take the identity from a query parameter.
    #[serde(rename_all = "PascalCase")]
    QueryParam {
        /// Parameter name.
        name: String,
    },
}

impl IdentitySpec {
    /// Compile the spec into a runtime extractor.
    pub fn compile(&self) -> IdentityFn {
        match self {
            Self::Header { name } => {
                let name = name.clone();
                Arc::new(move |request| request.header(&name).map(str::to_string))
            }
            Self::Claim { name } => {
                let name = name.clone();
                Arc::new(move |request| request.claim(&name).map(str::to_string))
            }
            Self::QueryParam { name } => {
                let name = name.clone();
                Arc::new(move |request| request.query_param(&name).map(str::to_string))
            }
        }
    }
}

fn default_cost() -> u64 {
    1
}

/// Declarative cost extractor for configuration-driven rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "From")]
pub enum CostSpec {
    /// Every matching request costs the same.
    #[serde(rename_all = "PascalCase")]
    Constant {
        /// The cost.
        value: u64,
    },
    /// Parse the cost from a query parameter.
    #[serde(rename_all = "PascalCase")]
    QueryParam {
        /// Parameter name.
        name: String,
        /// Cost when the parameter is missing or not a number.
        #[serde(default = "default_cost")]
        default: u64,
    },
    /// Parse the cost from a header.
    #[serde(rename_all = "PascalCase")]
    Header {
        /// Header name (case-insensitive).
        name: String,
        /// Cost when the header is missing or not a number.
        #[serde(default = "default_cost")]
        default: u64,
    },
}

impl CostSpec {
    /// Compile the spec into a runtime extractor.
    pub fn compile(&self) -> CostFn {
        match self {
            Self::Constant { value } => {
                let value = *value;
                Arc::new(move |_| value)
            }
            Self::QueryParam { name, default } => {
                let name = name.clone();
                let default = *default;
                Arc::new(move |request| {
                    request
                        .query_param(&name)
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(default)
                })
            }
            Self::Header { name, default } => {
                let name = name.clone();
                let default = *default;
                Arc::new(move |request| {
                    request
                        .header(&name)
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(default)
                })
            }
        }
    }
}
