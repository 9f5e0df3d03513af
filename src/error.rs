// Fetch error taxonomy
// Every variant means "fetch failed" to the health state machine; the kinds
// only survive in logs.

use std::time::Duration;
use thiserror::Error;

use crate::vendor::Vendor;

/// Why a vendor price could not be observed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The page loaded but the price element was absent or empty
    /// (layout change, item removed from the catalog).
    #[error("{vendor}: price not found on page ({reason})")]
    Extraction { vendor: Vendor, reason: String },

    /// Transport failure: DNS, connection refused, TLS, non-success status.
    #[error("network error: {0}")]
    Network(String),

    /// No answer within the per-fetch deadline.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Operator override aimed at a vendor link the catalog does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No {vendor} link for catalog entry {entry_id}")]
pub struct LinkNotFound {
    pub entry_id: i64,
    pub vendor: Vendor,
}

impl FetchError {
    pub fn extraction(vendor: Vendor, reason: impl Into<String>) -> Self {
        FetchError::Extraction {
            vendor,
            reason: reason.into(),
        }
    }

    /// Short label used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Extraction { .. } => "extraction",
            FetchError::Network(_) => "network",
            FetchError::Timeout(_) => "timeout",
        }
    }
}
