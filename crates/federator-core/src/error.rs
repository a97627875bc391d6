//! Error types for Federator

use thiserror::Error;

/// Result type alias using Federator's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Federator error types
///
/// Validation errors are raised before any network call and surface as client
/// errors. Everything else is an upstream or internal condition; most of those
/// are recorded on the in-flight message instead of being returned.
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (E001-E099)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("{0}")]
    MixedOrMultiInfer(String),

    #[error("{0}")]
    EndpointPinning(String),

    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("Invalid parameters for operation '{0}': {1}")]
    InvalidParameters(String, String),

    // Rule library errors (E100-E199)
    #[error("Rule library error: {0}")]
    RuleLibrary(String),

    // Upstream errors (E200-E299)
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Callback broker error: {0}")]
    Broker(String),

    #[error("Blob store error: {0}")]
    BlobStore(String),

    // Store errors (E300-E399)
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "E001",
            Self::MixedOrMultiInfer(_) => "E002",
            Self::EndpointPinning(_) => "E003",
            Self::UnknownOperation(_) => "E004",
            Self::InvalidParameters(..) => "E005",
            Self::RuleLibrary(_) => "E100",
            Self::NetworkError(_) => "E200",
            Self::Broker(_) => "E202",
            Self::BlobStore(_) => "E203",
            Self::Cache(_) => "E300",
            Self::DatabaseError(_) => "E301",
            Self::ConfigError(_) => "E600",
            Self::Serialization(_) | Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Whether the caller sent something we refuse to run
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidQuery(_)
                | Self::MixedOrMultiInfer(_)
                | Self::EndpointPinning(_)
                | Self::UnknownOperation(_)
                | Self::InvalidParameters(..)
        )
    }

    /// HTTP status a route layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidQuery(_) | Self::MixedOrMultiInfer(_) | Self::EndpointPinning(_) => 400,
            Self::UnknownOperation(_) | Self::InvalidParameters(..) => 422,
            Self::NetworkError(e) => upstream_status_for(e),
            _ => 500,
        }
    }
}

/// Map a transport failure onto the status recorded for the failed call
pub fn upstream_status_for(err: &reqwest::Error) -> u16 {
    if err.is_timeout() {
        504
    } else if err.is_connect() {
        503
    } else {
        500
    }
}
