//! Error types for servecap estimations.

use thiserror::Error;

/// Result type for servecap operations.
pub type Result<T> = std::result::Result<T, EstimateError>;

/// Error type for servecap operations.
///
/// Only malformed inputs are errors. Degenerate numeric outcomes (zero peak
/// throughput, a configuration that does not fit in memory) are reported as
/// data in [`crate::PerformanceReport`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimateError {
    #[error("Missing required hyperparameter: {field}")]
    Configuration { field: &'static str },

    #[error("Invalid hyperparameter {field}: {reason}")]
    InvalidHyperparameter { field: &'static str, reason: String },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("Unknown GPU model: {0}")]
    UnknownGpu(String),

    #[error("Unknown dtype: {0}")]
    UnknownDtype(String),

    #[error("Unknown accumulate type: {0} (expected fp16, fp32 or int32)")]
    UnknownAccumulate(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),
}

impl EstimateError {
    /// Stable machine-readable code used in JSON error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            EstimateError::Configuration { .. } => "MISSING_FIELD",
            EstimateError::InvalidHyperparameter { .. } => "INVALID_CONFIG",
            EstimateError::InvalidTopology(_) => "INVALID_TOPOLOGY",
            EstimateError::InvalidOption { .. } => "INVALID_OPTION",
            EstimateError::UnknownGpu(_) => "UNKNOWN_GPU",
            EstimateError::UnknownDtype(_) | EstimateError::UnknownAccumulate(_) => "INVALID_PRECISION",
            EstimateError::UnknownPreset(_) => "UNKNOWN_PRESET",
        }
    }
}
