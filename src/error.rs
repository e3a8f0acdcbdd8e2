//! Error types for hypertime model operations.
//!
//! This module provides the error hierarchy shared by the grid, clustering,
//! density-model and learning code. Spectral "no useful periodicity" and
//! acceptance rejection are ordinary control flow, not errors, and do not
//! appear here.

use thiserror::Error;

/// Main error type for hypertime model operations.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Fewer distinct observations than requested clusters, or no usable
    /// dimensions. The learner reacts by falling back to the trivial
    /// global-average model.
    #[error("Degenerate input: {points} distinct observations for {clusters} clusters")]
    DegenerateInput { points: usize, clusters: usize },

    /// A matrix width does not match what the structure descriptor implies.
    #[error("Dimension mismatch: expected {expected} columns, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A cluster's covariance could not be inverted. Recoverable only in the
    /// one-dimensional case (scalar reciprocal); otherwise fatal.
    #[error("Singular covariance for cluster {cluster} ({dim} dimensions)")]
    SingularCovariance { cluster: usize, dim: usize },

    /// Configuration validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A flat model buffer could not be decoded.
    #[error("Invalid model artifact: {0}")]
    InvalidArtifact(String),

    /// The dataset contains no positive observations.
    #[error("Empty dataset: no positive observations to train on")]
    EmptyDataset,
}

/// Result type alias for hypertime model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Create a degenerate input error.
    #[must_use]
    pub const fn degenerate_input(points: usize, clusters: usize) -> Self {
        Self::DegenerateInput { points, clusters }
    }

    /// Create a dimension mismatch error.
    #[must_use]
    pub const fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Create a singular covariance error.
    #[must_use]
    pub const fn singular_covariance(cluster: usize, dim: usize) -> Self {
        Self::SingularCovariance { cluster, dim }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid artifact error.
    #[must_use]
    pub fn invalid_artifact(msg: impl Into<String>) -> Self {
        Self::InvalidArtifact(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::degenerate_input(5, 10);
        assert!(err.to_string().contains('5'));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_error_constructors() {
        let _ = ModelError::dimension_mismatch(3, 4);
        let _ = ModelError::singular_covariance(0, 2);
        let _ = ModelError::invalid_config("longest_period must be positive");
        let _ = ModelError::invalid_artifact("truncated buffer");
    }
}
