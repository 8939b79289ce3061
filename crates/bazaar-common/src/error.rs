//! Bazaar Error - Unified Error Types
//!
//! Error handling for every Bazaar operation. Errors are grouped by the
//! component that raises them (registry, validator, index manager, query
//! evaluator, aggregation executor, storage) and can be classified as user
//! errors or constraint errors.
//!
//! Key Features:
//! - Structured validation failures carrying every violation found
//! - Typed index, query and pipeline errors
//! - User vs system error classification
//! - Seamless integration with std::io::Error
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::violation::Violation;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Unified error type for all Bazaar operations.
#[derive(Error, Debug)]
pub enum BazaarError {
    // Registry / collection errors
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("maximum number of collections reached ({0})")]
    TooManyCollections(usize),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Validation errors
    #[error("validation failed: {}", join_violations(.0))]
    ValidationFailed(Vec<Violation>),

    // Index errors
    #[error("duplicate index: {0}")]
    DuplicateIndex(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("invalid index definition: {0}")]
    InvalidIndex(String),

    #[error("unique constraint violation on index '{index}'")]
    UniqueViolation { index: String },

    #[error("no geo2d index on field: {0}")]
    NoGeoIndex(String),

    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Aggregation errors
    #[error("average over empty group for field: {0}")]
    EmptyGroupAverage(String),

    #[error("stage {stage} type mismatch: {message}")]
    StageTypeMismatch { stage: String, message: String },

    // Write errors
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document with ID {0} already exists")]
    DuplicateId(String),

    #[error("document exceeds maximum size ({size} > {limit} bytes)")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias for Bazaar operations.
pub type Result<T> = std::result::Result<T, BazaarError>;

// =============================================================================
// Error Classification
// =============================================================================

impl BazaarError {
    /// Returns true if this is a user error (vs system error).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BazaarError::UnknownCollection(_)
                | BazaarError::CollectionExists(_)
                | BazaarError::InvalidSchema(_)
                | BazaarError::ValidationFailed(_)
                | BazaarError::DuplicateIndex(_)
                | BazaarError::IndexNotFound(_)
                | BazaarError::InvalidIndex(_)
                | BazaarError::UniqueViolation { .. }
                | BazaarError::NoGeoIndex(_)
                | BazaarError::InvalidQuery(_)
                | BazaarError::EmptyGroupAverage(_)
                | BazaarError::StageTypeMismatch { .. }
                | BazaarError::InvariantViolation(_)
                | BazaarError::DocumentNotFound(_)
                | BazaarError::DuplicateId(_)
                | BazaarError::DocumentTooLarge { .. }
                | BazaarError::InvalidPatch(_)
        )
    }

    /// Returns true if the write was refused by a data constraint.
    pub fn is_constraint_error(&self) -> bool {
        matches!(
            self,
            BazaarError::ValidationFailed(_)
                | BazaarError::UniqueViolation { .. }
                | BazaarError::InvariantViolation(_)
                | BazaarError::DuplicateId(_)
        )
    }

    /// Violations carried by a validation failure, if any.
    pub fn violations(&self) -> &[Violation] {
        match self {
            BazaarError::ValidationFailed(violations) => violations,
            _ => &[],
        }
    }

    /// Build a `StageTypeMismatch` for the named pipeline stage.
    pub fn stage_mismatch(stage: &str, message: impl Into<String>) -> Self {
        BazaarError::StageTypeMismatch {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
