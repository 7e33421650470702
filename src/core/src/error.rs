//! Unified error types for the authorization cache
//!
//! Every fallible operation in the workspace returns [`SecurityError`]. The
//! store and transport boundaries map their own failures into the
//! `Storage` / `Transport` variants so the activity engine can classify them
//! as faults.

use crate::types::{ActivityId, EntityId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SecurityError>;

/// Error taxonomy of the authorization cache
#[derive(Debug, Error)]
pub enum SecurityError {
    /// A sentinel id or an otherwise malformed argument was supplied
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The entity is unknown to the store and to the missing-entity resolver
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// An `assert_*` check failed
    #[error("Access denied on entity {entity_id}: {}", .permissions.join(", "))]
    AccessDenied {
        entity_id: EntityId,
        /// Names of the permissions that were not granted, lowest bit first
        permissions: Vec<String>,
    },

    /// An activity passed validation but could not be applied
    #[error("Activity {activity_id} faulted: {reason}")]
    Faulted { activity_id: ActivityId, reason: String },

    /// The submission was cancelled before execution started
    #[error("Activity {0} was cancelled")]
    Cancelled(ActivityId),

    /// Persistent store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Message transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire codec failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SecurityError {
    /// Whether the error was raised before anything was mutated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SecurityError::InvalidArgument(_) | SecurityError::EntityNotFound(_)
        )
    }
}
