//! Error types for provisioning and workflow operations.

use thiserror::Error;

/// Errors that can occur while provisioning or verifying RBD resources.
///
/// Every variant carries a human readable reason naming the pool, image,
/// group or snapshot involved. The reason is logged at the point of failure
/// before the error is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// A required input or pre-existing resource is missing.
    #[error("Precondition missing: {0}")]
    PreconditionMissing(String),

    /// An operation succeeded where the image role requires it to fail.
    #[error("Operation succeeded unexpectedly: {0}")]
    UnexpectedSuccess(String),

    /// An operation failed, or could not be confirmed, where it should succeed.
    #[error("Operation failed unexpectedly: {0}")]
    UnexpectedFailure(String),

    /// An external collaborator (pool creation, mirror setup) failed.
    #[error("Collaborator failed: {0}")]
    CollaboratorError(String),

    /// A command whose output was required reported an error.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Collaborator output could not be parsed.
    #[error("Failed to parse output: {0}")]
    ParseFailed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OperationError {
    /// True for the role-assertion class of failures.
    pub fn is_role_violation(&self) -> bool {
        matches!(
            self,
            OperationError::UnexpectedSuccess(_) | OperationError::UnexpectedFailure(_)
        )
    }
}

/// Result type alias for provisioning and workflow operations.
pub type Result<T> = std::result::Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_reason() {
        let err = OperationError::PreconditionMissing("pool rbd does not exist".into());
        assert_eq!(err.to_string(), "Precondition missing: pool rbd does not exist");
    }

    #[test]
    fn test_role_violation_classification() {
        assert!(OperationError::UnexpectedSuccess("x".into()).is_role_violation());
        assert!(OperationError::UnexpectedFailure("x".into()).is_role_violation());
        assert!(!OperationError::CollaboratorError("x".into()).is_role_violation());
    }
}
