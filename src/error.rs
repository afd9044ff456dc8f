//! Structured error taxonomy shared across the core.
//!
//! Every externally-reachable operation returns `Result<T, CoreError>`.
//! Collaborator failures (persistence, clock, probe, event sink, or a
//! module-declared operation) are wrapped in `CoreError::Internal` at the
//! boundary where they cross into core control flow.

use thiserror::Error;

/// The taxonomy from spec.md §7, realized as error variants.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {message}")]
    ValidationError { message: String, context: String },

    #[error("config validation failed at {path}: {message}")]
    ConfigValidationError { path: String, message: String },

    #[error("config not found: tenant={tenant_id} module={module_id} key={key}")]
    ConfigNotFoundError {
        tenant_id: String,
        module_id: String,
        key: String,
    },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("dependency error: {message} (missing: {missing:?})")]
    DependencyError { message: String, missing: Vec<String> },

    #[error("migration failed: {migration_id}: {message}")]
    MigrationError { migration_id: String, message: String },

    #[error("rollback failed: {message}")]
    RollbackError { message: String },

    #[error("operation timed out after {elapsed_ms}ms (deadline {deadline_ms}ms)")]
    TimeoutError { elapsed_ms: u64, deadline_ms: u64 },

    #[error("conflict: {message} (owner: {owner:?})")]
    ConflictError {
        message: String,
        owner: Option<String>,
    },

    #[error("invalid state: {message}")]
    StateError { message: String },

    #[error(
        "rollback required for ({module_id}, {tenant_id}); operator intervention needed: {reason}"
    )]
    RollbackRequired {
        module_id: String,
        tenant_id: String,
        reason: String,
    },

    #[error("collaborator failure")]
    Internal(#[source] anyhow::Error),
}

/// Coarse kind, used for structured outcomes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    ValidationError,
    ConfigValidationError,
    ConfigNotFoundError,
    PermissionDenied,
    DependencyError,
    MigrationError,
    RollbackError,
    TimeoutError,
    ConflictError,
    StateError,
    RollbackRequired,
    Internal,
}

impl CoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError { .. } => ErrorKind::ValidationError,
            Self::ConfigValidationError { .. } => ErrorKind::ConfigValidationError,
            Self::ConfigNotFoundError { .. } => ErrorKind::ConfigNotFoundError,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::DependencyError { .. } => ErrorKind::DependencyError,
            Self::MigrationError { .. } => ErrorKind::MigrationError,
            Self::RollbackError { .. } => ErrorKind::RollbackError,
            Self::TimeoutError { .. } => ErrorKind::TimeoutError,
            Self::ConflictError { .. } => ErrorKind::ConflictError,
            Self::StateError { .. } => ErrorKind::StateError,
            Self::RollbackRequired { .. } => ErrorKind::RollbackRequired,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably retry or otherwise recover.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::RollbackRequired { .. } | Self::ConflictError { .. })
    }

    #[must_use]
    pub fn resolution_hint(&self) -> Option<String> {
        match self {
            Self::DependencyError { missing, .. } => Some(format!(
                "activate the following dependencies first: {}",
                missing.join(", ")
            )),
            Self::ConflictError { owner: Some(o), .. } => {
                Some(format!("resolve via override/rename against owner '{o}'"))
            }
            Self::RollbackRequired { .. } => {
                Some("operator must inspect and manually resolve before retrying".to_owned())
            }
            Self::TimeoutError { .. } => Some("increase the phase timeout or retry".to_owned()),
            _ => None,
        }
    }
}

/// A single structured error attached to a `CoreOutcome`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub context: String,
    pub recoverable: bool,
    pub resolution_hint: Option<String>,
}

impl From<&CoreError> for ErrorDetail {
    fn from(err: &CoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            context: String::new(),
            recoverable: err.recoverable(),
            resolution_hint: err.resolution_hint(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
