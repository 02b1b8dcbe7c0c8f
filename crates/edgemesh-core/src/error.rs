use thiserror::Error;

/// The taxonomy from spec §7. Boundary adapters map each variant to an HTTP
/// status; internal callers pattern-match on kind, the way `seesaw`'s
/// `SeesawError`/`Categorizable` expose a `category()` a dispatcher switches
/// on rather than a bag of untyped strings.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("task '{task_id}' is assigned to '{assigned_to}', not '{submitted_by}'")]
    AssignmentMismatch {
        task_id: String,
        assigned_to: String,
        submitted_by: String,
    },

    #[error("task '{task_id}' is not executable in status {status}")]
    NotExecutable { task_id: String, status: String },

    #[error("validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("invalid or missing shared secret")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The HTTP status an (external) boundary adapter should surface for
    /// this error (spec §7).
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NotFound { .. } => 404,
            CoreError::InvalidTransition { .. } => 409,
            CoreError::AssignmentMismatch { .. } => 409,
            CoreError::NotExecutable { .. } => 409,
            CoreError::Validation { .. } => 422,
            CoreError::Unauthorized => 401,
            CoreError::Internal(_) => 500,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
