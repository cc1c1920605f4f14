use std::io;

/// Errors from sandbox operations.
///
/// Every variant carries a stable [`ErrorCode`] that survives the wire:
/// the server serializes `{ code, message }`, the client maps the code
/// string back. Messages are informational only; callers branch on the
/// code, never on text.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unsupported operation: {0}")]
    Unimplemented(&'static str),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("canceled")]
    Canceled,

    #[error("backend_capability_mismatch: {0}")]
    BackendCapabilityMismatch(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SandboxError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            SandboxError::NotFound(_) => ErrorCode::NotFound,
            SandboxError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            SandboxError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SandboxError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            SandboxError::Unimplemented(_) => ErrorCode::Unimplemented,
            SandboxError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            SandboxError::Canceled => ErrorCode::Canceled,
            SandboxError::BackendCapabilityMismatch(_) => ErrorCode::BackendCapabilityMismatch,
            SandboxError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild a typed error from its wire form.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::InvalidArgument => SandboxError::InvalidArgument(message),
            ErrorCode::NotFound => SandboxError::NotFound(message),
            ErrorCode::FailedPrecondition => SandboxError::FailedPrecondition(message),
            ErrorCode::AlreadyExists => SandboxError::AlreadyExists(message),
            ErrorCode::ResourceExhausted => SandboxError::ResourceExhausted(message),
            ErrorCode::Unimplemented => SandboxError::Unimplemented("remote"),
            ErrorCode::DeadlineExceeded => SandboxError::DeadlineExceeded,
            ErrorCode::Canceled => SandboxError::Canceled,
            ErrorCode::BackendCapabilityMismatch => {
                SandboxError::BackendCapabilityMismatch(message)
            }
            ErrorCode::Internal => SandboxError::Internal(message),
        }
    }
}

impl From<io::Error> for SandboxError {
    fn from(e: io::Error) -> Self {
        SandboxError::Internal(format!("io: {e}"))
    }
}

/// Stable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    AlreadyExists,
    ResourceExhausted,
    Unimplemented,
    DeadlineExceeded,
    Canceled,
    BackendCapabilityMismatch,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Canceled => "canceled",
            ErrorCode::BackendCapabilityMismatch => "backend_capability_mismatch",
            ErrorCode::Internal => "internal",
        }
    }

    /// Map a wire code string (plus the message, for codes that ride inside
    /// an internal error's text) back to a typed code. Unknown strings map
    /// to `Internal`.
    pub fn parse(code: &str, message: &str) -> ErrorCode {
        match code {
            "invalid_argument" => ErrorCode::InvalidArgument,
            "not_found" => ErrorCode::NotFound,
            "failed_precondition" => ErrorCode::FailedPrecondition,
            "already_exists" => ErrorCode::AlreadyExists,
            "resource_exhausted" => ErrorCode::ResourceExhausted,
            "unimplemented" => ErrorCode::Unimplemented,
            "deadline_exceeded" => ErrorCode::DeadlineExceeded,
            "canceled" => ErrorCode::Canceled,
            "backend_capability_mismatch" => ErrorCode::BackendCapabilityMismatch,
            _ if message.contains("backend_capability_mismatch") => {
                ErrorCode::BackendCapabilityMismatch
            }
            _ => ErrorCode::Internal,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
