// file: src/error.rs
// version: 2.1.0
// guid: 57b83a63-07b6-4534-aa6c-51e8797254e0

use thiserror::Error;

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, CloudImagesError>;

/// Error types for building and publishing cloud images
#[derive(Error, Debug)]
pub enum CloudImagesError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient remote error: {0}")]
    TransientError(String),

    #[error("Remote error (status {status}): {message}")]
    RemoteError { status: u16, message: String },

    #[error("Provisioning failed: {0}")]
    ProvisioningError(String),

    #[error("Precondition failed: {0}")]
    PreconditionError(String),

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Command {program} failed with exit code {code}: {stderr}")]
    SubprocessError {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl CloudImagesError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientError(msg.into())
    }

    /// Create a new provisioning error
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::ProvisioningError(msg.into())
    }

    /// Create a new precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionError(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::IntegrityError(msg.into())
    }

    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthError(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::TimeoutError(msg.into())
    }

    /// Classify an HTTP status code returned by a remote API
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound(message),
            401 | 403 => Self::AuthError(message),
            408 | 429 | 500..=599 => Self::TransientError(format!("HTTP {}: {}", status, message)),
            _ => Self::RemoteError { status, message },
        }
    }

    /// Whether the operation that produced this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientError(_))
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SubprocessError { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }
}
