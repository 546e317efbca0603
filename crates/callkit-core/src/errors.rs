use thiserror::Error;

/// Failure returned by a call-session command.
///
/// Every variant returned from the controller is also published on the
/// lifecycle stream as [`crate::events::CallEvent::Error`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("a join is already in flight")]
    Busy,
    #[error("engine not initialized")]
    NotInitialized,
    #[error("join was not confirmed in time")]
    JoinTimeout,
    #[error("controller disposed")]
    Disposed,
}

/// Failure while acquiring a join credential.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential network failure: {0}")]
    NetworkFailure(String),
    #[error("credential server rejected request: {0}")]
    ServerRejected(String),
    #[error("credential policy misconfigured: {0}")]
    Misconfigured(String),
}

/// Failure reported asynchronously by the RTC transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("credential expired")]
    CredentialExpired,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("engine error {code}: {message}")]
    Unknown { code: i32, message: String },
}

/// Synchronous failure of an engine command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("engine call `{operation}` failed: {message}")]
pub struct EngineError {
    pub operation: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}
