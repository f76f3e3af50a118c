use emuhost_protocol::{ErrorCode, Generation, RequestId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already starting")]
    AlreadyStarting,

    #[error("modal request already pending: {0}")]
    AlreadyPending(RequestId),

    #[error("worker for generation {generation} did not stop within {timeout_ms}ms")]
    StopTimeout { generation: Generation, timeout_ms: u64 },

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("stale generation ignored: {0}")]
    StaleGeneration(Generation),

    #[error("worker is not running")]
    WorkerNotRunning,

    #[error("worker for generation {0} still holds the surface")]
    RetractTimeout(Generation),

    #[error("modal request not found: {0}")]
    ModalNotFound(RequestId),

    #[error("modal request already resolved: {0}")]
    AlreadyResolved(RequestId),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SessionError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            SessionError::AlreadyStarting => (ErrorCode::AlreadyStarting, self.to_string()),
            SessionError::AlreadyPending(_) => (ErrorCode::AlreadyPending, self.to_string()),
            SessionError::StopTimeout { .. } => (ErrorCode::StopTimeout, self.to_string()),
            SessionError::WorkerCrashed(_) => (ErrorCode::WorkerCrashed, self.to_string()),
            SessionError::StaleGeneration(_) => (ErrorCode::StaleGeneration, self.to_string()),
            SessionError::WorkerNotRunning => (ErrorCode::WorkerNotRunning, self.to_string()),
            SessionError::RetractTimeout(_) => (ErrorCode::RetractTimeout, self.to_string()),
            SessionError::ModalNotFound(_) => (ErrorCode::ModalNotFound, self.to_string()),
            SessionError::AlreadyResolved(_) => (ErrorCode::AlreadyResolved, self.to_string()),
            SessionError::Spawn(_) => (ErrorCode::HostError, "failed to spawn worker".to_string()),
        }
    }

    /// Misuse errors are never retried automatically.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyStarting
                | SessionError::AlreadyPending(_)
                | SessionError::AlreadyResolved(_)
        )
    }
}
