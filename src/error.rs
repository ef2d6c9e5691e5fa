use thiserror::Error;

/// Central error type for the stage harness
#[derive(Error, Debug)]
pub enum HarnessError {
    // ============================================================================
    // Stage Errors
    // ============================================================================
    #[error("Stage processing failed: {0}")]
    StageProcessing(String),

    #[error("Stage panicked: {0}")]
    StagePanicked(String),

    #[error("Unknown stage class: {0}")]
    UnknownStageClass(String),

    // ============================================================================
    // Clipboard / Data Errors
    // ============================================================================
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Expected data not found: {0}")]
    MissingData(String),

    #[error("Value for '{key}' is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ============================================================================
    // Coordination Errors
    // ============================================================================
    #[error("Timed out waiting for {party} at {point}")]
    CoordinationTimeout { party: String, point: String },

    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("Barrier protocol violation: {0}")]
    ProtocolViolation(String),

    // ============================================================================
    // Event Errors
    // ============================================================================
    #[error("Event broker error: {0}")]
    Event(String),

    // ============================================================================
    // I/O and Serialization Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    /// Short stable name for the error category, recorded as `failureType`
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::StageProcessing(_) => "StageProcessing",
            HarnessError::StagePanicked(_) => "StagePanicked",
            HarnessError::UnknownStageClass(_) => "UnknownStageClass",
            HarnessError::NotFound(_) => "NotFound",
            HarnessError::MissingData(_) => "MissingData",
            HarnessError::TypeMismatch { .. } => "TypeMismatch",
            HarnessError::Configuration(_) => "Configuration",
            HarnessError::CoordinationTimeout { .. } => "CoordinationTimeout",
            HarnessError::PeerDisconnected(_) => "PeerDisconnected",
            HarnessError::ProtocolViolation(_) => "ProtocolViolation",
            HarnessError::Event(_) => "Event",
            HarnessError::Io(_) => "Io",
            HarnessError::Json(_) => "Json",
            HarnessError::LockError(_) => "LockError",
            HarnessError::Internal(_) => "Internal",
        }
    }

    /// Whether the error ends the execution context that observed it
    ///
    /// Stage-level errors are recovered by the stage loop; coordination and
    /// configuration errors are not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Configuration(_)
                | HarnessError::UnknownStageClass(_)
                | HarnessError::CoordinationTimeout { .. }
                | HarnessError::PeerDisconnected(_)
                | HarnessError::ProtocolViolation(_)
        )
    }
}

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl<T> From<std::sync::PoisonError<T>> for HarnessError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HarnessError::LockError(err.to_string())
    }
}
