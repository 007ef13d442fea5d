//! Error types for Chatsync

use thiserror::Error;

/// Main error type for Chatsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Send attempted while the transport is not connected or not ready
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// An application handler returned an error or panicked
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Malformed or out-of-sequence message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The leader serving an RPC went away before answering
    #[error("Leader changed while awaiting RPC {call_id}")]
    LeaderChanged {
        /// The call that was cancelled
        call_id: String,
    },

    /// A pipe between the same two transports already exists
    #[error("Pipe already registered: {from} -> {to}")]
    DuplicatePipe {
        /// Source transport id
        from: String,
        /// Target transport id
        to: String,
    },

    /// A transport with this id is already registered
    #[error("Transport already registered: {0}")]
    DuplicateTransport(String),

    /// Referenced transport is not registered with the bus
    #[error("Transport not registered: {0}")]
    UnknownTransport(String),

    /// The remote side of an RPC reported a failure
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket-level failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid server URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A channel or task closed underneath the caller
    #[error("Closed: {0}")]
    Closed(String),
}

impl SyncError {
    /// Whether the caller should retry the operation.
    ///
    /// A leader change is transient: a new leader is being elected and the
    /// same call will succeed against it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LeaderChanged { .. }
                | SyncError::TransportUnavailable(_)
                | SyncError::WebSocket(_)
                | SyncError::Io(_)
        )
    }

    /// Whether this error is a setup-time configuration mistake.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::DuplicatePipe { .. }
                | SyncError::DuplicateTransport(_)
                | SyncError::UnknownTransport(_)
                | SyncError::InvalidUrl(_)
        )
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
