//! Error types for the simulator core.

use thiserror::Error;

/// A specialized Result type for simulator operations.
pub type Result<T> = std::result::Result<T, SimError>;

/// The main error type for all simulator operations.
#[derive(Debug, Error)]
pub enum SimError {
    // === Configuration Errors ===
    /// Invalid channel or point configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid address format
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // === Link Errors ===
    /// Socket or serial port could not be opened
    #[error("Link error: {0}")]
    Link(String),

    /// Not connected to the remote peer
    #[error("Not connected")]
    NotConnected,

    // === Transient I/O Errors ===
    /// A single read or write timed out or returned a protocol exception
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Read operation timeout
    #[error("Read timeout")]
    ReadTimeout,

    /// Write operation timeout
    #[error("Write timeout")]
    WriteTimeout,

    // === Data Errors ===
    /// Register pack/unpack mismatch
    #[error("Codec error: {0}")]
    Codec(String),

    /// Value outside the register's representable range
    #[error("Range error: {0}")]
    Range(String),

    /// Point not found
    #[error("Point not found: {0}")]
    PointNotFound(String),

    // === Formula Errors ===
    /// Formula parse or evaluation failure
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Expression node outside the closed evaluation set
    #[error("Unsupported operation: {0}")]
    UnsupportedOp(String),

    // === State Errors ===
    /// Operation against a stopped device
    #[error("State error: {0}")]
    State(String),

    // === IO Errors ===
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl SimError {
    /// Check if this error indicates that reconnection is needed.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Link(_) | Self::NotConnected | Self::Io(_) | Self::ChannelClosed
        )
    }

    /// Check if this error is absorbed as a point validity flag rather
    /// than propagated to callers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::ReadTimeout | Self::WriteTimeout | Self::Codec(_)
        )
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a link error.
    pub fn link(msg: impl Into<String>) -> Self {
        Self::Link(msg.into())
    }

    /// Create a transient I/O error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a range error.
    pub fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    /// Create a mapping error.
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}
