use thiserror::Error;

/// Engine failures, always scoped to a session or connection.
///
/// Nothing here is treated as globally fatal: a failure affects the id it
/// is reported for and leaves sibling sessions and connections untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    /// SSH handshake or cluster credential rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Tunnel listener bind or stream disconnect
    #[error("transport failure: {0}")]
    Transport(String),

    /// Disallowed filter command, rejected before any process is spawned
    #[error("invalid filter command: {0}")]
    Validation(String),

    /// Filter process spawn error or abnormal exit
    #[error("filter process failure: {0}")]
    Process(String),

    /// Operation referenced a connection id that is not registered
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
