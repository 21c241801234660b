use thiserror::Error;

use crate::protocol::ProtocolError;

/// Top-level error for the chat client subsystem.
///
/// Expected failure modes (malformed frames, transient network faults,
/// permission denials) are handled inside their own component and never
/// bubble up here; these variants cover contract violations and faults the
/// caller must act on.
#[derive(Error, Debug)]
pub enum VicinityError {
    #[error("Location is not available")]
    MissingLocation,

    #[error("Session has not joined a chat room")]
    NotJoined,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
