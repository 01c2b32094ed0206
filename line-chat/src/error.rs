use std::io;

use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown command {token:?}")]
    UnknownCommand { token: String },

    #[error("malformed {command} command: {reason}")]
    Malformed {
        command: &'static str,
        reason: &'static str,
    },

    #[error("name is {len} bytes long, the limit is {limit}")]
    NameTooLong { len: usize, limit: usize },

    #[error("payload contains a line break")]
    EmbeddedNewline,

    #[error("stream ended in the middle of a command")]
    Truncated,

    #[error("command line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Recoverable errors only cost the offending line; the stream is still in
    /// sync and the session can keep reading.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::UnknownCommand { .. }
                | CodecError::Malformed { .. }
                | CodecError::NameTooLong { .. }
                | CodecError::EmbeddedNewline
        )
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("invalid name: {0}")]
    InvalidName(#[source] CodecError),
}

/// Why the client connector's read loop stopped.
#[derive(Debug, Error)]
pub enum Disconnect {
    #[error("connection closed by server")]
    EndOfStream,

    #[error("connection failed: {0}")]
    Failed(#[source] CodecError),
}
