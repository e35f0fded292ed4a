use thiserror::Error;

/// Errors that can terminate a single connection's framing/dispatch loop.
///
/// Errors here never propagate past the `Session` that produced them; see
/// `Error::is_self_induced_timeout` for the one case the dispatch loop must
/// treat as a clean end-of-session rather than a genuine failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("failed to decode LDAP message: {0}")]
    Decode(String),

    #[error("failed to encode LDAP message: {0}")]
    Encode(String),

    #[error("Server::serve called with no connection-construction callback configured")]
    MissingHandlerFactory,
}

impl Error {
    /// `true` when this error is the reader unblocking on the one-millisecond
    /// deadline the Shutdown-Watch Task or close protocol sets to force a
    /// blocked socket read to return. The dispatch loop treats this as the
    /// expected end of a session, not a fault.
    pub fn is_self_induced_timeout(&self) -> bool {
        matches!(self, Error::Framing(FrameError::DeadlineExceeded))
    }
}

/// Errors produced while framing a single length-delimited BER message off
/// the wire, before the message body is handed to the external codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed BER tag")]
    MalformedTag,

    #[error("malformed BER length")]
    MalformedLength,

    #[error("truncated message body")]
    Truncated,

    #[error("read deadline exceeded")]
    DeadlineExceeded,
}

pub type Result<T> = std::result::Result<T, Error>;
