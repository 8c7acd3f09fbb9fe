//! Error taxonomy for the SCP engine
// (c) 2024 Ross Younger

use std::io;

/// Canonical text sent to the peer when an authorization check fails.
pub const PERMISSION_DENIED_MSG: &str = "permission denied";

/// Everything that can go wrong while driving one SCP command.
///
/// Every engine function returns one of these; the function that first
/// observes a failure is responsible for sending the ERR ack (when the
/// channel is still coherent), settling any in-flight transfer, and
/// returning the error unchanged. The dispatcher maps any error to SSH
/// exit status 1.
#[derive(Debug, thiserror::Error)]
pub enum ScpError {
    /// Malformed or unexpected SCP control message, negative directory
    /// depth, empty file name.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An authorization, file-pattern or pre-action check failed.
    #[error("permission denied")]
    PermissionDenied,

    /// A transfer-count or byte quota is exhausted.
    #[error("{0}")]
    Quota(String),

    /// A filesystem backend operation failed.
    #[error("{0}")]
    Fs(#[source] io::Error),

    /// The peer sent a WARN or ERR ack; the payload is its diagnostic
    /// text, verbatim. WARN is treated identically to ERR.
    #[error("{0}")]
    Peer(String),

    /// The SSH channel itself failed; no further writes are attempted.
    #[error("channel i/o error: {0}")]
    Transport(#[source] io::Error),

    /// The peer closed its end of the channel. The upload receive loop
    /// treats this as the normal end of the stream; everywhere else it
    /// is a failure.
    #[error("unexpected end of stream")]
    Eof,

    /// Anything without a more precise classification.
    #[error("{0}")]
    Failure(String),
}

impl ScpError {
    /// True for the clean end-of-stream marker.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, ScpError::Eof)
    }
}
