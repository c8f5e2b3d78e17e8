//! Error types for the forwarding engine.

use std::fmt;
use std::io;

use thiserror::Error;

/// Which end of a forwarded connection a close error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    /// The local connection (accepted or supplied by the caller).
    Local,
    /// The remote channel opened against the session.
    Remote,
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSide::Local => write!(f, "local"),
            StreamSide::Remote => write!(f, "remote"),
        }
    }
}

/// Terminating conditions surfaced by the forwarder entry points.
///
/// Copy-direction errors are never represented here: a one-sided EOF is an
/// expected way for a relay to wind down.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The session could not expose the remote port.
    #[error("failed to share remote port {port}: {source}")]
    Share {
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    /// A channel could not be opened against an already shared port.
    #[error("failed to open streaming channel: {0}")]
    OpenChannel(#[source] anyhow::Error),

    /// The listener stopped accepting connections.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Closing one side of a forwarded connection failed.
    ///
    /// Handlers log this at `debug`; it only becomes the returned outcome when
    /// nothing was recorded before the close, which no handler path does today.
    #[error("failed to close {side} stream: {source}")]
    Close {
        side: StreamSide,
        #[source]
        source: io::Error,
    },

    /// The cancellation token fired.
    #[error("forwarding cancelled")]
    Cancelled,
}

impl ForwardError {
    /// Returns true if this error reports cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ForwardError::Cancelled)
    }

    /// Stable reason code for logs and callers that branch on the failure kind.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ForwardError::Share { .. } => "share_failed",
            ForwardError::OpenChannel(_) => "channel_open_failed",
            ForwardError::Accept(_) => "accept_failed",
            ForwardError::Close { .. } => "close_failed",
            ForwardError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_error_mentions_port_and_cause() {
        let err = ForwardError::Share {
            port: 8080,
            source: anyhow::anyhow!("remote rejected"),
        };
        let msg = err.to_string();
        assert!(msg.contains("8080"));
        assert!(msg.contains("remote rejected"));
        assert_eq!(err.reason_code(), "share_failed");
    }

    #[test]
    fn test_close_error_names_side() {
        let err = ForwardError::Close {
            side: StreamSide::Remote,
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(err.to_string().starts_with("failed to close remote stream"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled() {
        assert!(ForwardError::Cancelled.is_cancelled());
        assert_eq!(ForwardError::Cancelled.reason_code(), "cancelled");
    }
}
