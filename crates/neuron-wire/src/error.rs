//! Errors from the wire protocol layer.

use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Node with ID `{peer}` is not connected")]
    NotConnected { peer: String },
    #[error("Channel to node `{peer}` closed")]
    ChannelClosed { peer: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Node with ID `{peer}` sent a malformed message: {reason}")]
    Malformed { peer: String, reason: String },
    #[error("Correlation id `{0}` is already in use on this connection")]
    DuplicateCorrelation(String),
    #[error("The authenticity of node with ID `{peer}` could not be verified")]
    Authenticity { peer: String },
    #[error("Timed out waiting for reply `{correlation}` from node `{peer}`")]
    Timeout { peer: String, correlation: String },
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Directory error: {0}")]
    Directory(String),
}

/// Coarse classification of a [`WireError`], so callers can tell an
/// unreachable peer apart from one whose identity cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The channel is not open, closed mid-exchange, or the transport failed.
    Channel,
    /// The peer sent a reply missing required fields.
    Protocol,
    /// A signature did not verify against the peer's known public key.
    Authenticity,
    /// No correlated reply arrived in time.
    Timeout,
    /// Configuration, directory, encoding or key material problems.
    Other,
}

impl WireError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::Io(_)
            | WireError::NotConnected { .. }
            | WireError::ChannelClosed { .. }
            | WireError::Transport(_) => ErrorKind::Channel,
            WireError::Malformed { .. } | WireError::DuplicateCorrelation(_) => {
                ErrorKind::Protocol
            }
            WireError::Authenticity { .. } => ErrorKind::Authenticity,
            WireError::Timeout { .. } => ErrorKind::Timeout,
            WireError::Json(_)
            | WireError::UnknownPeer(_)
            | WireError::MessageTooLarge { .. }
            | WireError::Crypto(_)
            | WireError::Directory(_) => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = WireError::NotConnected {
            peer: "node-1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Channel);
        assert_eq!(err.to_string(), "Node with ID `node-1` is not connected");

        let err = WireError::Authenticity {
            peer: "node-1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Authenticity);

        let err = WireError::Malformed {
            peer: "node-1".to_string(),
            reason: "missing signature".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err = WireError::Timeout {
            peer: "node-1".to_string(),
            correlation: "00ff".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
