//! Error types for burrow-tunnel.

use std::{fmt, io};

/// The error type returned by tunnel operations.
#[derive(Debug)]
pub enum TunnelError {
    /// Network / I/O failure on the carrier or during a handshake.
    Io(io::Error),
    /// The peer violated the wire protocol (bad type byte, unknown session
    /// id, implausible frame length, duplicate session id).
    Protocol(String),
    /// The responder rejected our handshake proof, or the proof we received
    /// did not match.
    AuthRejected,
    /// The configured shared secret is unusable.
    Key(burrow_crypto::KeyError),
    /// A handshake or dial did not complete in time.
    Timeout(String),
    /// The Comm this handle belongs to has been closed.
    Closed,
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(s) => write!(f, "protocol error: {s}"),
            Self::AuthRejected => write!(f, "peer rejected authentication"),
            Self::Key(e) => write!(f, "key error: {e}"),
            Self::Timeout(s) => write!(f, "timed out: {s}"),
            Self::Closed => write!(f, "comm is closed"),
        }
    }
}

impl std::error::Error for TunnelError {}

impl From<io::Error> for TunnelError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<burrow_crypto::KeyError> for TunnelError {
    fn from(e: burrow_crypto::KeyError) -> Self {
        Self::Key(e)
    }
}
