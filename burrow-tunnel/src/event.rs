//! Inbound events surfaced by a Comm.

use tokio::sync::mpsc;

use crate::session::Session;

/// One event from the peer, in arrival order.
pub enum Event {
    /// The peer opened a session. `payload` is the cleartext `Connect`
    /// payload — the target `host:port`, or the keepalive magic.
    Session {
        /// Handle for the freshly registered session.
        session: Session,
        /// Cleartext Connect payload.
        payload: Vec<u8>,
    },
    /// Stream bytes for an open session.
    Data {
        /// The session the bytes belong to.
        session: Session,
        /// Decrypted stream bytes.
        payload: Vec<u8>,
    },
    /// A one-byte control code for an open session (see [`burrow_proto::signal`]).
    Signal {
        /// The session the signal targets.
        session: Session,
        /// Signal code byte.
        code: u8,
    },
    /// The peer violated the protocol. Emitted at most once; the Comm's
    /// reader has stopped and the Comm should be torn down.
    Error {
        /// Human-readable description of the violation.
        reason: String,
    },
}

/// Asynchronous stream of [`Event`]s from one Comm.
pub struct EventStream {
    pub(crate) rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the Comm has been closed
    /// and the queue drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
