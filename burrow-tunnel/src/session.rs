//! Session handles.

use std::sync::Arc;
use std::time::Instant;

use burrow_proto::{self as proto, PacketType};

use crate::comm::CommLink;
use crate::errors::TunnelError;

/// One logical bidirectional byte stream multiplexed over a Comm.
///
/// A `Session` is a thin handle: cloning it is cheap and every clone refers
/// to the same entry in the owning Comm's session table. The handle stays
/// valid for packet construction even after [`Session::close`]; packets for
/// a closed id are a protocol error at the peer, so callers gate sends on
/// their own close bookkeeping.
#[derive(Clone)]
pub struct Session {
    pub(crate) id: i64,
    pub(crate) link: Arc<CommLink>,
}

impl Session {
    /// The session's wire identifier.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// When the session was added to the session table, if it still is.
    pub fn opened_at(&self) -> Option<Instant> {
        self.link
            .sessions
            .lock()
            .unwrap()
            .get(&self.id)
            .map(|r| r.opened_at)
    }

    /// Queue a `Data` packet with `bytes` for the peer.
    ///
    /// The serial is assigned here, the payload is encrypted, and the packet
    /// joins the Comm's send queue (awaiting queue capacity, never dropping).
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TunnelError> {
        let packet = proto::encode(
            &self.link.key,
            self.link.next_serial(),
            self.id,
            PacketType::Data,
            bytes,
        );
        self.link
            .send_tx
            .send(packet)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Queue a one-byte `Signal` packet for the peer.
    pub async fn signal(&self, code: u8) -> Result<(), TunnelError> {
        let packet = proto::encode(
            &self.link.key,
            self.link.next_serial(),
            self.id,
            PacketType::Signal,
            &[code],
        );
        self.link
            .send_tx
            .send(packet)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Remove the session from its Comm's session table.
    ///
    /// No packet is emitted — the peer learns of the close from a prior
    /// [`Session::signal`] with [`burrow_proto::signal::CLOSE`]. Idempotent.
    pub fn close(&self) {
        self.link.sessions.lock().unwrap().remove(&self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
