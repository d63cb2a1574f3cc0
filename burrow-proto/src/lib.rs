//! Packet layout for the burrow tunnel wire protocol.
//!
//! One carrier connection transports a stream of packets, each framed as:
//!
//! ```text
//! serial:      u64   little-endian, strictly increasing per sender, from 1
//! session_id:  i64   target session (random filler for Ack)
//! type:        u8    Connect=0 Data=1 Signal=2 Ack=3
//! payload_len: u32   absent for Ack
//! payload:     [u8; payload_len]   ciphertext (absent for Ack)
//! ```
//!
//! `Connect` carries the target `host:port` (or the keepalive magic), `Data`
//! carries stream bytes, `Signal` carries a single [`signal`] code byte, and
//! `Ack` carries — in its *serial* field — the highest serial its sender has
//! received so far. Acks are advisory: nothing is retransmitted on ack lag.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use burrow_crypto::TunnelKey;

/// Bytes in the fixed packet header (serial + session_id + type).
pub const HEADER_LEN: usize = 8 + 8 + 1;

/// Upper bound accepted for `payload_len` before a frame is rejected as
/// garbage. Well above anything the tunnel emits (reads are chunked far
/// smaller), low enough that a corrupt length cannot balloon allocation.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// The `Connect` payload that marks the keepalive session instead of a
/// dial target. The remote keeps the session and echoes pings on it.
pub const KEEPALIVE_MAGIC: &[u8] = b"#burrow:keepalive#";

/// One-byte `Signal` payload codes. Values are part of the wire format.
pub mod signal {
    /// Orderly close of the peer's side of a session.
    pub const CLOSE: u8 = 0x00;
    /// Liveness probe; the remote echoes it back on the same session.
    pub const PING: u8 = 0x01;
}

// ─── PacketType ───────────────────────────────────────────────────────────────

/// Discriminant byte of a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    /// Opens a session; payload is the target address or keepalive magic.
    Connect = 0,
    /// Stream bytes for an open session.
    Data = 1,
    /// One-byte control code for an open session.
    Signal = 2,
    /// Highest-received-serial report; no payload.
    Ack = 3,
}

impl PacketType {
    /// Parse the wire discriminant. Unknown values are a protocol error and
    /// are surfaced to the caller as `None`.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Connect),
            1 => Some(Self::Data),
            2 => Some(Self::Signal),
            3 => Some(Self::Ack),
            _ => None,
        }
    }
}

// ─── Header ───────────────────────────────────────────────────────────────────

/// The fixed-size leading fields of a packet.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    /// Sender-side monotonic serial (or highest-received for Ack).
    pub serial: u64,
    /// Session the packet belongs to; meaningless for Ack.
    pub session_id: i64,
    /// Raw type byte as read off the wire.
    pub type_byte: u8,
}

impl Header {
    /// Decode the header from its [`HEADER_LEN`] wire bytes.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            serial: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            session_id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            type_byte: buf[16],
        }
    }

    /// The parsed packet type, if the type byte is recognized.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_wire(self.type_byte)
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────────────

/// Build a `Connect`/`Data`/`Signal` packet, encrypting `payload` in place
/// into the frame.
pub fn encode(
    key: &TunnelKey,
    serial: u64,
    session_id: i64,
    kind: PacketType,
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(kind != PacketType::Ack, "use encode_ack for acks");
    let mut buf = Vec::with_capacity(HEADER_LEN + 4 + payload.len());
    buf.extend(serial.to_le_bytes());
    buf.extend(session_id.to_le_bytes());
    buf.push(kind as u8);
    buf.extend((payload.len() as u32).to_le_bytes());
    let body_start = buf.len();
    buf.extend_from_slice(payload);
    key.encrypt_payload(&mut buf[body_start..]);
    buf
}

/// Build an `Ack` packet. `received` is the highest serial received so far;
/// `filler_id` fills the (ignored) session_id field.
pub fn encode_ack(received: u64, filler_id: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend(received.to_le_bytes());
    buf.extend(filler_id.to_le_bytes());
    buf.push(PacketType::Ack as u8);
    buf
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TunnelKey {
        TunnelKey::from_secret(b"0123456789abcdef").unwrap()
    }

    #[test]
    fn data_packet_layout() {
        let payload: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let wire = encode(&key(), 7, -42, PacketType::Data, &payload);

        assert_eq!(wire.len(), HEADER_LEN + 4 + payload.len());
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&wire[..HEADER_LEN]);
        let header = Header::decode(&head);
        assert_eq!(header.serial, 7);
        assert_eq!(header.session_id, -42);
        assert_eq!(header.packet_type(), Some(PacketType::Data));
        assert_eq!(
            u32::from_le_bytes(wire[17..21].try_into().unwrap()),
            payload.len() as u32
        );

        // Body decrypts back to the original payload.
        let mut body = wire[21..].to_vec();
        key().decrypt_payload(&mut body);
        assert_eq!(body, payload);
    }

    #[test]
    fn ack_packet_has_no_length_field() {
        let wire = encode_ack(99, 1234);
        assert_eq!(wire.len(), HEADER_LEN);
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&wire);
        let header = Header::decode(&head);
        assert_eq!(header.serial, 99);
        assert_eq!(header.packet_type(), Some(PacketType::Ack));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        assert_eq!(PacketType::from_wire(0xff), None);
        assert_eq!(PacketType::from_wire(4), None);
    }

    #[test]
    fn signal_packet_is_one_code_byte() {
        let wire = encode(&key(), 1, 5, PacketType::Signal, &[signal::PING]);
        assert_eq!(u32::from_le_bytes(wire[17..21].try_into().unwrap()), 1);
        // A single byte is below the first block boundary, so it is readable
        // as-is on the wire.
        assert_eq!(wire[21], signal::PING);
    }
}
