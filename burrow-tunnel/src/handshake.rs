//! Carrier authentication handshake.
//!
//! Traffic on a fresh carrier connection, initiator (the local endpoint)
//! first:
//!
//! ```text
//! → challenge: [u8; 64]          random
//! → proof:     [u8; 64]          payload transform of the challenge
//! ← status:    u8                0x01 ok / 0x00 reject (then close)
//! → comm_id:   i64 little-endian stable across reconnects
//! ```
//!
//! The responder recomputes the proof with its own key and compares all 64
//! bytes. The commId lets the responder rebind a replacement socket to the
//! Comm that already carries the initiator's sessions.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use burrow_crypto::{challenge, TunnelKey, CHALLENGE_LEN};

use crate::errors::TunnelError;

const STATUS_OK: u8 = 0x01;
const STATUS_REJECT: u8 = 0x00;

/// Ceiling on dial + handshake for [`connect`].
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Run the initiator side of the handshake on an established connection.
pub async fn initiate(
    stream: &mut TcpStream,
    key: &TunnelKey,
    comm_id: i64,
) -> Result<(), TunnelError> {
    let c = challenge();
    stream.write_all(&c).await?;
    stream.write_all(&key.prove(&c)).await?;

    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await?;
    if status[0] != STATUS_OK {
        return Err(TunnelError::AuthRejected);
    }

    stream.write_all(&comm_id.to_le_bytes()).await?;
    Ok(())
}

/// Run the responder side of the handshake on an accepted connection.
///
/// On a proof mismatch a reject status is written before the error is
/// returned; the caller drops the socket.
pub async fn accept(stream: &mut TcpStream, key: &TunnelKey) -> Result<i64, TunnelError> {
    let mut c = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut c).await?;
    let mut proof = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut proof).await?;

    if key.prove(&c) != proof {
        let _ = stream.write_all(&[STATUS_REJECT]).await;
        return Err(TunnelError::AuthRejected);
    }
    stream.write_all(&[STATUS_OK]).await?;

    let mut id_buf = [0u8; 8];
    stream.read_exact(&mut id_buf).await?;
    Ok(i64::from_le_bytes(id_buf))
}

/// Dial `addr` and authenticate as initiator, all under [`HANDSHAKE_TIMEOUT`].
///
/// Used both for the first carrier at startup and for every replacement
/// carrier after the connection goes stale.
pub async fn connect(addr: &str, key: &TunnelKey, comm_id: i64) -> Result<TcpStream, TunnelError> {
    let fut = async {
        let mut stream = TcpStream::connect(addr).await?;
        initiate(&mut stream, key, comm_id).await?;
        Ok::<TcpStream, TunnelError>(stream)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| {
            TunnelError::Timeout(format!(
                "handshake with {addr} did not complete within {HANDSHAKE_TIMEOUT:?}"
            ))
        })?
}
