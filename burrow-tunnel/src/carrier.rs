//! The swappable carrier socket.
//!
//! A [`Carrier`] owns the socket halves of the one TCP connection a Comm
//! multiplexes over, and lets that connection be replaced mid-flight with
//! [`Carrier::use_conn`]. The sender and reader tasks each hold their half
//! behind a channel, so a swap is observed at a packet boundary on the write
//! side and aborts at most one in-flight parse on the read side — no packet
//! ever straddles two sockets.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Handle used to install replacement sockets.
pub(crate) struct Carrier {
    rd_tx: mpsc::UnboundedSender<OwnedReadHalf>,
    wr_tx: mpsc::UnboundedSender<OwnedWriteHalf>,
    generation: AtomicU64,
}

impl Carrier {
    /// Wrap an established connection, returning the swap handle and the
    /// two task-side endpoints.
    pub(crate) fn new(stream: TcpStream) -> (Self, CarrierReader, CarrierWriter) {
        let (rd, wr) = stream.into_split();
        let (rd_tx, rd_rx) = mpsc::unbounded_channel();
        let (wr_tx, wr_rx) = mpsc::unbounded_channel();
        let carrier = Self {
            rd_tx,
            wr_tx,
            generation: AtomicU64::new(1),
        };
        let reader = CarrierReader {
            current: Some(rd),
            rx: rd_rx,
        };
        let writer = CarrierWriter {
            current: Some(wr),
            rx: wr_rx,
        };
        (carrier, reader, writer)
    }

    /// Atomically replace the underlying connection.
    ///
    /// Returns the new generation number. The previous socket is released as
    /// soon as each task picks up its replacement half.
    pub(crate) fn use_conn(&self, stream: TcpStream) -> u64 {
        let (rd, wr) = stream.into_split();
        // The receivers only disappear once the Comm is shutting down, at
        // which point the replacement is moot.
        let _ = self.rd_tx.send(rd);
        let _ = self.wr_tx.send(wr);
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ─── Read side ────────────────────────────────────────────────────────────────

/// Why a carrier read did not complete.
pub(crate) enum ReadInterrupt {
    /// A replacement socket arrived; the caller must restart its parse
    /// against the fresh connection.
    Superseded,
    /// The current socket failed; wait for a replacement.
    Io(io::Error),
    /// The Carrier handle is gone — the Comm is closing.
    Closed,
}

pub(crate) struct CarrierReader {
    current: Option<OwnedReadHalf>,
    rx: mpsc::UnboundedReceiver<OwnedReadHalf>,
}

impl CarrierReader {
    /// Fill `buf` from the current socket.
    ///
    /// A socket swap while blocked here abandons the partial read and
    /// returns [`ReadInterrupt::Superseded`] with the new socket installed.
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ReadInterrupt> {
        let sock = match self.current.as_mut() {
            Some(s) => s,
            None => {
                return match self.rx.recv().await {
                    Some(half) => {
                        self.current = Some(half);
                        Err(ReadInterrupt::Superseded)
                    }
                    None => Err(ReadInterrupt::Closed),
                };
            }
        };
        let rx = &mut self.rx;
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(half) => {
                    self.current = Some(half);
                    Err(ReadInterrupt::Superseded)
                }
                None => Err(ReadInterrupt::Closed),
            },
            res = sock.read_exact(buf) => match res {
                Ok(_) => Ok(()),
                Err(e) => {
                    self.current = None;
                    Err(ReadInterrupt::Io(e))
                }
            },
        }
    }

    /// Block until a replacement socket is installed.
    ///
    /// Returns `false` when the Carrier has been dropped and no replacement
    /// can ever arrive.
    pub(crate) async fn wait_replacement(&mut self) -> bool {
        match self.rx.recv().await {
            Some(half) => {
                self.current = Some(half);
                // Collapse a burst of swaps down to the newest socket.
                while let Ok(newer) = self.rx.try_recv() {
                    self.current = Some(newer);
                }
                true
            }
            None => false,
        }
    }
}

// ─── Write side ───────────────────────────────────────────────────────────────

/// The Carrier was dropped while a packet was still undelivered.
pub(crate) struct WriteClosed;

pub(crate) struct CarrierWriter {
    current: Option<OwnedWriteHalf>,
    rx: mpsc::UnboundedReceiver<OwnedWriteHalf>,
}

impl CarrierWriter {
    /// Write one whole packet, retrying on every replacement socket until it
    /// is delivered.
    ///
    /// A failed write keeps the packet and parks on the swap channel, so
    /// whatever was queued when the carrier broke goes out on the next
    /// connection.
    pub(crate) async fn send(&mut self, packet: &[u8]) -> Result<(), WriteClosed> {
        loop {
            // Prefer the newest socket if swaps are queued up.
            while let Ok(next) = self.rx.try_recv() {
                self.current = Some(next);
            }
            let sock = match self.current.as_mut() {
                Some(s) => s,
                None => match self.rx.recv().await {
                    Some(half) => {
                        self.current = Some(half);
                        continue;
                    }
                    None => return Err(WriteClosed),
                },
            };
            match sock.write_all(packet).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("[carrier] write failed ({e}), holding packet for next socket");
                    self.current = None;
                }
            }
        }
    }
}
