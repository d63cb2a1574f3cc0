//! The packet-level endpoint: one Comm multiplexes many sessions over one
//! carrier connection.
//!
//! A Comm runs three background tasks:
//!
//! * **sender** — drains the send queue and writes whole packets to the
//!   carrier, parking (packet in hand) whenever the carrier is broken until
//!   [`Comm::use_conn`] installs a replacement;
//! * **reader** — parses inbound packets, tracks ack/receive counters, and
//!   dispatches [`Event`]s; a protocol violation emits one `Error` event and
//!   stops the reader for good, while a plain I/O failure just waits for the
//!   next carrier socket;
//! * **ack ticker** — every [`ACK_INTERVAL`], reports the highest serial
//!   received so far, but only when it advanced since the last report.
//!
//! Acks are advisory: the sender never retransmits on ack lag, the counter
//! exists for observability (and for the peer's own bookkeeping).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use burrow_crypto::TunnelKey;
use burrow_proto::{self as proto, Header, PacketType, HEADER_LEN, MAX_PAYLOAD_LEN};

use crate::carrier::{Carrier, CarrierReader, CarrierWriter, ReadInterrupt};
use crate::errors::TunnelError;
use crate::event::{Event, EventStream};
use crate::session::Session;

/// Depth of the send queue and of the event stream. Enqueueing past this
/// applies back-pressure; nothing is ever dropped.
const QUEUE_DEPTH: usize = 65536;

/// Cadence of the ack ticker.
pub const ACK_INTERVAL: Duration = Duration::from_millis(500);

// ─── Shared state ─────────────────────────────────────────────────────────────

/// State shared between a Comm and every [`Session`] handle it issued:
/// enough to construct and enqueue packets, and the session table itself.
pub(crate) struct CommLink {
    pub(crate) key: TunnelKey,
    pub(crate) send_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) serial: AtomicU64,
    pub(crate) sessions: Mutex<HashMap<i64, SessionRecord>>,
}

pub(crate) struct SessionRecord {
    pub(crate) opened_at: Instant,
}

impl CommLink {
    /// Allocate the next outbound serial (first packet gets 1).
    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct CommInner {
    link: Arc<CommLink>,
    carrier: Carrier,
    event_tx: mpsc::Sender<Event>,
    max_received_serial: AtomicU64,
    max_ack_serial: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_read: Mutex<Instant>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

// ─── Comm ─────────────────────────────────────────────────────────────────────

/// Snapshot row returned by [`Comm::sessions`].
#[derive(Clone, Copy, Debug)]
pub struct SessionInfo {
    /// Wire identifier.
    pub id: i64,
    /// When the session entered the table.
    pub opened_at: Instant,
}

/// A packet-level endpoint over an authenticated carrier connection.
/// Cheap to clone — internally Arc-wrapped.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<CommInner>,
}

impl Comm {
    /// Take ownership of an authenticated connection and start the sender,
    /// reader and ack-ticker tasks. Returns the Comm handle and the stream
    /// of inbound events.
    pub fn spawn(stream: TcpStream, key: TunnelKey) -> (Self, EventStream) {
        let (send_tx, send_rx) = mpsc::channel(QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
        let (carrier, reader, writer) = Carrier::new(stream);

        let link = Arc::new(CommLink {
            key,
            send_tx,
            serial: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        });
        let inner = Arc::new(CommInner {
            link,
            carrier,
            event_tx,
            max_received_serial: AtomicU64::new(0),
            max_ack_serial: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_read: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(run_sender(inner.clone(), send_rx, writer));
        inner.tasks.spawn(run_reader(inner.clone(), reader));
        inner.tasks.spawn(run_ack_ticker(inner.clone()));
        inner.tasks.close();

        (Self { inner }, EventStream { rx: event_rx })
    }

    /// Register a session.
    ///
    /// With `id <= 0`, a fresh random positive id is chosen, a `Connect`
    /// packet carrying `payload` is queued, and the new handle is returned —
    /// this is the initiating side. With `id > 0` the session is adopted
    /// as-is (the peer chose the id; no `Connect` is emitted); a duplicate
    /// id is rejected.
    pub async fn new_session(&self, id: i64, payload: &[u8]) -> Result<Session, TunnelError> {
        let link = &self.inner.link;
        if id > 0 {
            let mut sessions = link.sessions.lock().unwrap();
            if sessions.contains_key(&id) {
                return Err(TunnelError::Protocol(format!("duplicate session id {id}")));
            }
            sessions.insert(id, SessionRecord { opened_at: Instant::now() });
            return Ok(Session { id, link: link.clone() });
        }

        let (fresh, packet) = {
            let mut sessions = link.sessions.lock().unwrap();
            let fresh = random_session_id(&sessions);
            sessions.insert(fresh, SessionRecord { opened_at: Instant::now() });
            let packet = proto::encode(
                &link.key,
                link.next_serial(),
                fresh,
                PacketType::Connect,
                payload,
            );
            (fresh, packet)
        };
        if link.send_tx.send(packet).await.is_err() {
            link.sessions.lock().unwrap().remove(&fresh);
            return Err(TunnelError::Closed);
        }
        Ok(Session {
            id: fresh,
            link: link.clone(),
        })
    }

    /// Replace the carrier connection.
    ///
    /// Session ids, queued packets and all counters survive; only the socket
    /// changes. The staleness clock restarts so the caller's reconnect
    /// trigger does not immediately re-fire.
    pub fn use_conn(&self, stream: TcpStream) {
        let generation = self.inner.carrier.use_conn(stream);
        *self.inner.last_read.lock().unwrap() = Instant::now();
        log::info!("[comm] carrier replaced (generation {generation})");
    }

    /// Close all sessions and terminate the background tasks.
    pub fn close(&self) {
        self.inner.link.sessions.lock().unwrap().clear();
        self.inner.cancel.cancel();
    }

    /// Wait for the background tasks to finish (after [`Comm::close`], or
    /// after the reader stopped on a protocol error and the sender drained).
    pub async fn join(&self) {
        self.inner.tasks.wait().await;
    }

    // ── Observability ──────────────────────────────────────────────────────

    /// Total packet bytes written to the carrier.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total packet bytes read off the carrier.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// When the reader last completed a non-ack packet.
    pub fn last_read_time(&self) -> Instant {
        *self.inner.last_read.lock().unwrap()
    }

    /// Highest serial the peer reports having received (advisory).
    pub fn max_ack_serial(&self) -> u64 {
        self.inner.max_ack_serial.load(Ordering::Relaxed)
    }

    /// Highest serial received from the peer. Never decreases.
    pub fn max_received_serial(&self) -> u64 {
        self.inner.max_received_serial.load(Ordering::Relaxed)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.link.sessions.lock().unwrap().len()
    }

    /// Snapshot of the session table.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .link
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, rec)| SessionInfo {
                id,
                opened_at: rec.opened_at,
            })
            .collect()
    }
}

impl CommInner {
    fn adopt(&self, id: i64) -> Result<Session, ReadStep> {
        let mut sessions = self.link.sessions.lock().unwrap();
        if sessions.contains_key(&id) {
            return Err(ReadStep::Protocol(format!(
                "connect for already registered session id {id}"
            )));
        }
        sessions.insert(
            id,
            SessionRecord {
                opened_at: Instant::now(),
            },
        );
        Ok(Session {
            id,
            link: self.link.clone(),
        })
    }

    fn lookup(&self, id: i64) -> Result<Session, ReadStep> {
        if self.link.sessions.lock().unwrap().contains_key(&id) {
            Ok(Session {
                id,
                link: self.link.clone(),
            })
        } else {
            Err(ReadStep::Protocol(format!("unregistered session id {id}")))
        }
    }
}

// ─── Sender task ──────────────────────────────────────────────────────────────

async fn run_sender(
    inner: Arc<CommInner>,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    mut writer: CarrierWriter,
) {
    loop {
        let packet = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            next = send_rx.recv() => match next {
                Some(p) => p,
                None => return,
            },
        };
        let delivered = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            res = writer.send(&packet) => res.is_ok(),
        };
        if !delivered {
            return;
        }
        inner
            .bytes_sent
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
    }
}

// ─── Reader task ──────────────────────────────────────────────────────────────

enum ReadStep {
    /// The carrier was swapped mid-parse; restart against the new socket.
    Superseded,
    Io(io::Error),
    /// Wire violation: the reader must stop after reporting it once.
    Protocol(String),
    /// The Comm is shutting down.
    Closed,
}

impl From<ReadInterrupt> for ReadStep {
    fn from(i: ReadInterrupt) -> Self {
        match i {
            ReadInterrupt::Superseded => Self::Superseded,
            ReadInterrupt::Io(e) => Self::Io(e),
            ReadInterrupt::Closed => Self::Closed,
        }
    }
}

async fn run_reader(inner: Arc<CommInner>, mut reader: CarrierReader) {
    loop {
        let step = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            res = read_packet(&inner, &mut reader) => res,
        };
        match step {
            Ok(()) => {}
            Err(ReadStep::Superseded) => {
                log::debug!("[comm] reader moving to fresh carrier");
            }
            Err(ReadStep::Io(e)) => {
                log::debug!("[comm] carrier read failed ({e}), waiting for replacement");
                let replaced = tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    ok = reader.wait_replacement() => ok,
                };
                if !replaced {
                    return;
                }
            }
            Err(ReadStep::Protocol(reason)) => {
                log::error!("[comm] {reason}");
                let _ = inner.event_tx.send(Event::Error { reason }).await;
                return;
            }
            Err(ReadStep::Closed) => return,
        }
    }
}

/// Parse and dispatch exactly one packet.
async fn read_packet(inner: &CommInner, reader: &mut CarrierReader) -> Result<(), ReadStep> {
    let mut head = [0u8; HEADER_LEN];
    reader.read_exact(&mut head).await?;
    let header = Header::decode(&head);

    if header.type_byte == PacketType::Ack as u8 {
        inner
            .max_ack_serial
            .fetch_max(header.serial, Ordering::Relaxed);
        inner
            .bytes_received
            .fetch_add(HEADER_LEN as u64, Ordering::Relaxed);
        return Ok(());
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ReadStep::Protocol(format!(
            "implausible payload length {payload_len}"
        )));
    }
    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;
    inner.link.key.decrypt_payload(&mut payload);

    inner
        .max_received_serial
        .fetch_max(header.serial, Ordering::Relaxed);
    inner
        .bytes_received
        .fetch_add((HEADER_LEN + 4) as u64 + u64::from(payload_len), Ordering::Relaxed);
    *inner.last_read.lock().unwrap() = Instant::now();

    let event = match header.packet_type() {
        Some(PacketType::Connect) => {
            let session = inner.adopt(header.session_id)?;
            Event::Session { session, payload }
        }
        Some(PacketType::Data) => Event::Data {
            session: inner.lookup(header.session_id)?,
            payload,
        },
        Some(PacketType::Signal) => {
            let code = *payload.first().ok_or_else(|| {
                ReadStep::Protocol(format!(
                    "empty signal payload on session {}",
                    header.session_id
                ))
            })?;
            Event::Signal {
                session: inner.lookup(header.session_id)?,
                code,
            }
        }
        // Ack was intercepted above, before the payload read; any other
        // type byte is garbage.
        _ => {
            return Err(ReadStep::Protocol(format!(
                "unrecognized packet type {:#04x}",
                header.type_byte
            )))
        }
    };
    if inner.event_tx.send(event).await.is_err() {
        return Err(ReadStep::Closed);
    }
    Ok(())
}

// ─── Ack ticker ───────────────────────────────────────────────────────────────

async fn run_ack_ticker(inner: Arc<CommInner>) {
    let mut ticker = tokio::time::interval(ACK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_acked = 0u64;
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let received = inner.max_received_serial.load(Ordering::Relaxed);
        if received == last_acked {
            continue;
        }
        let packet = proto::encode_ack(received, random_i64());
        if inner.link.send_tx.send(packet).await.is_err() {
            return;
        }
        last_acked = received;
    }
}

// ─── Randomness ───────────────────────────────────────────────────────────────

/// A uniform random i64 from the OS (commIds, ack filler ids).
pub fn random_i64() -> i64 {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).expect("getrandom");
    i64::from_le_bytes(b)
}

/// A fresh random positive session id not present in `taken`.
fn random_session_id(taken: &HashMap<i64, SessionRecord>) -> i64 {
    loop {
        let mut b = [0u8; 8];
        getrandom::getrandom(&mut b).expect("getrandom");
        let id = (u64::from_le_bytes(b) >> 1) as i64;
        if id > 0 && !taken.contains_key(&id) {
            return id;
        }
    }
}
