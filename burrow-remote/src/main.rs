//! burrow-remote — the tunnel exit endpoint.
//!
//! Accepts carrier connections, authenticates them, and either binds each to
//! a fresh Comm or — when the commId is already known — hands the socket to
//! the existing Comm so the initiator's sessions survive the reconnect. Per
//! session it dials the requested target and relays bytes both ways.
//!
//! Configuration lives in `~/.burrow.conf` (`listen`, `key`).
//! Logging: `RUST_LOG=burrow_remote=info,burrow_tunnel=info burrow-remote`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use burrow_tunnel::reader::{SocketEvent, SocketReader};
use burrow_tunnel::{
    handshake, signal, Comm, Config, Event, Session, TunnelError, TunnelKey, KEEPALIVE_MAGIC,
};

const DEFAULTS: &[(&str, &str)] = &[
    ("listen", "0.0.0.0:34567"),
    ("key", "foo bar baz foo bar baz "),
];

/// A Comm whose carrier has been silent this long is torn down; the
/// initiator is responsible for reconnecting.
const SILENCE_TEARDOWN: Duration = Duration::from_secs(300);
/// Ceiling on one target dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Drain window between the peer's close signal and closing the target
/// socket.
const CLOSE_DRAIN: Duration = Duration::from_secs(3);
/// A session stuck half-closed is force-closed after this.
const CLOSE_FALLBACK: Duration = Duration::from_secs(180);

/// Comms currently being served, keyed by commId, each reachable through
/// its carrier-replacement channel.
type Registry = Arc<tokio::sync::Mutex<HashMap<i64, mpsc::Sender<TcpStream>>>>;

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        log::error!("[remote] fatal: {e}");
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(DEFAULTS)?;
    let listen = config.get("listen").unwrap_or_default().to_string();
    let key = TunnelKey::from_secret(config.get("key").unwrap_or_default().as_bytes())?;

    let listener = TcpListener::bind(&listen).await?;
    log::info!(
        "[remote] listening on {listen} (config {})",
        config.path().display()
    );

    let registry: Registry = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[remote] accept failed: {e}");
                continue;
            }
        };
        tokio::spawn(handle_incoming(stream, peer, key.clone(), registry.clone()));
    }
}

/// Authenticate one incoming socket, then rebind it or start a new Comm.
async fn handle_incoming(mut stream: TcpStream, peer: SocketAddr, key: TunnelKey, registry: Registry) {
    let comm_id = match timeout(
        handshake::HANDSHAKE_TIMEOUT,
        handshake::accept(&mut stream, &key),
    )
    .await
    {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            log::info!("[remote] {peer} rejected: {e}");
            return;
        }
        Err(_) => {
            log::debug!("[remote] {peer} handshake timed out");
            return;
        }
    };

    let mut reg = registry.lock().await;
    let stale = match reg.get(&comm_id) {
        Some(tx) => match tx.try_send(stream) {
            Ok(()) => {
                log::info!("[remote] {peer} rebound to comm {comm_id:#018x}");
                return;
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("[remote] comm {comm_id:#018x} swap queue full, dropping {peer}");
                return;
            }
            Err(TrySendError::Closed(returned)) => {
                stream = returned;
                true
            }
        },
        None => false,
    };
    if stale {
        reg.remove(&comm_id);
    }

    let (tx, rx) = mpsc::channel(4);
    reg.insert(comm_id, tx);
    drop(reg);

    log::info!("[remote] {peer} opened comm {comm_id:#018x}");
    serve_comm(stream, rx, key).await;
    registry.lock().await.remove(&comm_id);
    log::info!("[remote] comm {comm_id:#018x} released");
}

/// Supervisor-side state for one session bound to one dialled target.
struct Serv {
    session: Session,
    host_port: String,
    /// Write half of the target socket; `None` until the dial completes.
    target: Option<OwnedWriteHalf>,
    target_abort: Option<AbortHandle>,
    /// Data received before the dial completed, flushed on success.
    pending: Vec<Vec<u8>>,
    local_closed: bool,
    remote_closed: bool,
}

enum Delayed {
    CloseSocket(i64),
    DropSession(i64),
}

/// Drive one Comm until its carrier stays silent, its peer breaks protocol,
/// or its event stream ends.
async fn serve_comm(stream: TcpStream, mut conn_rx: mpsc::Receiver<TcpStream>, key: TunnelKey) {
    let (comm, mut events) = Comm::spawn(stream, key);
    let (reader, mut target_events) = SocketReader::new(4096);
    let (dial_tx, mut dial_rx) = mpsc::channel::<(i64, io::Result<TcpStream>)>(256);
    let (delay_tx, mut delay_rx) = mpsc::unbounded_channel();
    let mut servs: HashMap<i64, Serv> = HashMap::new();

    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // ── Carrier replacement after a reconnect ──────────────────────
            Some(conn) = conn_rx.recv() => comm.use_conn(conn),

            // ── Tunnel events ──────────────────────────────────────────────
            maybe = events.next() => match maybe {
                None => break,
                Some(Event::Session { session, payload }) => {
                    if payload == KEEPALIVE_MAGIC {
                        log::debug!("[remote] keepalive session {}", session.id());
                        continue;
                    }
                    let host_port = String::from_utf8_lossy(&payload).into_owned();
                    let id = session.id();
                    log::info!("[remote] session {id} → {host_port}");
                    servs.insert(id, Serv {
                        session,
                        host_port: host_port.clone(),
                        target: None,
                        target_abort: None,
                        pending: Vec::new(),
                        local_closed: false,
                        remote_closed: false,
                    });
                    let tx = dial_tx.clone();
                    tokio::spawn(async move {
                        let result = match timeout(DIAL_TIMEOUT, TcpStream::connect(&host_port)).await {
                            Ok(res) => res,
                            Err(_) => Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "target dial timed out",
                            )),
                        };
                        let _ = tx.send((id, result)).await;
                    });
                }
                Some(Event::Data { session, payload }) => {
                    let id = session.id();
                    let mut broken = false;
                    if let Some(serv) = servs.get_mut(&id) {
                        match serv.target.as_mut() {
                            Some(writer) => broken = writer.write_all(&payload).await.is_err(),
                            // Dial still in flight: hold the bytes in order.
                            None => serv.pending.push(payload),
                        }
                    }
                    if broken && on_target_gone(&mut servs, id, &delay_tx).await.is_err() {
                        break;
                    }
                }
                Some(Event::Signal { session, code }) => match code {
                    signal::CLOSE => {
                        let id = session.id();
                        if let Some(serv) = servs.get_mut(&id) {
                            serv.remote_closed = true;
                            schedule(&delay_tx, CLOSE_DRAIN, Delayed::CloseSocket(id));
                            if serv.local_closed {
                                drop_serv(&mut servs, id);
                            } else {
                                schedule(&delay_tx, CLOSE_FALLBACK, Delayed::DropSession(id));
                            }
                        }
                    }
                    // Echo on whichever session the ping arrived on.
                    signal::PING => {
                        if session.signal(signal::PING).await.is_err() {
                            break;
                        }
                    }
                    other => log::warn!(
                        "[remote] unknown signal {other:#04x} on session {}",
                        session.id()
                    ),
                },
                Some(Event::Error { reason }) => {
                    log::error!("[remote] tunnel protocol error: {reason}");
                    break;
                }
            },

            // ── Dial results ───────────────────────────────────────────────
            Some((id, result)) = dial_rx.recv() => {
                let Some(serv) = servs.get_mut(&id) else {
                    // Session closed while the dial was in flight.
                    continue;
                };
                match result {
                    Ok(target) => {
                        log::debug!("[remote] session {id} connected to {}", serv.host_port);
                        let (rd, mut wr) = target.into_split();
                        let mut broken = false;
                        for chunk in serv.pending.drain(..) {
                            if wr.write_all(&chunk).await.is_err() {
                                broken = true;
                                break;
                            }
                        }
                        serv.target_abort = Some(reader.add(rd, id));
                        serv.target = Some(wr);
                        if broken && on_target_gone(&mut servs, id, &delay_tx).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::info!("[remote] session {id} dial {} failed: {e}", serv.host_port);
                        if on_target_gone(&mut servs, id, &delay_tx).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // ── Target socket events ───────────────────────────────────────
            Some(ev) = target_events.recv() => match ev {
                SocketEvent::Data(id, bytes) => {
                    if let Some(serv) = servs.get(&id) {
                        if serv.session.send(&bytes).await.is_err() {
                            break;
                        }
                    }
                }
                SocketEvent::Eof(id) => {
                    if on_target_gone(&mut servs, id, &delay_tx).await.is_err() {
                        break;
                    }
                }
                SocketEvent::Error(id, e) => {
                    log::debug!("[remote] target socket {id}: {e}");
                    if on_target_gone(&mut servs, id, &delay_tx).await.is_err() {
                        break;
                    }
                }
            },

            // ── Scheduled actions ──────────────────────────────────────────
            Some(action) = delay_rx.recv() => match action {
                Delayed::CloseSocket(id) => {
                    let mut announce = false;
                    if let Some(serv) = servs.get_mut(&id) {
                        if let Some(abort) = serv.target_abort.take() {
                            abort.abort();
                        }
                        if let Some(writer) = serv.target.as_mut() {
                            let _ = writer.shutdown().await;
                        }
                        if !serv.local_closed {
                            serv.local_closed = true;
                            announce = true;
                        }
                    }
                    if announce {
                        if let Some(serv) = servs.get(&id) {
                            if serv.session.signal(signal::CLOSE).await.is_err() {
                                break;
                            }
                        }
                    }
                    if servs.get(&id).is_some_and(|s| s.local_closed && s.remote_closed) {
                        drop_serv(&mut servs, id);
                    }
                }
                Delayed::DropSession(id) => drop_serv(&mut servs, id),
            },

            // ── Silence check / status ─────────────────────────────────────
            _ = heartbeat.tick() => {
                if comm.last_read_time().elapsed() > SILENCE_TEARDOWN {
                    log::warn!("[remote] carrier silent beyond {SILENCE_TEARDOWN:?}, tearing down");
                    break;
                }
                log::debug!(
                    "[remote] {} sessions, {} target sockets, {} B in / {} B out",
                    comm.session_count(),
                    reader.live(),
                    comm.bytes_received(),
                    comm.bytes_sent(),
                );
            }
        }
    }

    // Teardown: release every target socket and the Comm itself. The
    // initiator re-establishes and gets a fresh Comm if it still cares.
    for (_, serv) in servs.drain() {
        if let Some(abort) = serv.target_abort {
            abort.abort();
        }
        serv.session.close();
    }
    comm.close();
}

/// The target side of a session ended (EOF, error, failed flush, or a
/// failed dial): announce close and finish the state machine.
async fn on_target_gone(
    servs: &mut HashMap<i64, Serv>,
    id: i64,
    delay_tx: &mpsc::UnboundedSender<Delayed>,
) -> Result<(), TunnelError> {
    let Some(serv) = servs.get_mut(&id) else {
        return Ok(());
    };
    if !serv.local_closed {
        serv.local_closed = true;
        serv.session.signal(signal::CLOSE).await?;
    }
    if serv.remote_closed {
        drop_serv(servs, id);
    } else {
        schedule(delay_tx, CLOSE_FALLBACK, Delayed::DropSession(id));
    }
    Ok(())
}

fn drop_serv(servs: &mut HashMap<i64, Serv>, id: i64) {
    if let Some(serv) = servs.remove(&id) {
        if let Some(abort) = serv.target_abort {
            abort.abort();
        }
        serv.session.close();
        log::info!("[remote] session {id} ({}) closed", serv.host_port);
    }
}

fn schedule(tx: &mpsc::UnboundedSender<Delayed>, after: Duration, action: Delayed) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(action);
    });
}
