//! burrow-local — the tunnel entry endpoint.
//!
//! Exposes a SOCKS5 CONNECT proxy and forwards every accepted client as one
//! session over a single encrypted carrier to the remote endpoint. The
//! carrier is re-established transparently when it goes silent; sessions
//! survive the swap.
//!
//! Configuration lives in `~/.burrow.conf` (`local`, `remote`, `key`).
//! Logging: `RUST_LOG=burrow_local=info,burrow_tunnel=info burrow-local`.

mod socks;

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use burrow_tunnel::reader::{SocketEvent, SocketReader};
use burrow_tunnel::{
    handshake, random_i64, signal, Comm, Config, Event, EventStream, Session, TunnelError,
    TunnelKey, KEEPALIVE_MAGIC,
};

use socks::SocksClient;

const DEFAULTS: &[(&str, &str)] = &[
    ("local", "127.0.0.1:23456"),
    ("remote", "127.0.0.1:34567"),
    ("key", "foo bar baz foo bar baz "),
];

/// Carrier silence beyond this triggers a reconnect.
const BAD_CONN_THRESHOLD: Duration = Duration::from_secs(10);
/// Keepalive ping cadence; keeps `last_read_time` fresh on an idle tunnel.
/// Must stay well under [`BAD_CONN_THRESHOLD`].
const PING_INTERVAL: Duration = Duration::from_secs(2);
/// Drain window between the peer's close signal and closing the client
/// socket, so buffered data still reaches the client.
const CLOSE_DRAIN: Duration = Duration::from_secs(3);
/// A session stuck half-closed is force-closed after this.
const CLOSE_FALLBACK: Duration = Duration::from_secs(180);

/// Supervisor-side state for one SOCKS client bound to one session.
struct ClientState {
    session: Session,
    writer: OwnedWriteHalf,
    read_abort: AbortHandle,
    host_port: String,
    /// Our side of the stream has ended (client EOF/error or drain expiry).
    local_closed: bool,
    /// The peer signalled close for its side.
    remote_closed: bool,
}

/// Actions the supervisor schedules for itself; the timer tasks only post
/// messages so that all state mutation stays on the supervisor loop.
enum Delayed {
    CloseSocket(i64),
    DropSession(i64),
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        log::error!("[local] fatal: {e}");
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(DEFAULTS)?;
    let local_addr = config.get("local").unwrap_or_default().to_string();
    let remote_addr = config.get("remote").unwrap_or_default().to_string();
    let key = TunnelKey::from_secret(config.get("key").unwrap_or_default().as_bytes())?;

    let listener = TcpListener::bind(&local_addr).await?;
    log::info!(
        "[local] SOCKS5 listening on {local_addr} (config {})",
        config.path().display()
    );

    let comm_id = random_i64();
    let stream = handshake::connect(&remote_addr, &key, comm_id).await?;
    log::info!("[local] carrier established to {remote_addr}");
    let (comm, events) = Comm::spawn(stream, key.clone());

    // The keepalive session exists for the life of the Comm; its pings keep
    // the staleness clock honest on an otherwise idle tunnel.
    let keepalive = comm.new_session(-1, KEEPALIVE_MAGIC).await?;

    let (clients_tx, clients_rx) = mpsc::channel(256);
    tokio::spawn(socks::serve(listener, clients_tx));

    supervise(comm, events, keepalive, clients_rx, remote_addr, key, comm_id).await
}

async fn supervise(
    comm: Comm,
    mut events: EventStream,
    keepalive: Session,
    mut clients_rx: mpsc::Receiver<SocksClient>,
    remote_addr: String,
    key: TunnelKey,
    comm_id: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut client_events) = SocketReader::new(4096);
    let (delay_tx, mut delay_rx) = mpsc::unbounded_channel();
    let mut clients: HashMap<i64, ClientState> = HashMap::new();

    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // ── New SOCKS client ───────────────────────────────────────────
            Some(client) = clients_rx.recv() => {
                let session = comm.new_session(-1, client.host_port.as_bytes()).await?;
                let (rd, wr) = client.stream.into_split();
                let read_abort = reader.add(rd, session.id());
                log::info!("[local] session {} → {}", session.id(), client.host_port);
                clients.insert(session.id(), ClientState {
                    session,
                    writer: wr,
                    read_abort,
                    host_port: client.host_port,
                    local_closed: false,
                    remote_closed: false,
                });
            }

            // ── Client socket events ───────────────────────────────────────
            Some(ev) = client_events.recv() => match ev {
                SocketEvent::Data(id, bytes) => {
                    // Events for an id we already dropped are late stragglers.
                    if let Some(state) = clients.get(&id) {
                        state.session.send(&bytes).await?;
                    }
                }
                SocketEvent::Eof(id) => on_client_gone(&mut clients, id, &delay_tx).await?,
                SocketEvent::Error(id, e) => {
                    log::debug!("[local] client socket {id}: {e}");
                    on_client_gone(&mut clients, id, &delay_tx).await?;
                }
            },

            // ── Tunnel events ──────────────────────────────────────────────
            maybe = events.next() => match maybe {
                None => return Err("tunnel event stream ended".into()),
                Some(Event::Session { session, .. }) => {
                    return Err(format!(
                        "peer opened session {} towards the entry endpoint",
                        session.id()
                    ).into());
                }
                Some(Event::Data { session, payload }) => {
                    let id = session.id();
                    let broken = match clients.get_mut(&id) {
                        Some(state) => state.writer.write_all(&payload).await.is_err(),
                        None => false,
                    };
                    if broken {
                        on_client_gone(&mut clients, id, &delay_tx).await?;
                    }
                }
                Some(Event::Signal { session, code }) => match code {
                    signal::CLOSE => {
                        let id = session.id();
                        if let Some(state) = clients.get_mut(&id) {
                            state.remote_closed = true;
                            schedule(&delay_tx, CLOSE_DRAIN, Delayed::CloseSocket(id));
                            if state.local_closed {
                                drop_client(&mut clients, id);
                            } else {
                                schedule(&delay_tx, CLOSE_FALLBACK, Delayed::DropSession(id));
                            }
                        }
                    }
                    signal::PING => log::trace!("[local] keepalive pong"),
                    other => log::warn!(
                        "[local] unknown signal {other:#04x} on session {}",
                        session.id()
                    ),
                },
                Some(Event::Error { reason }) => {
                    return Err(format!("tunnel protocol error: {reason}").into());
                }
            },

            // ── Scheduled actions ──────────────────────────────────────────
            Some(action) = delay_rx.recv() => match action {
                Delayed::CloseSocket(id) => {
                    // Drain window after a peer close is over: take the
                    // client socket down and finish our half of the close.
                    let mut announce = false;
                    if let Some(state) = clients.get_mut(&id) {
                        state.read_abort.abort();
                        let _ = state.writer.shutdown().await;
                        if !state.local_closed {
                            state.local_closed = true;
                            announce = true;
                        }
                    }
                    if announce {
                        if let Some(state) = clients.get(&id) {
                            state.session.signal(signal::CLOSE).await?;
                        }
                    }
                    if clients.get(&id).is_some_and(|s| s.local_closed && s.remote_closed) {
                        drop_client(&mut clients, id);
                    }
                }
                Delayed::DropSession(id) => drop_client(&mut clients, id),
            },

            // ── Staleness check / status ───────────────────────────────────
            _ = heartbeat.tick() => {
                if comm.last_read_time().elapsed() > BAD_CONN_THRESHOLD {
                    log::warn!("[local] carrier silent beyond {BAD_CONN_THRESHOLD:?}, reconnecting");
                    match handshake::connect(&remote_addr, &key, comm_id).await {
                        Ok(stream) => comm.use_conn(stream),
                        Err(e) => log::warn!("[local] reconnect failed: {e}"),
                    }
                }
                log::debug!(
                    "[local] {} sessions, {} client sockets, {} B in / {} B out",
                    comm.session_count(),
                    reader.live(),
                    comm.bytes_received(),
                    comm.bytes_sent(),
                );
            }

            // ── Keepalive ──────────────────────────────────────────────────
            _ = ping.tick() => keepalive.signal(signal::PING).await?,
        }
    }
}

/// The client socket ended (EOF, error, or a failed relay write).
async fn on_client_gone(
    clients: &mut HashMap<i64, ClientState>,
    id: i64,
    delay_tx: &mpsc::UnboundedSender<Delayed>,
) -> Result<(), TunnelError> {
    let Some(state) = clients.get_mut(&id) else {
        return Ok(());
    };
    if !state.local_closed {
        state.local_closed = true;
        state.session.signal(signal::CLOSE).await?;
    }
    if state.remote_closed {
        drop_client(clients, id);
    } else {
        schedule(delay_tx, CLOSE_FALLBACK, Delayed::DropSession(id));
    }
    Ok(())
}

fn drop_client(clients: &mut HashMap<i64, ClientState>, id: i64) {
    if let Some(state) = clients.remove(&id) {
        state.read_abort.abort();
        state.session.close();
        log::info!("[local] session {id} ({}) closed", state.host_port);
    }
}

fn schedule(tx: &mpsc::UnboundedSender<Delayed>, after: Duration, action: Delayed) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(action);
    });
}
