//! Pooled reading of application sockets.
//!
//! Each supervisor owns many plain TCP sockets (SOCKS clients on the local
//! side, dialled targets on the remote side). A [`SocketReader`] spawns one
//! small task per socket read-half and funnels everything that happens into
//! a single event channel, tagged so the supervisor can correlate events
//! with its per-session state without sharing any of it.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Bytes read from a socket in one chunk — and so the largest `Data`
/// payload a session emits.
pub const READ_CHUNK: usize = 1280;

/// What happened on one pooled socket.
pub enum SocketEvent<T> {
    /// Bytes arrived.
    Data(T, Vec<u8>),
    /// The peer closed its side.
    Eof(T),
    /// The socket failed.
    Error(T, io::Error),
}

/// Spawns and tracks the per-socket read tasks.
pub struct SocketReader<T> {
    tx: mpsc::Sender<SocketEvent<T>>,
    live: Arc<AtomicUsize>,
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<T: Clone + Send + 'static> SocketReader<T> {
    /// Create a pool whose events arrive on the returned receiver.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<SocketEvent<T>>) {
        let (tx, rx) = mpsc::channel(depth);
        (
            Self {
                tx,
                live: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Start reading `half`, tagging every event with `tag`.
    ///
    /// The returned handle aborts the read task, which is how a supervisor
    /// hard-closes a socket it no longer wants to hear from.
    pub fn add(&self, mut half: OwnedReadHalf, tag: T) -> AbortHandle {
        let tx = self.tx.clone();
        self.live.fetch_add(1, Ordering::Relaxed);
        let guard = LiveGuard(self.live.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx.send(SocketEvent::Eof(tag)).await;
                        return;
                    }
                    Ok(n) => {
                        if tx
                            .send(SocketEvent::Data(tag.clone(), buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(SocketEvent::Error(tag, e)).await;
                        return;
                    }
                }
            }
        });
        task.abort_handle()
    }

    /// Number of sockets currently being read.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}
