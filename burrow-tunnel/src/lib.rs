//! # burrow-tunnel
//!
//! The multiplexed session transport behind the burrow tunnel: many
//! independent byte streams over a single long-lived, encrypted TCP carrier
//! that can be replaced under traffic without losing session state.
//!
//! | Module | Role |
//! |--------------|-----------------------------------------------------|
//! | [`comm`] | Packet endpoint: sender/reader/ack tasks, session table |
//! | [`session`] | Per-stream handles: `send` / `signal` / `close` |
//! | `carrier` | Swappable carrier socket (crate-private) |
//! | [`handshake`]| Challenge/proof auth + commId exchange |
//! | [`reader`] | Pooled reading of application sockets |
//! | [`config`] | `~/.burrow.conf` key/value document |
//!
//! The endpoints (`burrow-local`, `burrow-remote`) drive all of this from a
//! single select loop each; see those crates for the session state machines.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod carrier;
pub mod comm;
pub mod config;
mod errors;
pub mod event;
pub mod handshake;
pub mod reader;
pub mod session;

pub use comm::{random_i64, Comm, SessionInfo, ACK_INTERVAL};
pub use config::Config;
pub use errors::TunnelError;
pub use event::{Event, EventStream};
pub use session::Session;

// The endpoints speak in terms of the wire constants as well.
pub use burrow_crypto::TunnelKey;
pub use burrow_proto::{signal, KEEPALIVE_MAGIC};
