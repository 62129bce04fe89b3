//! In-memory sharded key-value server with a tagged binary protocol.
//!
//! Many logical request/response exchanges share one TCP connection: each
//! frame carries a tag, and a background reader on either side routes frames
//! to whoever is waiting on that tag. Each module focuses on one layer:
//!
//! - [`frame`] and [`message`] define the wire format and request payloads.
//! - [`connection`] serializes whole frames over one socket.
//! - [`demux`] routes inbound frames to per-tag queues.
//! - [`store`] holds the sharded value and user maps, including the
//!   blocking conditional read.
//! - [`admission`], [`session`] and [`server`] accept clients, bound how
//!   many are served at once and run one session thread per connection.
//! - [`client`] is the blocking facade used by applications and by the
//!   [`console`].
//!
//! Integration tests drive a real server over loopback through this crate.

pub mod admission;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod demux;
pub mod error;
pub mod frame;
pub mod message;
pub mod server;
pub mod session;
pub mod store;

pub use client::Client;
pub use config::ServerConfig;
pub use server::{Server, ServerHandle};
pub use store::ShardedStore;
