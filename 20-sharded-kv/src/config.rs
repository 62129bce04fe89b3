use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;

use anyhow::{Context, Result};

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 12345;

/// Startup parameters of a server.
///
/// Shard counts are fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_clients: NonZeroUsize,
    pub database_shards: NonZeroUsize,
    pub user_shards: NonZeroUsize,
}

impl ServerConfig {
    /// Validates the three numeric parameters; each must be positive.
    pub fn new(max_clients: usize, database_shards: usize, user_shards: usize) -> Result<Self> {
        Ok(Self {
            listen: default_listen(),
            max_clients: positive("max clients", max_clients)?,
            database_shards: positive("database shards", database_shards)?,
            user_shards: positive("user shards", user_shards)?,
        })
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_clients: NonZeroUsize::MIN.saturating_add(9),
            database_shards: NonZeroUsize::MIN.saturating_add(39),
            user_shards: NonZeroUsize::MIN,
        }
    }
}

pub fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

fn positive(name: &str, value: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).with_context(|| format!("{name} must be a positive integer, got {value}"))
}
