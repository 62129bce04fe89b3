use std::net::SocketAddr;
use std::num::NonZeroUsize;

use clap::{Args, Parser, Subcommand};

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the key-value server.
    Server(ServerArgs),
    /// Connect to a server and issue commands interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Maximum number of clients served at the same time.
    pub max_clients: NonZeroUsize,

    /// Number of partitions of the value store.
    pub database_shards: NonZeroUsize,

    /// Number of partitions of the user store.
    pub user_shards: NonZeroUsize,

    /// Socket address the server should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            max_clients: self.max_clients,
            database_shards: self.database_shards,
            user_shards: self.user_shards,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,
}
