use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use sharded_kv::{
    cli::{Cli, Command},
    console,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = Server::bind(args.config())?;
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run() {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => console::run(args)?,
    }

    Ok(())
}
