//! Listener and accept loop.
//!
//! One thread accepts connections and every admitted connection gets its own
//! session thread. Before each accept the loop waits for admission capacity,
//! so with `max_clients` sessions alive a new connection waits in the listen
//! backlog until one of them ends.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionGate, Permit};
use crate::config::ServerConfig;
use crate::connection::TaggedConnection;
use crate::session::{Session, SessionId, SessionRegistry};
use crate::store::ShardedStore;

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    store: Arc<ShardedStore>,
    gate: Arc<AdmissionGate>,
    sessions: Arc<SessionRegistry>,
    stopping: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self {
            listener,
            store: Arc::new(ShardedStore::new(
                config.database_shards,
                config.user_shards,
            )),
            gate: AdmissionGate::new(config.max_clients),
            sessions: Arc::new(SessionRegistry::default()),
            stopping: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Arc<ShardedStore> {
        Arc::clone(&self.store)
    }

    /// Runs the accept loop on the current thread until shutdown.
    pub fn run(self) -> Result<()> {
        info!(
            max_clients = self.config.max_clients.get(),
            database_shards = self.config.database_shards.get(),
            user_shards = self.config.user_shards.get(),
            "accepting clients"
        );

        loop {
            if !self.gate.wait_for_capacity() || self.stopping.load(Ordering::Acquire) {
                break;
            }

            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = ?err, "failed to accept connection");
                    continue;
                }
            };
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            // Only this thread admits, so the slot seen above is still free.
            let Some(permit) = self.gate.try_admit() else {
                break;
            };
            self.spawn_session(stream, peer, permit);
        }

        info!("accept loop stopped");
        Ok(())
    }

    /// Runs the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let store = Arc::clone(&self.store);
        let gate = Arc::clone(&self.gate);
        let sessions = Arc::clone(&self.sessions);
        let stopping = Arc::clone(&self.stopping);

        let thread = thread::Builder::new()
            .name(format!("kv-accept-{addr}"))
            .spawn(move || self.run())
            .context("failed to spawn accept loop")?;

        Ok(ServerHandle {
            addr,
            store,
            gate,
            sessions,
            stopping,
            thread: Some(thread),
        })
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, permit: Permit) {
        let id: SessionId = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = TaggedConnection::new(stream)
            .context("failed to configure socket")
            .and_then(|conn| {
                Session::new(
                    id,
                    conn,
                    Arc::clone(&self.store),
                    Arc::clone(&self.sessions),
                    permit,
                )
            });

        let session = match session {
            Ok(session) => session,
            Err(err) => {
                warn!(%peer, error = ?err, "dropping connection");
                return;
            }
        };

        // Registered before the flag check so a concurrent shutdown either
        // sees the connection in close_all or is seen here.
        self.sessions.insert(id, Arc::clone(session.connection()));
        if self.stopping.load(Ordering::Acquire) {
            debug!(%peer, session = id, "shutting down, dropping connection");
            self.sessions.remove(id);
            return;
        }

        if let Err(err) = thread::Builder::new()
            .name(format!("kv-session-{id}"))
            .spawn(move || session.run())
        {
            warn!(%peer, error = ?err, "failed to spawn session thread");
            self.sessions.remove(id);
        }
    }
}

/// Controls a server started with [`Server::spawn`].
pub struct ServerHandle {
    addr: SocketAddr,
    store: Arc<ShardedStore>,
    gate: Arc<AdmissionGate>,
    sessions: Arc<SessionRegistry>,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> Arc<ShardedStore> {
        Arc::clone(&self.store)
    }

    /// Sessions currently holding an admission slot.
    pub fn active_sessions(&self) -> usize {
        self.gate.active()
    }

    /// Stops accepting, closes every live session and joins the accept loop.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.stopping.store(true, Ordering::Release);
        self.gate.close();
        // Unblocks a pending accept; the loop sees the flag and exits.
        if let Err(err) = TcpStream::connect(self.addr) {
            warn!(addr = %self.addr, error = %err, "failed to wake accept loop");
        }
        info!(live = self.sessions.len(), "closing sessions");
        self.sessions.close_all();

        thread
            .join()
            .map_err(|_| anyhow!("accept loop panicked"))?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = ?err, "server shutdown failed");
        }
    }
}
