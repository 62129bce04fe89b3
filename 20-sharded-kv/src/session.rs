//! Per-connection request loop on the server.
//!
//! A session reads requests in arrival order, runs each against the store and
//! answers on the request's tag. `Put` and `MultiPut` are fire-and-forget and
//! get no answer. `Disconnect` is acknowledged and ends the session. Unknown
//! kinds are logged and skipped.
//!
//! `GetWhen` can wait indefinitely, so it runs on a helper thread and the loop
//! keeps serving the connection, including the write that may satisfy it.
//! When the session ends, outstanding conditional reads are cancelled and
//! joined before the socket and the admission slot are released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::admission::Permit;
use crate::connection::TaggedConnection;
use crate::demux::Demultiplexer;
use crate::error::{ConnectionError, StoreError};
use crate::frame::{Frame, RequestKind};
use crate::message::{Request, Response};
use crate::store::{CancelFlag, ShardedStore};

pub type SessionId = u64;

/// Connections of live sessions, so shutdown can close them.
#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<HashMap<SessionId, Arc<TaggedConnection>>>,
}

impl SessionRegistry {
    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn insert(&self, id: SessionId, conn: Arc<TaggedConnection>) {
        self.live.lock().insert(id, conn);
    }

    pub(crate) fn remove(&self, id: SessionId) {
        self.live.lock().remove(&id);
    }

    /// Closes every live connection; each session then winds down on its own thread.
    pub fn close_all(&self) {
        let live: Vec<_> = self.live.lock().values().cloned().collect();
        for conn in live {
            conn.close();
        }
    }
}

enum Step {
    Continue,
    Finish,
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    demux: Arc<Demultiplexer>,
    store: Arc<ShardedStore>,
    registry: Arc<SessionRegistry>,
    cancel: CancelFlag,
    waiters: Vec<JoinHandle<()>>,
    permit: Permit,
}

impl Session {
    pub fn new(
        id: SessionId,
        conn: TaggedConnection,
        store: Arc<ShardedStore>,
        registry: Arc<SessionRegistry>,
        permit: Permit,
    ) -> Result<Self> {
        let conn = Arc::new(conn);
        let peer = conn.peer_addr();
        let demux = Demultiplexer::serving(conn).context("failed to start session reader")?;

        Ok(Self {
            id,
            peer,
            demux: Arc::new(demux),
            store,
            registry,
            cancel: CancelFlag::new(),
            waiters: Vec::new(),
            permit,
        })
    }

    pub fn connection(&self) -> &Arc<TaggedConnection> {
        self.demux.connection()
    }

    /// Serves the connection until it disconnects or fails.
    ///
    /// The caller registers the connection with the [`SessionRegistry`]
    /// first; the session removes it when it ends.
    pub fn run(mut self) {
        info!(session = self.id, peer = ?self.peer, active = self.permit.active(), "session started");

        loop {
            let frame = match self.demux.next_frame() {
                Ok(frame) => frame,
                Err(ConnectionError::Closed) => {
                    debug!(session = self.id, "peer went away");
                    break;
                }
                Err(err) => {
                    warn!(session = self.id, error = %err, "transport error");
                    break;
                }
            };

            match self.dispatch(frame) {
                Ok(Step::Continue) => {}
                Ok(Step::Finish) => break,
                Err(err) => {
                    warn!(session = self.id, error = ?err, "ending session");
                    break;
                }
            }
        }

        self.terminate();
    }

    fn dispatch(&mut self, frame: Frame) -> Result<Step> {
        let Frame { tag, kind, payload } = frame;
        let kind = match RequestKind::try_from(kind) {
            Ok(kind) => kind,
            Err(err) => {
                warn!(session = self.id, tag, error = %err, "ignoring request");
                return Ok(Step::Continue);
            }
        };
        let request = Request::decode(kind, &payload)
            .with_context(|| format!("malformed {kind:?} payload on tag {tag}"))?;
        debug!(session = self.id, tag, ?kind, "dispatching");

        let response = match request {
            Request::Auth { username, password } => {
                Response::Flag(self.store.authenticate(&username, &password))
            }
            Request::Register { username, password } => {
                let created = self.store.register(&username, &password);
                if created {
                    info!(session = self.id, %username, "user registered");
                }
                Response::Flag(created)
            }
            Request::Put { key, value } => {
                self.store.put(key, value);
                return Ok(Step::Continue);
            }
            Request::Get { key } => Response::Value(self.store.get(&key)),
            Request::MultiPut { pairs } => {
                self.store.multi_put(pairs);
                return Ok(Step::Continue);
            }
            Request::MultiGet { keys } => {
                let mut entries: Vec<_> = self.store.multi_get(keys).into_iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                Response::Entries(entries)
            }
            Request::GetWhen {
                key,
                cond_key,
                cond_value,
            } => {
                self.spawn_conditional_read(tag, key, cond_key, cond_value)?;
                return Ok(Step::Continue);
            }
            Request::Disconnect => {
                self.respond(tag, kind, &Response::Ack)?;
                return Ok(Step::Finish);
            }
        };

        self.respond(tag, kind, &response)?;
        Ok(Step::Continue)
    }

    fn respond(&self, tag: u32, kind: RequestKind, response: &Response) -> Result<()> {
        let payload = response.encode()?;
        self.demux
            .send(tag, kind.code(), &payload)
            .with_context(|| format!("failed to answer {kind:?} on tag {tag}"))
    }

    fn spawn_conditional_read(
        &mut self,
        tag: u32,
        key: String,
        cond_key: String,
        cond_value: Vec<u8>,
    ) -> Result<()> {
        self.waiters.retain(|waiter| !waiter.is_finished());

        let session = self.id;
        let demux = Arc::clone(&self.demux);
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        let waiter = thread::Builder::new()
            .name(format!("kv-get-when-{session}-{tag}"))
            .spawn(move || {
                let value = match store.get_when(&key, &cond_key, &cond_value, &cancel) {
                    Ok(value) => value,
                    Err(StoreError::Cancelled) => {
                        debug!(session, tag, "conditional read cancelled");
                        return;
                    }
                };
                let sent = Response::Value(value)
                    .encode()
                    .map_err(anyhow::Error::from)
                    .and_then(|payload| {
                        demux
                            .send(tag, RequestKind::GetWhen.code(), &payload)
                            .map_err(anyhow::Error::from)
                    });
                if let Err(err) = sent {
                    debug!(session, tag, error = %err, "conditional read answer not delivered");
                }
            })
            .context("failed to spawn conditional read")?;
        self.waiters.push(waiter);
        Ok(())
    }

    fn terminate(self) {
        let Session {
            id,
            peer,
            demux,
            store,
            registry,
            cancel,
            waiters,
            permit,
        } = self;

        // Closing first also fails a helper blocked writing to a peer that stopped reading.
        demux.close();
        cancel.cancel();
        if !waiters.is_empty() {
            store.wake_waiters();
        }
        for waiter in waiters {
            if waiter.join().is_err() {
                warn!(session = id, "conditional read thread panicked");
            }
        }

        registry.remove(id);
        drop(permit);
        info!(session = id, ?peer, "session ended");
    }
}
