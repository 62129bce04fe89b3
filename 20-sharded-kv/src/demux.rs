//! Tag-based demultiplexing of one connection.
//!
//! A single background reader pulls frames off the [`TaggedConnection`] and
//! pushes each into a bounded queue keyed by the frame's tag, creating the
//! queue on first use. Callers block on their own tag only, so a slow
//! exchange never holds up responses for other tags.
//!
//! The client waits on the tags it allocated. The server builds the same
//! demultiplexer in serving mode, where the reader also records arrival order
//! so [`Demultiplexer::next_frame`] hands out requests in the order they were
//! sent.
//!
//! Closing, either explicitly or because the reader saw end of stream, drains
//! every queue and drops the senders, which wakes every blocked receiver with
//! [`ConnectionError::Closed`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::TaggedConnection;
use crate::error::ConnectionError;
use crate::frame::Frame;

/// Frames buffered per tag before the reader applies backpressure.
const TAG_QUEUE_CAPACITY: usize = 1024;

pub struct Demultiplexer {
    shared: Arc<Shared>,
    arrivals: Option<Receiver<u32>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    conn: Arc<TaggedConnection>,
    routes: Mutex<RouteTable>,
}

struct RouteTable {
    closed: bool,
    queues: HashMap<u32, TagQueue>,
    arrivals: Option<Sender<u32>>,
}

struct TagQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    waiters: usize,
}

impl TagQueue {
    fn new() -> Self {
        let (tx, rx) = bounded(TAG_QUEUE_CAPACITY);
        Self { tx, rx, waiters: 0 }
    }
}

impl Demultiplexer {
    /// Starts the reader for a connection whose callers wait on known tags.
    pub fn new(conn: Arc<TaggedConnection>) -> std::io::Result<Self> {
        Self::start(conn, None)
    }

    /// Starts the reader for the accepting side, which also tracks arrival order.
    pub fn serving(conn: Arc<TaggedConnection>) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        Self::start(conn, Some((tx, rx)))
    }

    fn start(
        conn: Arc<TaggedConnection>,
        arrivals: Option<(Sender<u32>, Receiver<u32>)>,
    ) -> std::io::Result<Self> {
        let (arrivals_tx, arrivals_rx) = match arrivals {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };
        let shared = Arc::new(Shared {
            conn,
            routes: Mutex::new(RouteTable {
                closed: false,
                queues: HashMap::new(),
                arrivals: arrivals_tx,
            }),
        });

        let reader_shared = Arc::clone(&shared);
        let peer = shared.conn.peer_addr();
        let reader = thread::Builder::new()
            .name(match peer {
                Some(peer) => format!("demux-reader-{peer}"),
                None => "demux-reader".to_string(),
            })
            .spawn(move || reader_shared.run_reader())?;

        Ok(Self {
            shared,
            arrivals: arrivals_rx,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn connection(&self) -> &Arc<TaggedConnection> {
        &self.shared.conn
    }

    pub fn is_closed(&self) -> bool {
        self.shared.routes.lock().closed
    }

    /// Sends a frame. Safe to call from many threads at once.
    pub fn send(&self, tag: u32, kind: u16, payload: &[u8]) -> Result<(), ConnectionError> {
        self.shared.conn.send(tag, kind, payload)
    }

    /// Blocks until a frame for `tag` arrives and returns its payload.
    pub fn receive(&self, tag: u32) -> Result<Vec<u8>, ConnectionError> {
        self.receive_frame(tag).map(|frame| frame.payload)
    }

    /// Like [`Demultiplexer::receive`], but gives up after `timeout` with
    /// [`ConnectionError::TimedOut`].
    pub fn receive_timeout(&self, tag: u32, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        self.wait_frame(tag, Some(timeout)).map(|frame| frame.payload)
    }

    /// Blocks until a frame for `tag` arrives. Each frame is handed to exactly one caller.
    pub fn receive_frame(&self, tag: u32) -> Result<Frame, ConnectionError> {
        self.wait_frame(tag, None)
    }

    fn wait_frame(&self, tag: u32, timeout: Option<Duration>) -> Result<Frame, ConnectionError> {
        let rx = {
            let mut routes = self.shared.routes.lock();
            if routes.closed {
                return Err(ConnectionError::Closed);
            }
            let queue = routes.queues.entry(tag).or_insert_with(TagQueue::new);
            queue.waiters += 1;
            queue.rx.clone()
        };

        let received = match timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => ConnectionError::TimedOut,
                RecvTimeoutError::Disconnected => ConnectionError::Closed,
            }),
            None => rx.recv().map_err(|_| ConnectionError::Closed),
        };
        self.shared.release(tag);
        received
    }

    /// Serving mode: blocks until the next frame in arrival order.
    pub fn next_frame(&self) -> Result<Frame, ConnectionError> {
        let arrivals = self.arrivals.as_ref().ok_or_else(|| {
            ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "demultiplexer is not in serving mode",
            ))
        })?;
        let tag = arrivals.recv().map_err(|_| ConnectionError::Closed)?;
        self.receive_frame(tag)
    }

    /// Closes the connection, fails every waiter and joins the reader.
    pub fn close(&self) {
        self.shared.shutdown();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if reader.thread().id() == thread::current().id() {
                return;
            }
            if reader.join().is_err() {
                warn!("demultiplexer reader panicked");
            }
        }
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn run_reader(&self) {
        loop {
            match self.conn.receive() {
                Ok(frame) => {
                    if !self.route(frame) {
                        break;
                    }
                }
                Err(ConnectionError::Closed) => {
                    debug!(peer = ?self.conn.peer_addr(), "connection closed, reader exiting");
                    break;
                }
                Err(err) => {
                    warn!(peer = ?self.conn.peer_addr(), error = %err, "reader failed");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Queues a frame under its tag. Returns `false` once the table is closed.
    fn route(&self, frame: Frame) -> bool {
        let tag = frame.tag;
        let (queue, arrivals) = {
            let mut routes = self.routes.lock();
            if routes.closed {
                return false;
            }
            let queue = routes.queues.entry(tag).or_insert_with(TagQueue::new);
            (queue.tx.clone(), routes.arrivals.clone())
        };

        trace!(tag, kind = frame.kind, len = frame.payload.len(), "routing frame");
        if queue.send(frame).is_err() {
            return false;
        }
        match arrivals {
            Some(arrivals) => arrivals.send(tag).is_ok(),
            None => true,
        }
    }

    /// Drops the queue for `tag` once nobody waits on it and nothing is buffered.
    fn release(&self, tag: u32) {
        let mut routes = self.routes.lock();
        if let Entry::Occupied(mut entry) = routes.queues.entry(tag) {
            let queue = entry.get_mut();
            queue.waiters = queue.waiters.saturating_sub(1);
            if queue.waiters == 0 && queue.rx.is_empty() {
                entry.remove();
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut routes = self.routes.lock();
            if !routes.closed {
                routes.closed = true;
                for (_, queue) in routes.queues.drain() {
                    while queue.rx.try_recv().is_ok() {}
                }
                routes.arrivals = None;
            }
        }
        self.conn.close();
    }
}
