//! Blocking client for the key-value server.
//!
//! A [`Client`] is `Sync`: any number of threads can issue calls on one
//! connection at the same time. Every call takes a fresh tag, sends its
//! request and blocks on that tag only, so answers may come back in any
//! order and still reach the right caller.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::connection::TaggedConnection;
use crate::demux::Demultiplexer;
use crate::error::{ClientError, ConnectionError, WireError};
use crate::frame::RequestKind;
use crate::message::{Request, Response};

/// How long [`Client::close`] waits for the server to acknowledge a disconnect.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Client {
    demux: Demultiplexer,
    next_tag: AtomicU32,
    disconnected: AtomicBool,
}

impl Client {
    pub fn connect<A>(addr: A) -> Result<Self, ClientError>
    where
        A: ToSocketAddrs,
    {
        let conn = TaggedConnection::connect(addr)?;
        let demux = Demultiplexer::new(Arc::new(conn))?;
        Ok(Self {
            demux,
            next_tag: AtomicU32::new(1),
            disconnected: AtomicBool::new(false),
        })
    }

    /// `Ok(false)` covers both an unknown user and a wrong password.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<bool, ClientError> {
        let request = Request::Auth {
            username: username.to_string(),
            password: password.to_string(),
        };
        match self.call(&request)? {
            Response::Flag(flag) => Ok(flag),
            other => Err(unexpected(&request, other)),
        }
    }

    /// `Ok(false)` if the username is already taken.
    pub fn register(&self, username: &str, password: &str) -> Result<bool, ClientError> {
        let request = Request::Register {
            username: username.to_string(),
            password: password.to_string(),
        };
        match self.call(&request)? {
            Response::Flag(flag) => Ok(flag),
            other => Err(unexpected(&request, other)),
        }
    }

    /// Fire-and-forget: returns once the request is written.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        self.cast(&Request::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let request = Request::Get {
            key: key.to_string(),
        };
        match self.call(&request)? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected(&request, other)),
        }
    }

    /// Fire-and-forget: returns once the request is written.
    pub fn multi_put<I, K, V>(&self, pairs: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.cast(&Request::MultiPut { pairs })
    }

    /// Values of the requested keys that exist; absent keys are left out.
    pub fn multi_get<I, K>(&self, keys: I) -> Result<HashMap<String, Vec<u8>>, ClientError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let request = Request::MultiGet {
            keys: keys.into_iter().map(Into::into).collect(),
        };
        match self.call(&request)? {
            Response::Entries(entries) => Ok(entries.into_iter().collect()),
            other => Err(unexpected(&request, other)),
        }
    }

    /// Blocks until `cond_key` holds `cond_value` on the server, then returns the value of `key`.
    pub fn get_when(
        &self,
        key: &str,
        cond_key: &str,
        cond_value: &[u8],
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let request = Request::GetWhen {
            key: key.to_string(),
            cond_key: cond_key.to_string(),
            cond_value: cond_value.to_vec(),
        };
        match self.call(&request)? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected(&request, other)),
        }
    }

    /// Asks the server to end the session, waits up to [`DISCONNECT_TIMEOUT`]
    /// for the acknowledgement and closes the connection. A client the server
    /// never admitted gets no acknowledgement; it is closed all the same.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<(), ClientError> {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let outcome = self.send_disconnect().and_then(|tag| {
            match self.demux.receive_timeout(tag, DISCONNECT_TIMEOUT) {
                Ok(_) | Err(ConnectionError::Closed) => Ok(()),
                Err(ConnectionError::TimedOut) => {
                    debug!(tag, "disconnect not acknowledged, closing anyway");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        });
        self.demux.close();
        outcome
    }

    /// Sends the disconnect request and returns its tag without waiting for the answer.
    fn send_disconnect(&self) -> Result<u32, ClientError> {
        let payload = Request::Disconnect.encode()?;
        let tag = self.next_tag();
        match self.demux.send(tag, RequestKind::Disconnect.code(), &payload) {
            Ok(()) | Err(ConnectionError::Closed) => Ok(tag),
            Err(err) => Err(err.into()),
        }
    }

    fn next_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let kind = request.kind();
        let payload = request.encode()?;
        let tag = self.next_tag();

        debug!(tag, ?kind, "sending request");
        self.demux.send(tag, kind.code(), &payload)?;
        let answer = self.demux.receive(tag)?;
        Ok(Response::decode(kind, &answer)?)
    }

    fn cast(&self, request: &Request) -> Result<(), ClientError> {
        let kind = request.kind();
        debug_assert!(!kind.expects_response());
        let payload = request.encode()?;
        let tag = self.next_tag();

        debug!(tag, ?kind, "sending request without reply");
        self.demux.send(tag, kind.code(), &payload)?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.send_disconnect() {
            debug!(error = %err, "disconnect on drop failed");
        }
        self.demux.close();
    }
}

fn unexpected(request: &Request, response: Response) -> ClientError {
    debug!(kind = ?request.kind(), ?response, "response does not match request");
    ClientError::Wire(WireError::NoResponse(request.kind()))
}
