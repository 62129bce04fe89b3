//! Thread-safe framed TCP connection.
//!
//! Sends and receives are serialized by two independent locks: two senders
//! never interleave bytes, two receivers never split a frame, and a send can
//! run while another thread is blocked in a receive.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ConnectionError;
use crate::frame::{self, Frame};

pub struct TaggedConnection {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    socket: TcpStream,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TaggedConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            socket: stream,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn connect<A>(addr: A) -> io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        Self::new(TcpStream::connect(addr)?)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes one frame atomically with respect to other senders, then flushes.
    pub fn send(&self, tag: u32, kind: u16, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.writer.lock();
        frame::write_frame(&mut *writer, tag, kind, payload).map_err(|err| self.classify(err))
    }

    /// Blocks until a complete frame arrives.
    pub fn receive(&self) -> Result<Frame, ConnectionError> {
        let mut reader = self.reader.lock();
        match frame::read_frame(&mut *reader) {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ConnectionError::Closed),
            Err(err) => Err(self.classify(err)),
        }
    }

    /// Shuts the socket down in both directions. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            if err.kind() != io::ErrorKind::NotConnected {
                debug!(peer = ?self.peer, error = %err, "socket shutdown failed");
            }
        }
    }

    fn classify(&self, err: io::Error) -> ConnectionError {
        if self.is_closed() {
            return ConnectionError::Closed;
        }
        match err.kind() {
            io::ErrorKind::InvalidData => ConnectionError::Malformed(err.to_string()),
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ConnectionError::Closed,
            _ => ConnectionError::Io(err),
        }
    }
}

impl Drop for TaggedConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn pair() -> (TaggedConnection, TaggedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TaggedConnection::connect(addr).expect("connect");
        let (stream, _) = listener.accept().expect("accept");
        (client, TaggedConnection::new(stream).expect("server side"))
    }

    #[test]
    fn concurrent_senders_never_interleave_frames() {
        let (client, server) = pair();
        let client = Arc::new(client);

        let senders: Vec<_> = (0..4u32)
            .map(|worker| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        let payload = vec![worker as u8; 512];
                        client.send(worker * 1000 + i, 3, &payload).expect("send");
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let frame = server.receive().expect("receive");
            let worker = frame.tag / 1000;
            assert_eq!(frame.payload.len(), 512);
            assert!(frame.payload.iter().all(|byte| u32::from(*byte) == worker));
        }
        for sender in senders {
            sender.join().expect("sender thread");
        }
    }

    #[test]
    fn peer_close_surfaces_as_closed() {
        let (client, server) = pair();
        client.close();
        client.close();

        assert!(matches!(server.receive(), Err(ConnectionError::Closed)));
        assert!(matches!(client.send(1, 0, b""), Err(ConnectionError::Closed)));
    }

    #[test]
    fn local_close_unblocks_a_pending_receive() {
        let (client, _server) = pair();
        let client = Arc::new(client);

        let receiver = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.receive())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        client.close();

        let result = receiver.join().expect("receiver thread");
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }
}
