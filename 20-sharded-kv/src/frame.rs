//! Length-prefixed frame codec.
//!
//! Every exchange on a connection is one frame:
//!
//! ```text
//! tag: u32 | kind: u16 | payload_len: i32 | payload: [u8; payload_len]
//! ```
//!
//! All integers are big-endian. The codec works over any `Read`/`Write`, so it
//! is shared by the TCP connection and by in-memory buffers in tests. The
//! payload is opaque at this layer; [`crate::message`] interprets it.

use std::io::{self, Read, Write};

use crate::error::WireError;

/// Bytes in the fixed frame header (tag + kind + payload length).
pub const HEADER_LEN: usize = 10;

/// Largest payload the codec accepts. Anything larger is treated as a corrupt header.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestKind {
    Auth = 0,
    Register = 1,
    Put = 2,
    Get = 3,
    MultiPut = 4,
    MultiGet = 5,
    GetWhen = 6,
    Disconnect = 7,
}

impl RequestKind {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Fire-and-forget kinds never produce a response frame.
    pub fn expects_response(self) -> bool {
        !matches!(self, RequestKind::Put | RequestKind::MultiPut)
    }
}

impl TryFrom<u16> for RequestKind {
    type Error = WireError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => RequestKind::Auth,
            1 => RequestKind::Register,
            2 => RequestKind::Put,
            3 => RequestKind::Get,
            4 => RequestKind::MultiPut,
            5 => RequestKind::MultiGet,
            6 => RequestKind::GetWhen,
            7 => RequestKind::Disconnect,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

/// One decoded frame.
///
/// `kind` stays a raw code so frames with unknown kinds still cross the
/// transport and can be logged by whoever consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub kind: u16,
    pub payload: Vec<u8>,
}

/// Writes one frame and flushes.
///
/// Header and payload go out in a single `write_all` so a buffered writer
/// never holds half a frame between calls.
pub fn write_frame<W>(writer: &mut W, tag: u32, kind: u16, payload: &[u8]) -> io::Result<()>
where
    W: Write,
{
    let len = i32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds the frame limit", payload.len()),
            )
        })?;

    let mut encoded = Vec::with_capacity(HEADER_LEN + payload.len());
    encoded.extend_from_slice(&tag.to_be_bytes());
    encoded.extend_from_slice(&kind.to_be_bytes());
    encoded.extend_from_slice(&len.to_be_bytes());
    encoded.extend_from_slice(payload);
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Reads one complete frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary. A stream
/// that ends inside a frame yields `UnexpectedEof`; a negative or oversized
/// length yields `InvalidData`.
pub fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: Read,
{
    let mut header = [0u8; HEADER_LEN];
    if !read_header(reader, &mut header)? {
        return Ok(None);
    }

    let tag = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind = u16::from_be_bytes([header[4], header[5]]);
    let len = i32::from_be_bytes([header[6], header[7], header[8], header[9]]);

    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} out of range"),
            )
        })?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Frame { tag, kind, payload }))
}

fn read_header<R>(reader: &mut R, header: &mut [u8; HEADER_LEN]) -> io::Result<bool>
where
    R: Read,
{
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ));
            }
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 0x0102_0304, RequestKind::Get.code(), b"abc").expect("write");

        assert_eq!(
            buf,
            vec![1, 2, 3, 4, 0, 3, 0, 0, 0, 3, b'a', b'b', b'c'],
            "tag, kind, length, payload in that order"
        );
    }

    #[test]
    fn reads_back_consecutive_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, RequestKind::Put.code(), b"first").expect("write");
        write_frame(&mut buf, 8, RequestKind::Disconnect.code(), b"").expect("write");

        let mut reader = Cursor::new(buf);
        let first = read_frame(&mut reader).expect("read").expect("frame");
        let second = read_frame(&mut reader).expect("read").expect("frame");

        assert_eq!(first.tag, 7);
        assert_eq!(first.payload, b"first");
        assert_eq!(second.kind, RequestKind::Disconnect.code());
        assert!(second.payload.is_empty());
        assert!(read_frame(&mut reader).expect("clean eof").is_none());
    }

    #[test]
    fn truncated_frame_is_an_error_not_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, RequestKind::Get.code(), b"payload").expect("write");
        buf.truncate(buf.len() - 2);

        let err = read_frame(&mut Cursor::new(buf)).expect_err("partial payload");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = read_frame(&mut Cursor::new(vec![0, 0, 0])).expect_err("partial header");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn negative_length_is_invalid_data() {
        let mut buf = vec![0, 0, 0, 1, 0, 3];
        buf.extend_from_slice(&(-5i32).to_be_bytes());

        let err = read_frame(&mut Cursor::new(buf)).expect_err("negative length");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_codes_are_rejected_by_conversion_only() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 3, 999, b"").expect("write");
        let frame = read_frame(&mut Cursor::new(buf)).expect("read").expect("frame");

        assert_eq!(frame.kind, 999);
        assert!(matches!(
            RequestKind::try_from(frame.kind),
            Err(WireError::UnknownKind(999))
        ));
        assert_eq!(RequestKind::try_from(6).expect("known"), RequestKind::GetWhen);
    }
}
