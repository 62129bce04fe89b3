//! Request and response payloads carried inside frames.
//!
//! Field encodings:
//! - strings: `u16` byte length + UTF-8 bytes
//! - values: `i32` byte length + raw bytes, `-1` marking an absent value
//! - booleans: one byte, `0` or `1`
//! - counts: `i32`

use crate::error::WireError;
use crate::frame::RequestKind;

/// Length prefix used on the wire for an absent value.
const ABSENT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Auth { username: String, password: String },
    Register { username: String, password: String },
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    MultiPut { pairs: Vec<(String, Vec<u8>)> },
    MultiGet { keys: Vec<String> },
    GetWhen { key: String, cond_key: String, cond_value: Vec<u8> },
    Disconnect,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Auth { .. } => RequestKind::Auth,
            Request::Register { .. } => RequestKind::Register,
            Request::Put { .. } => RequestKind::Put,
            Request::Get { .. } => RequestKind::Get,
            Request::MultiPut { .. } => RequestKind::MultiPut,
            Request::MultiGet { .. } => RequestKind::MultiGet,
            Request::GetWhen { .. } => RequestKind::GetWhen,
            Request::Disconnect => RequestKind::Disconnect,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            Request::Auth { username, password } | Request::Register { username, password } => {
                put_str(&mut out, username)?;
                put_str(&mut out, password)?;
            }
            Request::Put { key, value } => {
                put_str(&mut out, key)?;
                put_value(&mut out, value)?;
            }
            Request::Get { key } => put_str(&mut out, key)?,
            Request::MultiPut { pairs } => {
                put_count(&mut out, pairs.len())?;
                for (key, value) in pairs {
                    put_str(&mut out, key)?;
                    put_value(&mut out, value)?;
                }
            }
            Request::MultiGet { keys } => {
                put_count(&mut out, keys.len())?;
                for key in keys {
                    put_str(&mut out, key)?;
                }
            }
            Request::GetWhen {
                key,
                cond_key,
                cond_value,
            } => {
                put_str(&mut out, key)?;
                put_str(&mut out, cond_key)?;
                put_value(&mut out, cond_value)?;
            }
            Request::Disconnect => {}
        }
        Ok(out)
    }

    pub fn decode(kind: RequestKind, payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let request = match kind {
            RequestKind::Auth => Request::Auth {
                username: reader.string()?,
                password: reader.string()?,
            },
            RequestKind::Register => Request::Register {
                username: reader.string()?,
                password: reader.string()?,
            },
            RequestKind::Put => Request::Put {
                key: reader.string()?,
                value: reader.value()?,
            },
            RequestKind::Get => Request::Get {
                key: reader.string()?,
            },
            RequestKind::MultiPut => {
                let count = reader.count()?;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    pairs.push((reader.string()?, reader.value()?));
                }
                Request::MultiPut { pairs }
            }
            RequestKind::MultiGet => {
                let count = reader.count()?;
                let mut keys = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    keys.push(reader.string()?);
                }
                Request::MultiGet { keys }
            }
            RequestKind::GetWhen => Request::GetWhen {
                key: reader.string()?,
                cond_key: reader.string()?,
                cond_value: reader.value()?,
            },
            RequestKind::Disconnect => Request::Disconnect,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Outcome of `Auth` and `Register`.
    Flag(bool),
    /// Outcome of `Get` and `GetWhen`; `None` is an absent key.
    Value(Option<Vec<u8>>),
    /// Present entries of a `MultiGet`.
    Entries(Vec<(String, Vec<u8>)>),
    /// Empty acknowledgement of `Disconnect`.
    Ack,
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            Response::Flag(flag) => out.push(u8::from(*flag)),
            Response::Value(Some(value)) => put_value(&mut out, value)?,
            Response::Value(None) => out.extend_from_slice(&ABSENT.to_be_bytes()),
            Response::Entries(entries) => {
                put_count(&mut out, entries.len())?;
                for (key, value) in entries {
                    put_str(&mut out, key)?;
                    put_value(&mut out, value)?;
                }
            }
            Response::Ack => {}
        }
        Ok(out)
    }

    /// Decodes the response to a request of `kind`.
    pub fn decode(kind: RequestKind, payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = PayloadReader::new(payload);
        let response = match kind {
            RequestKind::Auth | RequestKind::Register => Response::Flag(reader.flag()?),
            RequestKind::Get | RequestKind::GetWhen => Response::Value(reader.optional_value()?),
            RequestKind::MultiGet => {
                let count = reader.count()?;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    entries.push((reader.string()?, reader.value()?));
                }
                Response::Entries(entries)
            }
            RequestKind::Disconnect => Response::Ack,
            RequestKind::Put | RequestKind::MultiPut => return Err(WireError::NoResponse(kind)),
        };
        reader.finish()?;
        Ok(response)
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::StringTooLong(value.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_value(out: &mut Vec<u8>, value: &[u8]) -> Result<(), WireError> {
    let len = i32::try_from(value.len()).map_err(|_| WireError::ValueTooLong(value.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn put_count(out: &mut Vec<u8>, count: usize) -> Result<(), WireError> {
    let count = i32::try_from(count).map_err(|_| WireError::ValueTooLong(count))?;
    out.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

/// Cursor over a payload that reports truncation instead of panicking.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(needed)
            .filter(|end| *end <= self.buf.len())
            .ok_or(WireError::Truncated {
                offset: self.pos,
                needed,
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn flag(&mut self) -> Result<bool, WireError> {
        Ok(self.take(1)?[0] != 0)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn count(&mut self) -> Result<usize, WireError> {
        let count = self.i32()?;
        usize::try_from(count).map_err(|_| WireError::InvalidLength(count))
    }

    fn value(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.i32()?;
        let len = usize::try_from(len).map_err(|_| WireError::InvalidLength(len))?;
        Ok(self.take(len)?.to_vec())
    }

    fn optional_value(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        match self.i32()? {
            ABSENT => Ok(None),
            len if len < 0 => Err(WireError::InvalidLength(len)),
            len => Ok(Some(self.take(len as usize)?.to_vec())),
        }
    }

    fn finish(self) -> Result<(), WireError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            rest => Err(WireError::TrailingBytes(rest)),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    use super::*;

    fn random_string(rng: &mut impl Rng) -> String {
        let len = rng.gen_range(0..24);
        rng.sample_iter(&Alphanumeric).take(len).map(char::from).collect()
    }

    fn random_bytes(rng: &mut impl Rng) -> Vec<u8> {
        let len = rng.gen_range(0..64);
        (0..len).map(|_| rng.gen_range(0..=u8::MAX)).collect()
    }

    fn random_request(rng: &mut impl Rng) -> Request {
        match rng.gen_range(0..8) {
            0 => Request::Auth {
                username: random_string(rng),
                password: random_string(rng),
            },
            1 => Request::Register {
                username: random_string(rng),
                password: random_string(rng),
            },
            2 => Request::Put {
                key: random_string(rng),
                value: random_bytes(rng),
            },
            3 => Request::Get {
                key: random_string(rng),
            },
            4 => Request::MultiPut {
                pairs: (0..rng.gen_range(0..6))
                    .map(|_| (random_string(rng), random_bytes(rng)))
                    .collect(),
            },
            5 => Request::MultiGet {
                keys: (0..rng.gen_range(0..6)).map(|_| random_string(rng)).collect(),
            },
            6 => Request::GetWhen {
                key: random_string(rng),
                cond_key: random_string(rng),
                cond_value: random_bytes(rng),
            },
            _ => Request::Disconnect,
        }
    }

    #[test]
    fn random_requests_survive_the_codec() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let request = random_request(&mut rng);
            let payload = request.encode().expect("encode");
            let decoded = Request::decode(request.kind(), &payload).expect("decode");
            assert_eq!(decoded, request);
        }
    }

    /// A response together with a request kind that answers with it.
    fn random_response(rng: &mut impl Rng) -> (RequestKind, Response) {
        match rng.gen_range(0..6) {
            0 => (RequestKind::Auth, Response::Flag(rng.gen())),
            1 => (RequestKind::Register, Response::Flag(rng.gen())),
            2 => (
                RequestKind::Get,
                Response::Value(rng.gen_bool(0.7).then(|| random_bytes(rng))),
            ),
            3 => (
                RequestKind::GetWhen,
                Response::Value(rng.gen_bool(0.7).then(|| random_bytes(rng))),
            ),
            4 => (
                RequestKind::MultiGet,
                Response::Entries(
                    (0..rng.gen_range(0..6))
                        .map(|_| (random_string(rng), random_bytes(rng)))
                        .collect(),
                ),
            ),
            _ => (RequestKind::Disconnect, Response::Ack),
        }
    }

    #[test]
    fn random_responses_survive_the_codec() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let (kind, response) = random_response(&mut rng);
            let payload = response.encode().expect("encode");
            let decoded = Response::decode(kind, &payload).expect("decode");
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn responses_decode_per_request_kind() {
        let entries = Response::Entries(vec![
            ("a".into(), b"1".to_vec()),
            ("b".into(), Vec::new()),
        ]);
        let payload = entries.encode().expect("encode");
        assert_eq!(
            Response::decode(RequestKind::MultiGet, &payload).expect("decode"),
            entries
        );

        let payload = Response::Flag(true).encode().expect("encode");
        assert_eq!(payload, vec![1]);
        assert_eq!(
            Response::decode(RequestKind::Register, &payload).expect("decode"),
            Response::Flag(true)
        );

        assert!(Response::Ack.encode().expect("encode").is_empty());
        assert_eq!(
            Response::decode(RequestKind::Disconnect, &[]).expect("decode"),
            Response::Ack
        );
    }

    #[test]
    fn absent_value_is_minus_one() {
        let payload = Response::Value(None).encode().expect("encode");
        assert_eq!(payload, (-1i32).to_be_bytes().to_vec());
        assert_eq!(
            Response::decode(RequestKind::Get, &payload).expect("decode"),
            Response::Value(None)
        );

        let empty = Response::Value(Some(Vec::new())).encode().expect("encode");
        assert_eq!(
            Response::decode(RequestKind::GetWhen, &empty).expect("decode"),
            Response::Value(Some(Vec::new())),
            "empty value is present, not absent"
        );
    }

    #[test]
    fn fire_and_forget_kinds_have_no_response() {
        assert!(matches!(
            Response::decode(RequestKind::Put, &[]),
            Err(WireError::NoResponse(RequestKind::Put))
        ));
        assert!(matches!(
            Response::decode(RequestKind::MultiPut, &[]),
            Err(WireError::NoResponse(RequestKind::MultiPut))
        ));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let mut payload = Request::Get { key: "key".into() }.encode().expect("encode");
        payload.pop();
        assert!(matches!(
            Request::decode(RequestKind::Get, &payload),
            Err(WireError::Truncated { .. })
        ));

        let mut payload = Request::Get { key: "key".into() }.encode().expect("encode");
        payload.push(0);
        assert!(matches!(
            Request::decode(RequestKind::Get, &payload),
            Err(WireError::TrailingBytes(1))
        ));

        let payload = (-3i32).to_be_bytes();
        assert!(matches!(
            Request::decode(RequestKind::MultiGet, &payload),
            Err(WireError::InvalidLength(-3))
        ));

        let payload = [0u8, 2, 0xff, 0xfe];
        assert!(matches!(
            Request::decode(RequestKind::Get, &payload),
            Err(WireError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn oversized_keys_fail_to_encode() {
        let key = "k".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            Request::Get { key }.encode(),
            Err(WireError::StringTooLong(_))
        ));
    }
}
