// Wire envelope layout and codec for the client/daemon request protocol.
//
// One synchronous call per connection at a time: a 40-byte request header
// followed by a bounded name and payload, answered by a 36-byte response
// header and payload. All fields little-endian; no host struct overlay.
use std::io::{Read, Write};

use crate::core::error::{Error, ErrorKind};

pub const WIRE_MAGIC: [u8; 4] = *b"CBW1";
pub const WIRE_VERSION: u16 = 1;
pub const REQUEST_HEADER_LEN: usize = 40;
pub const RESPONSE_HEADER_LEN: usize = 36;
pub const MAX_WIRE_NAME: usize = 256;
pub const MAX_WIRE_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subsystem {
    Control = 0,
    Queue = 1,
    Macro = 2,
    Registry = 3,
}

impl Subsystem {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Subsystem::Control),
            1 => Ok(Subsystem::Queue),
            2 => Ok(Subsystem::Macro),
            3 => Ok(Subsystem::Registry),
            _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown subsystem")),
        }
    }
}

/// Operation codes, scoped per subsystem.
pub mod op {
    pub mod control {
        pub const PING: u8 = 0;
        pub const SESSION_CREATE: u8 = 1;
        pub const SESSION_ATTACH: u8 = 2;
        pub const SESSION_DETACH: u8 = 3;
        pub const SHUTDOWN: u8 = 4;
    }

    pub mod queue {
        pub const CREATE: u8 = 0;
        pub const OPEN: u8 = 1;
        pub const DELETE: u8 = 2;
        pub const QUERY: u8 = 3;
        pub const COUNT: u8 = 4;
        pub const CLEAR: u8 = 5;
        pub const ADD: u8 = 6;
        pub const PULL: u8 = 7;
    }

    pub mod macrospace {
        pub const ADD: u8 = 0;
        pub const REMOVE: u8 = 1;
        pub const CLEAR: u8 = 2;
        pub const GET: u8 = 3;
        pub const QUERY: u8 = 4;
        pub const REORDER: u8 = 5;
        pub const COUNT: u8 = 6;
        pub const ITER_BEGIN: u8 = 7;
        pub const ITER_DESCRIPTOR: u8 = 8;
        pub const ITER_IMAGE: u8 = 9;
    }

    pub mod registry {
        pub const REGISTER: u8 = 0;
        pub const DROP: u8 = 1;
        pub const QUERY: u8 = 2;
        pub const FETCH: u8 = 3;
    }
}

/// Every daemon-side fault maps onto exactly one of these codes; `Internal`
/// is the fallback bucket. `Empty` is a normal outcome, not a fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultCode {
    Ok = 0,
    Empty = 1,
    BadArgument = 2,
    NotFound = 3,
    Duplicate = 4,
    AccessDenied = 5,
    Exhausted = 6,
    Protocol = 7,
    Unavailable = 8,
    Source = 9,
    Io = 10,
    Internal = 11,
}

impl ResultCode {
    pub fn from_u16(value: u16) -> Result<Self, Error> {
        match value {
            0 => Ok(ResultCode::Ok),
            1 => Ok(ResultCode::Empty),
            2 => Ok(ResultCode::BadArgument),
            3 => Ok(ResultCode::NotFound),
            4 => Ok(ResultCode::Duplicate),
            5 => Ok(ResultCode::AccessDenied),
            6 => Ok(ResultCode::Exhausted),
            7 => Ok(ResultCode::Protocol),
            8 => Ok(ResultCode::Unavailable),
            9 => Ok(ResultCode::Source),
            10 => Ok(ResultCode::Io),
            11 => Ok(ResultCode::Internal),
            _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown result code")),
        }
    }

    pub fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::BadArgument => ResultCode::BadArgument,
            ErrorKind::NotFound => ResultCode::NotFound,
            ErrorKind::Duplicate => ResultCode::Duplicate,
            ErrorKind::AccessDenied => ResultCode::AccessDenied,
            ErrorKind::Exhausted => ResultCode::Exhausted,
            ErrorKind::Protocol => ResultCode::Protocol,
            ErrorKind::Unavailable => ResultCode::Unavailable,
            ErrorKind::Source => ResultCode::Source,
            ErrorKind::Io => ResultCode::Io,
            ErrorKind::Internal => ResultCode::Internal,
        }
    }

    /// `Ok` and `Empty` have no error kind; everything else maps back 1:1.
    pub fn to_error_kind(self) -> Option<ErrorKind> {
        match self {
            ResultCode::Ok | ResultCode::Empty => None,
            ResultCode::BadArgument => Some(ErrorKind::BadArgument),
            ResultCode::NotFound => Some(ErrorKind::NotFound),
            ResultCode::Duplicate => Some(ErrorKind::Duplicate),
            ResultCode::AccessDenied => Some(ErrorKind::AccessDenied),
            ResultCode::Exhausted => Some(ErrorKind::Exhausted),
            ResultCode::Protocol => Some(ErrorKind::Protocol),
            ResultCode::Unavailable => Some(ErrorKind::Unavailable),
            ResultCode::Source => Some(ErrorKind::Source),
            ResultCode::Io => Some(ErrorKind::Io),
            ResultCode::Internal => Some(ErrorKind::Internal),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub subsystem: Subsystem,
    pub opcode: u8,
    pub params: [u64; 3],
    pub name: String,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(subsystem: Subsystem, opcode: u8) -> Self {
        Self {
            subsystem,
            opcode,
            params: [0; 3],
            name: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: [u64; 3]) -> Self {
        self.params = params;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.name.len() > MAX_WIRE_NAME {
            return Err(Error::new(ErrorKind::Protocol).with_message("request name exceeds max"));
        }
        if self.payload.len() > MAX_WIRE_PAYLOAD {
            return Err(
                Error::new(ErrorKind::Protocol).with_message("request payload exceeds max")
            );
        }
        let mut buf =
            Vec::with_capacity(REQUEST_HEADER_LEN + self.name.len() + self.payload.len());
        buf.extend_from_slice(&WIRE_MAGIC);
        buf.extend_from_slice(&WIRE_VERSION.to_le_bytes());
        buf.push(self.subsystem as u8);
        buf.push(self.opcode);
        for param in self.params {
            buf.extend_from_slice(&param.to_le_bytes());
        }
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        let buf = self.encode()?;
        writer
            .write_all(&buf)
            .and_then(|()| writer.flush())
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to write request")
                    .with_source(err)
            })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        read_exact(reader, &mut header, "request header")?;
        validate_preamble(&header)?;
        let subsystem = Subsystem::from_u8(header[6])?;
        let opcode = header[7];
        let params = [read_u64(&header, 8), read_u64(&header, 16), read_u64(&header, 24)];
        let name_len = u16::from_le_bytes([header[32], header[33]]) as usize;
        let payload_len = read_u32(&header, 36) as usize;
        if name_len > MAX_WIRE_NAME {
            return Err(Error::new(ErrorKind::Protocol).with_message("request name exceeds max"));
        }
        if payload_len > MAX_WIRE_PAYLOAD {
            return Err(
                Error::new(ErrorKind::Protocol).with_message("request payload exceeds max")
            );
        }

        let mut name_buf = vec![0u8; name_len];
        read_exact(reader, &mut name_buf, "request name")?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| Error::new(ErrorKind::Protocol).with_message("request name not UTF-8"))?;

        let mut payload = vec![0u8; payload_len];
        read_exact(reader, &mut payload, "request payload")?;

        Ok(Self {
            subsystem,
            opcode,
            params,
            name,
            payload,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub result: ResultCode,
    pub params: [u64; 3],
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            result: ResultCode::Ok,
            params: [0; 3],
            payload: Vec::new(),
        }
    }

    pub fn failure(code: ResultCode) -> Self {
        Self {
            result: code,
            params: [0; 3],
            payload: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: [u64; 3]) -> Self {
        self.params = params;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.payload.len() > MAX_WIRE_PAYLOAD {
            return Err(
                Error::new(ErrorKind::Protocol).with_message("response payload exceeds max")
            );
        }
        let mut buf = Vec::with_capacity(RESPONSE_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&WIRE_MAGIC);
        buf.extend_from_slice(&WIRE_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.result as u16).to_le_bytes());
        for param in self.params {
            buf.extend_from_slice(&param.to_le_bytes());
        }
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        let buf = self.encode()?;
        writer
            .write_all(&buf)
            .and_then(|()| writer.flush())
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to write response")
                    .with_source(err)
            })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        read_exact(reader, &mut header, "response header")?;
        validate_preamble(&header)?;
        let result = ResultCode::from_u16(u16::from_le_bytes([header[6], header[7]]))?;
        let params = [read_u64(&header, 8), read_u64(&header, 16), read_u64(&header, 24)];
        let payload_len = read_u32(&header, 32) as usize;
        if payload_len > MAX_WIRE_PAYLOAD {
            return Err(
                Error::new(ErrorKind::Protocol).with_message("response payload exceeds max")
            );
        }
        let mut payload = vec![0u8; payload_len];
        read_exact(reader, &mut payload, "response payload")?;
        Ok(Self {
            result,
            params,
            payload,
        })
    }
}

fn validate_preamble(buf: &[u8]) -> Result<(), Error> {
    if buf[0..4] != WIRE_MAGIC {
        return Err(Error::new(ErrorKind::Protocol).with_message("bad wire magic"));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != WIRE_VERSION {
        return Err(Error::new(ErrorKind::Protocol).with_message("unsupported wire version"));
    }
    Ok(())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|err| {
        let kind = if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ErrorKind::Protocol
        } else {
            ErrorKind::Io
        };
        Error::new(kind)
            .with_message(format!("failed to read {what}"))
            .with_source(err)
    })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::{
        MAX_WIRE_PAYLOAD, Request, Response, ResultCode, Subsystem, WIRE_VERSION, op,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn request_round_trip() {
        let request = Request::new(Subsystem::Queue, op::queue::ADD)
            .with_params([7, 1, 0])
            .with_name("Q1")
            .with_payload(b"hello".to_vec());
        let buf = request.encode().expect("encode");
        let decoded = Request::read_from(&mut buf.as_slice()).expect("decode");
        assert_eq!(request, decoded);
    }

    #[test]
    fn response_round_trip() {
        let response = Response::ok()
            .with_params([1, 2, 3])
            .with_payload(b"world".to_vec());
        let buf = response.encode().expect("encode");
        let decoded = Response::read_from(&mut buf.as_slice()).expect("decode");
        assert_eq!(response, decoded);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Request::new(Subsystem::Control, op::control::PING)
            .encode()
            .expect("encode");
        buf[0] = b'X';
        let err = Request::read_from(&mut buf.as_slice()).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut buf = Response::ok().encode().expect("encode");
        buf[4..6].copy_from_slice(&(WIRE_VERSION + 1).to_le_bytes());
        let err = Response::read_from(&mut buf.as_slice()).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn truncated_request_is_a_protocol_error() {
        let buf = Request::new(Subsystem::Queue, op::queue::PULL)
            .with_name("Q1")
            .encode()
            .expect("encode");
        let err = Request::read_from(&mut buf[..buf.len() - 1].as_ref()).expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn oversized_payload_is_rejected_before_allocation() {
        let mut buf = Request::new(Subsystem::Queue, op::queue::ADD)
            .encode()
            .expect("encode");
        buf[36..40].copy_from_slice(&((MAX_WIRE_PAYLOAD as u32) + 1).to_le_bytes());
        let err = Request::read_from(&mut buf.as_slice()).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn result_code_mapping_is_total() {
        let kinds = [
            ErrorKind::Internal,
            ErrorKind::BadArgument,
            ErrorKind::NotFound,
            ErrorKind::Duplicate,
            ErrorKind::AccessDenied,
            ErrorKind::Exhausted,
            ErrorKind::Protocol,
            ErrorKind::Unavailable,
            ErrorKind::Source,
            ErrorKind::Io,
        ];
        for kind in kinds {
            let code = ResultCode::from_error_kind(kind);
            assert_eq!(code.to_error_kind(), Some(kind));
        }
        assert_eq!(ResultCode::Ok.to_error_kind(), None);
        assert_eq!(ResultCode::Empty.to_error_kind(), None);
    }

    #[test]
    fn unknown_subsystem_is_rejected() {
        let err = Subsystem::from_u8(9).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
