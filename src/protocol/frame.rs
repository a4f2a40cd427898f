use crate::core::{DbError, Result};
use std::fmt;

/// Size of the frame header preceding every message body.
pub const HEADER_SIZE: usize = 8;

/// Protocol version spoken by this client.
pub const PROTO_VERSION: u8 = 2;

/// Largest body length representable in the 6-byte length field.
pub const MAX_LENGTH_FIELD: u64 = (1 << 48) - 1;

/// Bodies above this size are rejected instead of allocated.
pub const MAX_BODY_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Info = 1,
    Admin = 2,
    Message = 3,
    Compressed = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Info),
            2 => Some(MessageType::Admin),
            3 => Some(MessageType::Message),
            4 => Some(MessageType::Compressed),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Info => "info",
            MessageType::Admin => "admin",
            MessageType::Message => "message",
            MessageType::Compressed => "compressed",
        };
        f.write_str(name)
    }
}

/// The 8-byte frame header: version, type and a 6-byte big-endian body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: MessageType,
    pub body_len: u64,
}

impl FrameHeader {
    pub fn new(msg_type: MessageType, body_len: usize) -> Result<Self> {
        let body_len = body_len as u64;
        if body_len > MAX_LENGTH_FIELD {
            return Err(DbError::InvalidArgument(format!(
                "body length {} does not fit the frame length field",
                body_len
            )));
        }
        Ok(Self {
            version: PROTO_VERSION,
            msg_type,
            body_len,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let word = ((self.version as u64) << 56) | ((self.msg_type as u64) << 48) | self.body_len;
        word.to_be_bytes()
    }

    /// Decodes a header, rejecting unknown versions and types.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let word = u64::from_be_bytes(*bytes);
        let version = (word >> 56) as u8;
        let raw_type = ((word >> 48) & 0xff) as u8;
        let body_len = word & MAX_LENGTH_FIELD;

        if version != PROTO_VERSION {
            return Err(DbError::Protocol(format!(
                "unexpected protocol version {} (expected {})",
                version, PROTO_VERSION
            )));
        }
        let msg_type = MessageType::from_u8(raw_type).ok_or_else(|| {
            DbError::Protocol(format!("unknown message type {}", raw_type))
        })?;
        if body_len > MAX_BODY_SIZE {
            return Err(DbError::Protocol(format!(
                "declared body length {} exceeds limit {}",
                body_len, MAX_BODY_SIZE
            )));
        }

        Ok(Self {
            version,
            msg_type,
            body_len,
        })
    }

    /// Checks the header against the type the request expects back.
    ///
    /// Data messages may come back compressed.
    pub fn expect(&self, expected: MessageType) -> Result<()> {
        let accepted = self.msg_type == expected
            || (expected == MessageType::Message && self.msg_type == MessageType::Compressed);
        if accepted {
            Ok(())
        } else {
            Err(DbError::Protocol(format!(
                "expected {} frame, received {}",
                expected, self.msg_type
            )))
        }
    }
}

/// A decoded frame: header plus exactly `header.body_len` bytes of body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, body: Vec<u8>) -> Result<Self> {
        let header = FrameHeader::new(msg_type, body.len())?;
        Ok(Self { header, body })
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses one complete frame from `bytes`, which must hold nothing else.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DbError::Protocol(format!(
                "frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = FrameHeader::decode(&raw)?;
        let body = &bytes[HEADER_SIZE..];
        if body.len() as u64 != header.body_len {
            return Err(DbError::Protocol(format!(
                "frame declares {} body bytes but carries {}",
                header.body_len,
                body.len()
            )));
        }
        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }
}

/// Encodes `body` behind a header of the given type.
pub fn encode_frame(msg_type: MessageType, body: &[u8]) -> Result<Vec<u8>> {
    let header = FrameHeader::new(msg_type, body.len())?;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    Ok(out)
}
