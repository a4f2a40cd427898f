use crate::core::{DbError, Result, ResultCode};

/// Size of the header at the start of every data message body.
pub const MESSAGE_HEADER_SIZE: usize = 22;

/// `info3` flag marking the final message of a multi-record stream.
pub const INFO3_LAST: u8 = 1;

/// Fixed 22-byte header of a data message. Fields are big-endian.
///
/// Only the parts the dispatch core needs are interpreted here; record
/// payloads following the header are opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub header_size: u8,
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: ResultCode,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MessageHeader {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < MESSAGE_HEADER_SIZE {
            return Err(DbError::Protocol(format!(
                "message body of {} bytes is shorter than its {}-byte header",
                body.len(),
                MESSAGE_HEADER_SIZE
            )));
        }

        let u32_at = |at: usize| u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        let u16_at = |at: usize| u16::from_be_bytes([body[at], body[at + 1]]);

        Ok(Self {
            header_size: body[0],
            info1: body[1],
            info2: body[2],
            info3: body[3],
            result_code: ResultCode::from(body[5]),
            generation: u32_at(6),
            record_ttl: u32_at(10),
            transaction_ttl: u32_at(14),
            n_fields: u16_at(18),
            n_ops: u16_at(20),
        })
    }

    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out[0] = self.header_size;
        out[1] = self.info1;
        out[2] = self.info2;
        out[3] = self.info3;
        out[5] = self.result_code.0 as u8;
        out[6..10].copy_from_slice(&self.generation.to_be_bytes());
        out[10..14].copy_from_slice(&self.record_ttl.to_be_bytes());
        out[14..18].copy_from_slice(&self.transaction_ttl.to_be_bytes());
        out[18..20].copy_from_slice(&self.n_fields.to_be_bytes());
        out[20..22].copy_from_slice(&self.n_ops.to_be_bytes());
        out
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            header_size: MESSAGE_HEADER_SIZE as u8,
            info1: 0,
            info2: 0,
            info3: 0,
            result_code: ResultCode::OK,
            generation: 0,
            record_ttl: 0,
            transaction_ttl: 0,
            n_fields: 0,
            n_ops: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reads_result_code_and_last_flag() {
        let mut body = vec![0u8; MESSAGE_HEADER_SIZE + 4];
        body[0] = 22;
        body[3] = INFO3_LAST;
        body[5] = 2;
        body[6..10].copy_from_slice(&7u32.to_be_bytes());

        let header = MessageHeader::parse(&body).unwrap();
        assert_eq!(header.result_code, ResultCode::RECORD_NOT_FOUND);
        assert_eq!(header.generation, 7);
        assert!(header.is_last());
    }

    #[test]
    fn test_short_body_is_protocol_error() {
        assert!(matches!(
            MessageHeader::parse(&[0u8; 10]),
            Err(DbError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_matches_parse_offsets() {
        let header = MessageHeader {
            result_code: ResultCode::DEVICE_OVERLOAD,
            n_ops: 3,
            ..MessageHeader::default()
        };
        let bytes = header.encode();
        assert_eq!(bytes[5], 18);
        assert_eq!(&bytes[20..22], &[0, 3]);
    }
}
