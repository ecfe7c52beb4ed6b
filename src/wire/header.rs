//! Fixed-size message header.

use std::fmt;

use super::error::WireError;
use super::op_code::OpCode;

/// Header length in bytes; every size computation relies on it.
pub const HEADER_LEN: usize = 16;

/// Fixed-size record prefixing every wire message. All fields are
/// little-endian signed 32-bit integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total message length, including the header itself.
    pub message_length: i32,
    /// Identifier chosen by the sender of the message.
    pub request_id: i32,
    /// For responses, the `request_id` of the triggering request; 0 otherwise.
    pub response_to: i32,
    /// Operation code of the body.
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Encode into the 16-byte wire form.
    pub fn marshal(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.as_i32().to_le_bytes());
        out
    }

    /// Decode from the 16-byte wire form.
    pub fn unmarshal(buf: [u8; HEADER_LEN]) -> Result<Self, WireError> {
        let header = Self {
            message_length: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            request_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            response_to: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            op_code: OpCode::from(i32::from_le_bytes(buf[12..16].try_into().unwrap())),
        };

        if header.message_length < HEADER_LEN as i32 {
            return Err(WireError::validation(format!(
                "message length {} is smaller than the header",
                header.message_length
            ))
            .with_header(header));
        }

        Ok(header)
    }
}

impl fmt::Display for MsgHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "length: {}, id: {}, response_to: {}, opcode: {}",
            self.message_length, self.request_id, self.response_to, self.op_code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let header = MsgHeader {
            message_length: 100,
            request_id: 7,
            response_to: 3,
            op_code: OpCode::Msg,
        };
        assert_eq!(MsgHeader::unmarshal(header.marshal()).unwrap(), header);
    }

    #[test]
    fn little_endian_layout() {
        let header = MsgHeader {
            message_length: 0x0102_0304,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Reply,
        };
        let bytes = header.marshal();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[12..16], &[1, 0, 0, 0]);
    }

    #[test]
    fn undersized_length_is_validation_error() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = 15; // one byte short of the header itself
        let err = MsgHeader::unmarshal(bytes).unwrap_err();
        assert!(err.is_validation());
    }
}
