//! Wire codec: framing, validation, and encode/decode of protocol messages.
//!
//! Every message is a 16-byte little-endian header followed by an opcode-
//! tagged body. Decoding is length-prefixed and bounded: the declared length
//! must cover the header, must not exceed the configured maximum, and the
//! body must consume exactly the declared remainder.
//!
//! Error discipline: [`WireError::Validation`] for structural failures (the
//! connection survives), [`WireError::ZeroRead`] for a clean disconnect at a
//! message boundary, and [`WireError::Io`] for everything else.

mod error;
mod header;
mod op_code;
mod op_msg;
mod op_query;
mod op_reply;

use std::fmt;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

pub use error::WireError;
pub use header::HEADER_LEN;
pub use header::MsgHeader;
pub use op_code::OpCode;
pub use op_msg::OpMsg;
pub use op_msg::Section;
pub use op_msg::FLAG_CHECKSUM_PRESENT;
pub use op_msg::FLAG_EXHAUST_ALLOWED;
pub use op_msg::FLAG_MORE_TO_COME;
pub use op_query::OpQuery;
pub use op_reply::OpReply;

/// Default upper bound on a message's declared length: 48 MiB.
///
/// Checked against the header before the body is allocated, so a hostile
/// length can never drive a large allocation.
pub const MAX_MESSAGE_LEN: i32 = 48 * 1024 * 1024;

/// Opcode-tagged message body.
#[derive(Clone, Debug, PartialEq)]
pub enum MsgBody {
    /// OP_MSG: the general-purpose request/response frame.
    Msg(OpMsg),
    /// OP_QUERY: the legacy handshake request.
    Query(OpQuery),
    /// OP_REPLY: the response form for OP_QUERY.
    Reply(OpReply),
    /// A recognized-but-unrouted or unknown opcode, carried opaquely.
    /// Routing such a body is fatal for the connection.
    Legacy {
        /// The opcode the body arrived under.
        op_code: OpCode,
        /// The raw body bytes.
        bytes: Vec<u8>,
    },
}

impl MsgBody {
    /// The opcode this body travels under.
    pub fn op_code(&self) -> OpCode {
        match self {
            MsgBody::Msg(_) => OpCode::Msg,
            MsgBody::Query(_) => OpCode::Query,
            MsgBody::Reply(_) => OpCode::Reply,
            MsgBody::Legacy { op_code, .. } => *op_code,
        }
    }

    /// Encode to the on-wire byte form.
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            MsgBody::Msg(msg) => msg.marshal(),
            MsgBody::Query(query) => query.marshal(),
            MsgBody::Reply(reply) => reply.marshal(),
            MsgBody::Legacy { bytes, .. } => bytes.clone(),
        }
    }

    /// Decode the body for `op_code`, consuming `bytes` exactly.
    pub fn unmarshal(op_code: OpCode, bytes: &[u8]) -> Result<Self, WireError> {
        match op_code {
            OpCode::Msg => Ok(MsgBody::Msg(OpMsg::unmarshal(bytes)?)),
            OpCode::Query => Ok(MsgBody::Query(OpQuery::unmarshal(bytes)?)),
            OpCode::Reply => Ok(MsgBody::Reply(OpReply::unmarshal(bytes)?)),
            op_code => Ok(MsgBody::Legacy {
                op_code,
                bytes: bytes.to_vec(),
            }),
        }
    }
}

impl fmt::Display for MsgBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgBody::Msg(msg) => msg.fmt(f),
            MsgBody::Query(query) => query.fmt(f),
            MsgBody::Reply(reply) => reply.fmt(f),
            MsgBody::Legacy { op_code, bytes } => {
                writeln!(f, "{op_code} body ({} bytes)", bytes.len())
            }
        }
    }
}

/// Read one message with the default length bound.
pub async fn read_message<R>(reader: &mut R) -> Result<(MsgHeader, MsgBody), WireError>
where
    R: AsyncRead + Unpin,
{
    read_message_limited(reader, MAX_MESSAGE_LEN).await
}

/// Read one message, bounding the declared length by `max_len`.
///
/// Reads exactly `message_length` bytes on success. An EOF before the first
/// byte of the header is [`WireError::ZeroRead`]; an EOF anywhere later is a
/// transport error.
pub async fn read_message_limited<R>(
    reader: &mut R,
    max_len: i32,
) -> Result<(MsgHeader, MsgBody), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(WireError::ZeroRead);
            }
            return Err(WireError::Io {
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }
        filled += n;
    }

    let header = MsgHeader::unmarshal(header_buf)?;
    if header.message_length > max_len {
        return Err(WireError::validation(format!(
            "message length {} exceeds the {max_len} byte limit",
            header.message_length
        ))
        .with_header(header));
    }

    let body_len = header.message_length as usize - HEADER_LEN;
    let mut body_buf = vec![0u8; body_len];
    reader.read_exact(&mut body_buf).await?;

    let body = MsgBody::unmarshal(header.op_code, &body_buf)
        .map_err(|err| err.with_header(header))?;
    Ok((header, body))
}

/// Write one message, recomputing the header length from the encoded body.
///
/// The caller is responsible for flushing.
pub async fn write_message<W>(
    writer: &mut W,
    header: &MsgHeader,
    body: &MsgBody,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = body.marshal();

    let header = MsgHeader {
        message_length: (HEADER_LEN + encoded.len()) as i32,
        ..*header
    };

    writer.write_all(&header.marshal()).await?;
    writer.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::doc;
    use crate::document::Document;
    use crate::document::Value;

    fn ping_body() -> MsgBody {
        MsgBody::Msg(OpMsg::new(
            doc! {"ping" => Value::Int32(1), "$db" => Value::String("admin".into())},
        ))
    }

    async fn roundtrip(header: MsgHeader, body: MsgBody) -> (MsgHeader, MsgBody) {
        let mut buf = Vec::new();
        write_message(&mut buf, &header, &body).await.unwrap();
        read_message(&mut buf.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn read_write_roundtrip() {
        let body = ping_body();
        let header = MsgHeader {
            message_length: 0, // recomputed by write_message
            request_id: 11,
            response_to: 0,
            op_code: OpCode::Msg,
        };

        let (got_header, got_body) = roundtrip(header, body.clone()).await;
        assert_eq!(got_body, body);
        assert_eq!(got_header.request_id, 11);
        assert_eq!(
            got_header.message_length as usize,
            HEADER_LEN + body.marshal().len()
        );
    }

    #[tokio::test]
    async fn zero_read_is_distinguished() {
        let err = read_message(&mut [].as_slice()).await.unwrap_err();
        assert!(err.is_zero_read());
    }

    #[tokio::test]
    async fn partial_header_is_transport_error() {
        let err = read_message(&mut [1u8, 0, 0].as_slice()).await.unwrap_err();
        assert!(matches!(err, WireError::Io { .. }));
    }

    #[tokio::test]
    async fn truncated_body_is_transport_error() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &MsgHeader {
                message_length: 0,
                request_id: 1,
                response_to: 0,
                op_code: OpCode::Msg,
            },
            &ping_body(),
        )
        .await
        .unwrap();
        buf.truncate(buf.len() - 1);

        let err = read_message(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, WireError::Io { .. }));
    }

    #[tokio::test]
    async fn undersized_declared_length_is_validation_error() {
        let header = MsgHeader {
            message_length: 15,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Msg,
        };
        let err = read_message(&mut header.marshal().as_slice())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn oversized_declared_length_is_validation_error() {
        let header = MsgHeader {
            message_length: MAX_MESSAGE_LEN + 1,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Msg,
        };
        let err = read_message(&mut header.marshal().as_slice())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn legacy_body_passes_through_opaque() {
        let body = MsgBody::Legacy {
            op_code: OpCode::Delete,
            bytes: vec![1, 2, 3, 4],
        };
        let header = MsgHeader {
            message_length: 0,
            request_id: 2,
            response_to: 0,
            op_code: OpCode::Delete,
        };

        let (got_header, got_body) = roundtrip(header, body.clone()).await;
        assert_eq!(got_body, body);
        assert_eq!(got_header.op_code, OpCode::Delete);
    }

    prop_compose! {
        fn arb_command_doc()(command in "[a-z]{1,10}", db in "[a-z]{1,8}", n in any::<i32>()) -> Document {
            doc! {
                command => Value::Int32(n),
                "$db" => Value::String(db),
            }
        }
    }

    proptest! {
        // Encoded length equality: message_length == HEADER_LEN + body bytes.
        #[test]
        fn written_length_matches_body(document in arb_command_doc(), request_id in any::<i32>()) {
            let body = MsgBody::Msg(OpMsg::new(document));
            let header = MsgHeader {
                message_length: 0,
                request_id,
                response_to: 0,
                op_code: OpCode::Msg,
            };

            let mut buf = Vec::new();
            futures::executor::block_on(write_message(&mut buf, &header, &body)).unwrap();

            let declared = i32::from_le_bytes(buf[0..4].try_into().unwrap());
            prop_assert_eq!(declared as usize, buf.len());
            prop_assert_eq!(declared as usize, HEADER_LEN + body.marshal().len());

            let (got_header, got_body) =
                futures::executor::block_on(read_message(&mut buf.as_slice())).unwrap();
            prop_assert_eq!(got_header.request_id, request_id);
            prop_assert_eq!(&got_body, &body);
        }
    }
}
