//! OP_REPLY body: the response form for OP_QUERY.

use std::fmt;

use crate::document::Document;

use super::error::WireError;

/// Decoded OP_REPLY body.
#[derive(Clone, Debug, PartialEq)]
pub struct OpReply {
    /// Response flags, passed through.
    pub response_flags: u32,
    /// Cursor identifier; 0 when the reply is complete.
    pub cursor_id: i64,
    /// Offset of the first returned document.
    pub starting_from: i32,
    /// Returned documents, in order.
    pub documents: Vec<Document>,
}

impl OpReply {
    /// A complete single-document reply.
    pub fn with_document(document: Document) -> Self {
        Self {
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents: vec![document],
        }
    }

    /// Encode to the on-wire byte form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.response_flags.to_le_bytes());
        out.extend_from_slice(&self.cursor_id.to_le_bytes());
        out.extend_from_slice(&self.starting_from.to_le_bytes());
        out.extend_from_slice(&(self.documents.len() as i32).to_le_bytes());
        for doc in &self.documents {
            out.extend_from_slice(&doc.encode());
        }
        out
    }

    /// Decode from the on-wire byte form, consuming `buf` exactly.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, WireError> {
        let mut input = buf;

        if input.len() < 20 {
            return Err(WireError::validation("truncated reply prelude"));
        }
        let response_flags = u32::from_le_bytes(input[..4].try_into().unwrap());
        let cursor_id = i64::from_le_bytes(input[4..12].try_into().unwrap());
        let starting_from = i32::from_le_bytes(input[12..16].try_into().unwrap());
        let number_returned = i32::from_le_bytes(input[16..20].try_into().unwrap());
        input = &input[20..];

        if number_returned < 0 {
            return Err(WireError::validation(format!(
                "negative document count {number_returned}"
            )));
        }

        let mut documents = Vec::with_capacity(number_returned.min(64) as usize);
        for _ in 0..number_returned {
            documents.push(Document::decode_prefix(&mut input)?);
        }

        if !input.is_empty() {
            return Err(WireError::validation("trailing bytes after reply body"));
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}

impl fmt::Display for OpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "reply flags: 0x{:08x}, cursor: {}, from: {}, returned: {}",
            self.response_flags,
            self.cursor_id,
            self.starting_from,
            self.documents.len()
        )?;
        for doc in &self.documents {
            writeln!(f, "{doc}")?;
        }
        Ok(())
    }
}
