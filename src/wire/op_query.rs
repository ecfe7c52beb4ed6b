//! OP_QUERY body: tolerated only far enough to serve the legacy handshake.

use std::fmt;

use crate::document::Document;

use super::error::WireError;

/// Decoded OP_QUERY body. Interpretation beyond extracting the embedded
/// document and namespace is delegated to the handler.
#[derive(Clone, Debug, PartialEq)]
pub struct OpQuery {
    /// Legacy query flags, passed through.
    pub flags: u32,
    /// `<database>.<collection>` namespace.
    pub full_collection_name: String,
    /// Documents to skip.
    pub number_to_skip: i32,
    /// Batch-size hint.
    pub number_to_return: i32,
    /// The query document; its first key is the command name for handshakes.
    pub query: Document,
    /// Optional projection document.
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    /// Encode to the on-wire byte form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(self.full_collection_name.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.number_to_skip.to_le_bytes());
        out.extend_from_slice(&self.number_to_return.to_le_bytes());
        out.extend_from_slice(&self.query.encode());
        if let Some(selector) = &self.return_fields_selector {
            out.extend_from_slice(&selector.encode());
        }
        out
    }

    /// Decode from the on-wire byte form, consuming `buf` exactly.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, WireError> {
        let mut input = buf;

        if input.len() < 4 {
            return Err(WireError::validation("truncated query flags"));
        }
        let flags = u32::from_le_bytes(input[..4].try_into().unwrap());
        input = &input[4..];

        let nul = input
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| WireError::validation("unterminated namespace"))?;
        let full_collection_name = String::from_utf8(input[..nul].to_vec())
            .map_err(|_| WireError::validation("namespace is not valid UTF-8"))?;
        input = &input[nul + 1..];

        if input.len() < 8 {
            return Err(WireError::validation("truncated query counters"));
        }
        let number_to_skip = i32::from_le_bytes(input[..4].try_into().unwrap());
        let number_to_return = i32::from_le_bytes(input[4..8].try_into().unwrap());
        input = &input[8..];

        let query = Document::decode_prefix(&mut input)?;

        let return_fields_selector = if input.is_empty() {
            None
        } else {
            Some(Document::decode_prefix(&mut input)?)
        };

        if !input.is_empty() {
            return Err(WireError::validation("trailing bytes after query body"));
        }

        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}

impl fmt::Display for OpQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "query ns: {:?}, flags: 0x{:08x}, skip: {}, return: {}",
            self.full_collection_name, self.flags, self.number_to_skip, self.number_to_return
        )?;
        writeln!(f, "query: {}", self.query)?;
        if let Some(selector) = &self.return_fields_selector {
            writeln!(f, "selector: {selector}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::document::Value;

    fn handshake() -> OpQuery {
        OpQuery {
            flags: 0,
            full_collection_name: "admin.$cmd".into(),
            number_to_skip: 0,
            number_to_return: -1,
            query: doc! {"isMaster" => Value::Int32(1)},
            return_fields_selector: None,
        }
    }

    #[test]
    fn roundtrip_without_selector() {
        let query = handshake();
        assert_eq!(OpQuery::unmarshal(&query.marshal()).unwrap(), query);
    }

    #[test]
    fn roundtrip_with_selector() {
        let mut query = handshake();
        query.return_fields_selector = Some(doc! {"_id" => Value::Int32(0)});
        assert_eq!(OpQuery::unmarshal(&query.marshal()).unwrap(), query);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = handshake().marshal();
        bytes.extend_from_slice(&[0, 0, 0]);
        assert!(OpQuery::unmarshal(&bytes).unwrap_err().is_validation());
    }
}
