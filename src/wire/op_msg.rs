//! OP_MSG body: the general-purpose request/response frame.

use std::fmt;

use crate::document::Document;

use super::error::WireError;

/// Flag bit 0: a CRC-32C checksum trails the sections.
pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
/// Flag bit 1: more messages follow, no response expected yet.
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
/// Flag bit 16: the client allows exhaust cursors.
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

// Bits 0-15 are required: a message carrying an unrecognized one must be
// rejected. Bits 16-31 are optional and pass through.
const KNOWN_REQUIRED_FLAGS: u32 = FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME;

/// One payload section of an OP_MSG body.
#[derive(Clone, Debug, PartialEq)]
pub enum Section {
    /// Kind 0: a single document. A well-formed message has exactly one.
    Document(Document),
    /// Kind 1: a named sequence of documents.
    Sequence {
        /// The sequence identifier (an argument name such as `documents`).
        identifier: String,
        /// The payload documents, in order.
        documents: Vec<Document>,
    },
}

/// Decoded OP_MSG body.
///
/// Construction and decoding both enforce that exactly one kind-0 section is
/// present, so [`document`](OpMsg::document) is infallible.
#[derive(Clone, Debug, PartialEq)]
pub struct OpMsg {
    flag_bits: u32,
    sections: Vec<Section>,
    checksum: Option<u32>,
}

impl OpMsg {
    /// Build a body holding a single kind-0 section.
    pub fn new(document: Document) -> Self {
        Self {
            flag_bits: 0,
            sections: vec![Section::Document(document)],
            checksum: None,
        }
    }

    /// Build a body from explicit sections, enforcing the one-kind-0 rule.
    pub fn with_sections(sections: Vec<Section>) -> Result<Self, WireError> {
        let kind0 = sections
            .iter()
            .filter(|s| matches!(s, Section::Document(_)))
            .count();
        if kind0 != 1 {
            return Err(WireError::validation(format!(
                "expected exactly one document section, got {kind0}"
            )));
        }

        Ok(Self {
            flag_bits: 0,
            sections,
            checksum: None,
        })
    }

    /// The flag bits.
    pub fn flag_bits(&self) -> u32 {
        self.flag_bits
    }

    /// All sections, in wire order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The single kind-0 document. Its first key is the command name.
    pub fn document(&self) -> &Document {
        self.sections
            .iter()
            .find_map(|s| match s {
                Section::Document(doc) => Some(doc),
                Section::Sequence { .. } => None,
            })
            .expect("OpMsg invariant: exactly one document section")
    }

    /// Documents of the kind-1 section named `identifier`, if present.
    pub fn sequence(&self, identifier: &str) -> Option<&[Document]> {
        self.sections.iter().find_map(|s| match s {
            Section::Sequence {
                identifier: id,
                documents,
            } if id == identifier => Some(documents.as_slice()),
            _ => None,
        })
    }

    /// Encode to the on-wire byte form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.flag_bits.to_le_bytes());

        for section in &self.sections {
            match section {
                Section::Document(doc) => {
                    out.push(0);
                    out.extend_from_slice(&doc.encode());
                }
                Section::Sequence {
                    identifier,
                    documents,
                } => {
                    out.push(1);

                    let size_at = out.len();
                    out.extend_from_slice(&0i32.to_le_bytes());
                    out.extend_from_slice(identifier.as_bytes());
                    out.push(0);
                    for doc in documents {
                        out.extend_from_slice(&doc.encode());
                    }

                    // The size field includes itself but not the kind byte.
                    let size = (out.len() - size_at) as i32;
                    out[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
                }
            }
        }

        if let Some(checksum) = self.checksum {
            out.extend_from_slice(&checksum.to_le_bytes());
        }

        out
    }

    /// Decode from the on-wire byte form, consuming `buf` exactly.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, WireError> {
        let mut input = buf;

        let flag_bits = read_u32(&mut input)?;
        let unknown_required = flag_bits & 0xFFFF & !KNOWN_REQUIRED_FLAGS;
        if unknown_required != 0 {
            return Err(WireError::validation(format!(
                "unknown required flag bits 0x{unknown_required:04x}"
            )));
        }

        let checksum_len = if flag_bits & FLAG_CHECKSUM_PRESENT != 0 {
            4
        } else {
            0
        };
        if input.len() < checksum_len {
            return Err(WireError::validation("message too short for checksum"));
        }
        let (mut input, mut checksum_bytes) = input.split_at(input.len() - checksum_len);

        let mut sections = Vec::new();
        let mut have_kind0 = false;
        while !input.is_empty() {
            match read_u8(&mut input)? {
                0 => {
                    if have_kind0 {
                        return Err(WireError::validation("duplicate document section"));
                    }
                    have_kind0 = true;
                    sections.push(Section::Document(Document::decode_prefix(&mut input)?));
                }
                1 => {
                    let declared = read_i32(&mut input)?;
                    // The counter covers itself, the identifier, and the documents.
                    if declared < 5 || (declared as usize - 4) > input.len() {
                        return Err(WireError::validation(format!(
                            "section size {declared} out of bounds"
                        )));
                    }
                    let (mut body, rest) = input.split_at(declared as usize - 4);
                    input = rest;

                    let identifier = read_cstring(&mut body)?;
                    let mut documents = Vec::new();
                    while !body.is_empty() {
                        documents.push(Document::decode_prefix(&mut body)?);
                    }

                    sections.push(Section::Sequence {
                        identifier,
                        documents,
                    });
                }
                kind => {
                    return Err(WireError::validation(format!(
                        "unknown section kind {kind}"
                    )));
                }
            }
        }

        if !have_kind0 {
            return Err(WireError::validation("message has no document section"));
        }

        // TODO: verify the CRC-32C when checksumPresent is set instead of
        // carrying it through unchecked.
        let checksum = if checksum_len == 4 {
            Some(read_u32(&mut checksum_bytes)?)
        } else {
            None
        };

        Ok(Self {
            flag_bits,
            sections,
            checksum,
        })
    }
}

impl fmt::Display for OpMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "flags: 0x{:08x}", self.flag_bits)?;
        for section in &self.sections {
            match section {
                Section::Document(doc) => writeln!(f, "section 0: {doc}")?,
                Section::Sequence {
                    identifier,
                    documents,
                } => {
                    writeln!(f, "section 1 {identifier:?} ({}):", documents.len())?;
                    for doc in documents {
                        writeln!(f, "  {doc}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_u8(input: &mut &[u8]) -> Result<u8, WireError> {
    let (&byte, rest) = input
        .split_first()
        .ok_or_else(|| WireError::validation("truncated section"))?;
    *input = rest;
    Ok(byte)
}

fn read_u32(input: &mut &[u8]) -> Result<u32, WireError> {
    if input.len() < 4 {
        return Err(WireError::validation("truncated 32-bit field"));
    }
    let value = u32::from_le_bytes(input[..4].try_into().unwrap());
    *input = &input[4..];
    Ok(value)
}

fn read_i32(input: &mut &[u8]) -> Result<i32, WireError> {
    read_u32(input).map(|v| v as i32)
}

fn read_cstring(input: &mut &[u8]) -> Result<String, WireError> {
    let nul = input
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WireError::validation("unterminated identifier"))?;
    let (bytes, rest) = input.split_at(nul);
    *input = &rest[1..];
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WireError::validation("identifier is not valid UTF-8"))
}
