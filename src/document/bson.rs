//! Binary encoding of the document model.
//!
//! Layout: `i32 total_length (including itself); element*; 0x00` where each
//! element is `type_byte; cstring key; value`. All integers are
//! little-endian; lengths are signed 32-bit and must be non-negative.

use snafu::Snafu;

use super::Array;
use super::Binary;
use super::Document;
use super::ObjectId;
use super::Regex;
use super::Timestamp;
use super::Value;

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_DATE_TIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_REGEX: u8 = 0x0B;
const TAG_INT32: u8 = 0x10;
const TAG_TIMESTAMP: u8 = 0x11;
const TAG_INT64: u8 = 0x12;

/// Nesting bound for decode; deeper input is structurally invalid.
const MAX_DEPTH: usize = 100;

/// Structural decode failures.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BsonError {
    /// Input ended before the declared size was consumed.
    #[snafu(display("truncated input: need {need} more bytes"))]
    Truncated {
        /// How many bytes were missing.
        need: usize,
    },

    /// A declared length did not match the consumed bytes.
    #[snafu(display("declared length {declared} does not match content"))]
    LengthMismatch {
        /// The length carried by the input.
        declared: i64,
    },

    /// An element carried an unknown type tag.
    #[snafu(display("unknown element type 0x{tag:02x} for key {key:?}"))]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
        /// The key the element was decoded under.
        key: String,
    },

    /// A string was not valid UTF-8.
    #[snafu(display("invalid UTF-8 in {what}"))]
    InvalidUtf8 {
        /// Which element was being decoded.
        what: &'static str,
    },

    /// Documents nested beyond the supported depth.
    #[snafu(display("document nesting exceeds {MAX_DEPTH} levels"))]
    TooDeep,

    /// A boolean byte was neither 0 nor 1.
    #[snafu(display("invalid boolean byte 0x{byte:02x}"))]
    InvalidBool {
        /// The offending byte.
        byte: u8,
    },
}

/// Encode `doc` into a standalone byte vector.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_document(&mut out, doc);
    out
}

/// Decode one document from the front of `input`, consuming exactly the
/// declared bytes and leaving the rest in place.
pub(crate) fn decode_prefix(input: &mut &[u8]) -> Result<Document, BsonError> {
    read_document(input, 0)
}

/// Decode a document, requiring that `buf` is consumed exactly.
pub fn decode_document(buf: &[u8]) -> Result<Document, BsonError> {
    let mut input = buf;
    let doc = read_document(&mut input, 0)?;
    if !input.is_empty() {
        return Err(BsonError::LengthMismatch {
            declared: buf.len() as i64,
        });
    }
    Ok(doc)
}

fn write_document(out: &mut Vec<u8>, doc: &Document) {
    let start = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());

    for (key, value) in doc.iter() {
        write_element(out, key, value);
    }
    out.push(0);

    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn write_array(out: &mut Vec<u8>, array: &Array) {
    let start = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());

    // Arrays are documents keyed by decimal indexes.
    let mut key = String::new();
    for (i, value) in array.iter().enumerate() {
        key.clear();
        let mut n = i;
        // itoa by hand to avoid a transient String per element
        if n == 0 {
            key.push('0');
        } else {
            let mut digits = [0u8; 20];
            let mut at = digits.len();
            while n > 0 {
                at -= 1;
                digits[at] = b'0' + (n % 10) as u8;
                n /= 10;
            }
            key.push_str(std::str::from_utf8(&digits[at..]).unwrap());
        }
        write_element(out, &key, value);
    }
    out.push(0);

    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn write_element(out: &mut Vec<u8>, key: &str, value: &Value) {
    match value {
        Value::Double(v) => {
            out.push(TAG_DOUBLE);
            write_cstring(out, key);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::String(v) => {
            out.push(TAG_STRING);
            write_cstring(out, key);
            write_string(out, v);
        }
        Value::Document(v) => {
            out.push(TAG_DOCUMENT);
            write_cstring(out, key);
            write_document(out, v);
        }
        Value::Array(v) => {
            out.push(TAG_ARRAY);
            write_cstring(out, key);
            write_array(out, v);
        }
        Value::Binary(v) => {
            out.push(TAG_BINARY);
            write_cstring(out, key);
            out.extend_from_slice(&(v.bytes.len() as i32).to_le_bytes());
            out.push(v.subtype);
            out.extend_from_slice(&v.bytes);
        }
        Value::ObjectId(v) => {
            out.push(TAG_OBJECT_ID);
            write_cstring(out, key);
            out.extend_from_slice(&v.0);
        }
        Value::Bool(v) => {
            out.push(TAG_BOOL);
            write_cstring(out, key);
            out.push(u8::from(*v));
        }
        Value::DateTime(v) => {
            out.push(TAG_DATE_TIME);
            write_cstring(out, key);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Null => {
            out.push(TAG_NULL);
            write_cstring(out, key);
        }
        Value::Regex(v) => {
            out.push(TAG_REGEX);
            write_cstring(out, key);
            write_cstring(out, &v.pattern);
            write_cstring(out, &v.options);
        }
        Value::Timestamp(v) => {
            out.push(TAG_TIMESTAMP);
            write_cstring(out, key);
            out.extend_from_slice(&v.i.to_le_bytes());
            out.extend_from_slice(&v.t.to_le_bytes());
        }
        Value::Int32(v) => {
            out.push(TAG_INT32);
            write_cstring(out, key);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Int64(v) => {
            out.push(TAG_INT64);
            write_cstring(out, key);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn write_cstring(out: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0), "cstring with embedded NUL");
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn read_document(input: &mut &[u8], depth: usize) -> Result<Document, BsonError> {
    let mut doc = Document::new();
    read_elements(input, depth, |key, value| doc.set(key, value))?;
    Ok(doc)
}

fn read_array(input: &mut &[u8], depth: usize) -> Result<Array, BsonError> {
    // Index keys are not validated; element order is what matters.
    let mut elements = Vec::new();
    read_elements(input, depth, |_key, value| elements.push(value))?;
    Ok(elements.into_iter().collect())
}

fn read_elements(
    input: &mut &[u8],
    depth: usize,
    mut emit: impl FnMut(String, Value),
) -> Result<(), BsonError> {
    if depth > MAX_DEPTH {
        return Err(BsonError::TooDeep);
    }

    let declared = read_i32(input)?;
    if declared < 5 {
        return Err(BsonError::LengthMismatch {
            declared: declared as i64,
        });
    }
    let body_len = declared as usize - 4;
    if input.len() < body_len {
        return Err(BsonError::Truncated {
            need: body_len - input.len(),
        });
    }

    let (mut body, rest) = input.split_at(body_len);
    *input = rest;

    loop {
        let tag = read_u8(&mut body)?;
        if tag == 0 {
            break;
        }
        let key = read_cstring(&mut body, "key")?;
        let value = read_value(&mut body, tag, &key, depth)?;
        emit(key, value);
    }

    if !body.is_empty() {
        return Err(BsonError::LengthMismatch {
            declared: declared as i64,
        });
    }
    Ok(())
}

fn read_value(
    input: &mut &[u8],
    tag: u8,
    key: &str,
    depth: usize,
) -> Result<Value, BsonError> {
    let value = match tag {
        TAG_DOUBLE => Value::Double(f64::from_le_bytes(read_fixed::<8>(input)?)),
        TAG_STRING => Value::String(read_string(input)?),
        TAG_DOCUMENT => Value::Document(read_document(input, depth + 1)?),
        TAG_ARRAY => Value::Array(read_array(input, depth + 1)?),
        TAG_BINARY => {
            let len = read_i32(input)?;
            if len < 0 {
                return Err(BsonError::LengthMismatch {
                    declared: len as i64,
                });
            }
            let subtype = read_u8(input)?;
            let bytes = read_bytes(input, len as usize)?;
            Value::Binary(Binary { subtype, bytes })
        }
        TAG_OBJECT_ID => Value::ObjectId(ObjectId(read_fixed::<12>(input)?)),
        TAG_BOOL => match read_u8(input)? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            byte => return Err(BsonError::InvalidBool { byte }),
        },
        TAG_DATE_TIME => Value::DateTime(i64::from_le_bytes(read_fixed::<8>(input)?)),
        TAG_NULL => Value::Null,
        TAG_REGEX => Value::Regex(Regex {
            pattern: read_cstring(input, "regex pattern")?,
            options: read_cstring(input, "regex options")?,
        }),
        TAG_TIMESTAMP => {
            let i = u32::from_le_bytes(read_fixed::<4>(input)?);
            let t = u32::from_le_bytes(read_fixed::<4>(input)?);
            Value::Timestamp(Timestamp { t, i })
        }
        TAG_INT32 => Value::Int32(i32::from_le_bytes(read_fixed::<4>(input)?)),
        TAG_INT64 => Value::Int64(i64::from_le_bytes(read_fixed::<8>(input)?)),
        tag => {
            return Err(BsonError::UnknownTag {
                tag,
                key: key.to_owned(),
            })
        }
    };
    Ok(value)
}

fn read_u8(input: &mut &[u8]) -> Result<u8, BsonError> {
    let (&byte, rest) = input.split_first().ok_or(BsonError::Truncated { need: 1 })?;
    *input = rest;
    Ok(byte)
}

fn read_i32(input: &mut &[u8]) -> Result<i32, BsonError> {
    Ok(i32::from_le_bytes(read_fixed::<4>(input)?))
}

fn read_fixed<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], BsonError> {
    if input.len() < N {
        return Err(BsonError::Truncated {
            need: N - input.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&input[..N]);
    *input = &input[N..];
    Ok(out)
}

fn read_bytes(input: &mut &[u8], n: usize) -> Result<Vec<u8>, BsonError> {
    if input.len() < n {
        return Err(BsonError::Truncated {
            need: n - input.len(),
        });
    }
    let (bytes, rest) = input.split_at(n);
    *input = rest;
    Ok(bytes.to_vec())
}

fn read_cstring(input: &mut &[u8], what: &'static str) -> Result<String, BsonError> {
    let nul = input
        .iter()
        .position(|&b| b == 0)
        .ok_or(BsonError::Truncated { need: 1 })?;
    let (bytes, rest) = input.split_at(nul);
    *input = &rest[1..];
    String::from_utf8(bytes.to_vec()).map_err(|_| BsonError::InvalidUtf8 { what })
}

fn read_string(input: &mut &[u8]) -> Result<String, BsonError> {
    let len = read_i32(input)?;
    if len < 1 {
        return Err(BsonError::LengthMismatch {
            declared: len as i64,
        });
    }
    let mut bytes = read_bytes(input, len as usize)?;
    match bytes.pop() {
        Some(0) => {}
        _ => {
            return Err(BsonError::LengthMismatch {
                declared: len as i64,
            })
        }
    }
    String::from_utf8(bytes).map_err(|_| BsonError::InvalidUtf8 { what: "string" })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::doc;

    fn sample() -> Document {
        let mut inner = Document::new();
        inner.set("x", Value::Int64(-5));

        doc! {
            "find" => Value::String("items".into()),
            "n" => Value::Int32(42),
            "f" => Value::Double(1.5),
            "ok" => Value::Bool(true),
            "nothing" => Value::Null,
            "sub" => Value::Document(inner),
            "arr" => Value::Array([Value::Int32(1), Value::String("two".into())].into_iter().collect()),
            "bin" => Value::Binary(Binary { subtype: 0x00, bytes: vec![1, 2, 3] }),
            "oid" => Value::ObjectId(ObjectId([7; 12])),
            "when" => Value::DateTime(1_700_000_000_000),
            "re" => Value::Regex(Regex { pattern: "^a".into(), options: "i".into() }),
            "ts" => Value::Timestamp(Timestamp { t: 100, i: 2 }),
        }
    }

    #[test]
    fn roundtrip_all_types() {
        let doc = sample();
        let bytes = encode_document(&doc);
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn empty_document_is_five_bytes() {
        let bytes = encode_document(&Document::new());
        assert_eq!(bytes, vec![5, 0, 0, 0, 0]);
        assert_eq!(decode_document(&bytes).unwrap(), Document::new());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_document(&Document::new());
        bytes.push(0);
        assert!(matches!(
            decode_document(&bytes),
            Err(BsonError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn truncated_rejected() {
        let bytes = encode_document(&sample());
        for cut in [1, 4, 5, bytes.len() - 1] {
            assert!(decode_document(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn undersized_length_rejected() {
        assert!(matches!(
            decode_document(&[4, 0, 0, 0]),
            Err(BsonError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_tag_rejected() {
        // {<0x7f> "k": ...}
        let bytes = [8, 0, 0, 0, 0x7f, b'k', 0, 0];
        assert!(matches!(
            decode_document(&bytes),
            Err(BsonError::UnknownTag { tag: 0x7f, .. })
        ));
    }

    prop_compose! {
        fn arb_scalar()(choice in 0usize..8, n in any::<i64>(), s in "[a-z]{0,12}", b in any::<bool>()) -> Value {
            match choice {
                0 => Value::Double(n as f64),
                1 => Value::String(s),
                2 => Value::Bool(b),
                3 => Value::DateTime(n),
                4 => Value::Null,
                5 => Value::Int32(n as i32),
                6 => Value::Int64(n),
                _ => Value::Timestamp(Timestamp { t: n as u32, i: (n >> 32) as u32 }),
            }
        }
    }

    prop_compose! {
        fn arb_document()(pairs in prop::collection::vec(("[a-z][a-z0-9]{0,8}", arb_scalar()), 0..8)) -> Document {
            let mut doc = Document::new();
            for (k, v) in pairs {
                doc.set(k, v);
            }
            doc
        }
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(doc in arb_document()) {
            let bytes = encode_document(&doc);
            let decoded = decode_document(&bytes).unwrap();
            prop_assert_eq!(&decoded, &doc);

            // Re-encoding is byte-identical.
            prop_assert_eq!(encode_document(&decoded), bytes);
        }
    }
}
