//! Ordered document model shared by the wire codec, handlers, and the
//! storage contract.
//!
//! A [`Document`] is an ordered sequence of `(key, Value)` pairs with a
//! *freeze* discipline: once frozen, any mutation is a programmer error and
//! panics. The storage contract freezes every document before it reaches a
//! backend, so backends can rely on inputs never changing under them.
//!
//! The model defines its own binary encoding (see [`bson`]); it is not a
//! serde data structure.

mod bson;

use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub use bson::BsonError;

/// A typed value held by a [`Document`] or [`Array`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// 64-bit IEEE 754 floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Embedded document.
    Document(Document),
    /// Ordered array.
    Array(Array),
    /// Binary blob with a subtype tag.
    Binary(Binary),
    /// 12-byte object identifier.
    ObjectId(ObjectId),
    /// Boolean.
    Bool(bool),
    /// Milliseconds since the Unix epoch, signed.
    DateTime(i64),
    /// Explicit null.
    Null,
    /// Regular expression pattern with options.
    Regex(Regex),
    /// Internal timestamp: seconds and ordinal halves.
    Timestamp(Timestamp),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
}

/// Binary value: subtype tag plus raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binary {
    /// Subtype tag (0x00 is the generic subtype).
    pub subtype: u8,
    /// Raw payload.
    pub bytes: Vec<u8>,
}

/// Regular expression value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regex {
    /// The pattern, without delimiters.
    pub pattern: String,
    /// Option characters, sorted by the producer.
    pub options: String,
}

/// Internal timestamp with a seconds half and an ordinal half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub t: u32,
    /// Ordinal within the second.
    pub i: u32,
}

/// 12-byte object identifier: 4 bytes of seconds, 5 random bytes, and a
/// 3-byte counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        use rand::Rng;

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::thread_rng().fill(&mut bytes[4..]);
        Self(bytes)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An ordered array of values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Array {
    elements: Vec<Value>,
}

impl Array {
    /// Create an empty array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value.
    pub fn push(&mut self, value: Value) {
        self.elements.push(value);
    }

    /// Element at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.elements.get(index)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over the elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.elements.iter()
    }
}

impl FromIterator<Value> for Array {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

/// An ordered sequence of `(key, Value)` pairs.
///
/// Keys are not required to be unique by the model itself, but [`set`]
/// replaces in place when the key already exists, and well-formed protocol
/// documents do not carry duplicates.
///
/// [`set`]: Document::set
#[derive(Debug, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
    frozen: bool,
}

impl Document {
    /// Create an empty, unfrozen document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set `key` to `value`, replacing in place if the key exists and
    /// appending otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the document is frozen.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        assert!(!self.frozen, "attempt to mutate a frozen document");

        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Remove `key` and return its value, if present.
    ///
    /// # Panics
    ///
    /// Panics if the document is frozen.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        assert!(!self.frozen, "attempt to mutate a frozen document");

        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    /// The command name: the key of the first field, or `""` for an empty
    /// document.
    pub fn command(&self) -> &str {
        self.fields.first().map(|(k, _)| k.as_str()).unwrap_or("")
    }

    /// Whether the document holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Iterate over `(key, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Mark the document immutable. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the document has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Vec<u8> {
        bson::encode_document(self)
    }

    /// Decode from the wire representation, requiring that `buf` is consumed
    /// exactly.
    pub fn decode(buf: &[u8]) -> Result<Self, BsonError> {
        bson::decode_document(buf)
    }

    /// Decode one document from the front of `input`, consuming exactly its
    /// declared bytes and leaving the rest in place.
    pub fn decode_prefix(input: &mut &[u8]) -> Result<Self, BsonError> {
        bson::decode_prefix(input)
    }
}

// Cloning produces a deep, unfrozen copy: the freeze mark applies to one
// instance, not to the data.
impl Clone for Document {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            frozen: false,
        }
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
            frozen: false,
        }
    }
}

/// Build a [`Document`] from `key => value` pairs, in order.
#[macro_export]
macro_rules! doc {
    () => { $crate::document::Document::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::document::Document::new();
        $(d.set($key, $value);)+
        d
    }};
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::String(v) => write!(f, "{v:?}"),
            Value::Document(v) => v.fmt(f),
            Value::Array(v) => v.fmt(f),
            Value::Binary(v) => {
                write!(f, "Binary(0x{:02x}, {})", v.subtype, hex::encode(&v.bytes))
            }
            Value::ObjectId(v) => write!(f, "ObjectId({v})"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::DateTime(v) => write!(f, "DateTime({v})"),
            Value::Null => f.write_str("null"),
            Value::Regex(v) => write!(f, "/{}/{}", v.pattern, v.options),
            Value::Timestamp(v) => write!(f, "Timestamp({}, {})", v.t, v.i),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "long({v})"),
        }
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            e.fmt(f)?;
        }
        f.write_str("]")
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k:?}: {v}")?;
        }
        f.write_str("}")
    }
}
