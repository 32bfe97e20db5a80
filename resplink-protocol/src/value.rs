//! Decoded reply values.

use crate::config::BlobMode;
use bytes::Bytes;
use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A string payload, either as text or as the raw bytes from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Blob {
    Text(String),
    Bytes(Bytes),
}

impl Blob {
    /// Builds a blob in the requested representation.
    pub fn from_bytes(bytes: Bytes, mode: BlobMode) -> Self {
        match mode {
            BlobMode::Text => Blob::Text(lossy_text(bytes)),
            BlobMode::Bytes => Blob::Bytes(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Blob::Text(text) => text.as_bytes(),
            Blob::Bytes(bytes) => bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Blob::Text(text) => Some(text),
            Blob::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }

    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            Blob::Text(text) => Cow::Borrowed(text),
            Blob::Bytes(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Blob::Text(text) => text,
            Blob::Bytes(bytes) => lossy_text(bytes),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Blob::Text(text) => Bytes::from(text),
            Blob::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for Blob {
    fn from(text: &str) -> Self {
        Blob::Text(text.to_string())
    }
}

impl From<String> for Blob {
    fn from(text: String) -> Self {
        Blob::Text(text)
    }
}

impl From<Bytes> for Blob {
    fn from(bytes: Bytes) -> Self {
        Blob::Bytes(bytes)
    }
}

pub(crate) fn lossy_text(bytes: Bytes) -> String {
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

/// A big number (`(`), native or as decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BigNumber {
    Native(BigInt),
    Text(String),
}

/// A double (`,`), native or as decimal text.
///
/// Native doubles compare by bit pattern so that replies can be set members
/// and map keys: `NaN == NaN` and `0.0 != -0.0`.
#[derive(Debug, Clone)]
pub enum Double {
    Native(f64),
    Text(String),
}

impl PartialEq for Double {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Double::Native(a), Double::Native(b)) => a.to_bits() == b.to_bits(),
            (Double::Text(a), Double::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Double {}

impl Hash for Double {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Double::Native(value) => {
                0u8.hash(state);
                value.to_bits().hash(state);
            }
            Double::Text(text) => {
                1u8.hash(state);
                text.hash(state);
            }
        }
    }
}

/// Which wire type carried an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `-` simple error.
    Simple,
    /// `!` blob error.
    Blob,
}

/// A server-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error code prefix, e.g. `WRONGTYPE` or `EXECABORT`.
    pub fn code(&self) -> &str {
        self.message.split(' ').next().unwrap_or("")
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A set reply (`~`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetReply {
    Unique(IndexSet<ReplyValue>),
    Sequence(Vec<ReplyValue>),
}

impl SetReply {
    pub fn len(&self) -> usize {
        match self {
            SetReply::Unique(set) => set.len(),
            SetReply::Sequence(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Unordered containers hash only their length, which keeps the hash
// consistent with their order-insensitive equality.
impl Hash for SetReply {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            SetReply::Unique(set) => {
                0u8.hash(state);
                set.len().hash(state);
            }
            SetReply::Sequence(items) => {
                1u8.hash(state);
                items.hash(state);
            }
        }
    }
}

/// A map reply (`%`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapReply {
    Associative(IndexMap<ReplyValue, ReplyValue>),
    Keyed(IndexMap<String, ReplyValue>),
    Flat(Vec<ReplyValue>),
}

impl MapReply {
    /// Number of key/value pairs.
    pub fn len(&self) -> usize {
        match self {
            MapReply::Associative(map) => map.len(),
            MapReply::Keyed(map) => map.len(),
            MapReply::Flat(items) => items.len() / 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a value by string key, whatever the representation.
    pub fn get(&self, key: &str) -> Option<&ReplyValue> {
        match self {
            MapReply::Keyed(map) => map.get(key),
            MapReply::Associative(map) => map
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            MapReply::Flat(items) => items
                .chunks_exact(2)
                .find(|pair| pair[0].as_str() == Some(key))
                .map(|pair| &pair[1]),
        }
    }
}

impl Hash for MapReply {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            MapReply::Associative(map) => {
                0u8.hash(state);
                map.len().hash(state);
            }
            MapReply::Keyed(map) => {
                1u8.hash(state);
                map.len().hash(state);
            }
            MapReply::Flat(items) => {
                2u8.hash(state);
                items.hash(state);
            }
        }
    }
}

/// One fully decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplyValue {
    Null,
    Boolean(bool),
    Integer(i64),
    BigNumber(BigNumber),
    Double(Double),
    SimpleString(Blob),
    BlobString(Blob),
    VerbatimString { format: String, text: Blob },
    Error(ErrorReply),
    Array(Vec<ReplyValue>),
    Set(SetReply),
    Map(MapReply),
    Push(Vec<ReplyValue>),
}

impl ReplyValue {
    /// Simple string in text form, e.g. `OK`.
    pub fn simple(text: &str) -> Self {
        ReplyValue::SimpleString(Blob::from(text))
    }

    /// Blob string in text form.
    pub fn text(text: &str) -> Self {
        ReplyValue::BlobString(Blob::from(text))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ReplyValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReplyValue::Error(_))
    }

    /// String content of simple, blob and verbatim strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ReplyValue::SimpleString(blob)
            | ReplyValue::BlobString(blob)
            | ReplyValue::VerbatimString { text: blob, .. } => blob.as_str(),
            _ => None,
        }
    }

    /// Raw content of simple, blob and verbatim strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ReplyValue::SimpleString(blob)
            | ReplyValue::BlobString(blob)
            | ReplyValue::VerbatimString { text: blob, .. } => Some(blob.as_bytes()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ReplyValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Elements of arrays, pushes and sequence sets.
    pub fn as_slice(&self) -> Option<&[ReplyValue]> {
        match self {
            ReplyValue::Array(items)
            | ReplyValue::Push(items)
            | ReplyValue::Set(SetReply::Sequence(items)) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<ReplyValue>> {
        match self {
            ReplyValue::Array(items)
            | ReplyValue::Push(items)
            | ReplyValue::Set(SetReply::Sequence(items)) => Some(items),
            ReplyValue::Set(SetReply::Unique(set)) => Some(set.into_iter().collect()),
            _ => None,
        }
    }

    /// Converts every raw blob in this value, at any depth, to text.
    pub fn into_text_blobs(self) -> Self {
        fn text(blob: Blob) -> Blob {
            Blob::Text(blob.into_text())
        }
        fn all(items: Vec<ReplyValue>) -> Vec<ReplyValue> {
            items.into_iter().map(ReplyValue::into_text_blobs).collect()
        }

        match self {
            ReplyValue::SimpleString(blob) => ReplyValue::SimpleString(text(blob)),
            ReplyValue::BlobString(blob) => ReplyValue::BlobString(text(blob)),
            ReplyValue::VerbatimString { format, text: blob } => ReplyValue::VerbatimString {
                format,
                text: text(blob),
            },
            ReplyValue::Array(items) => ReplyValue::Array(all(items)),
            ReplyValue::Push(items) => ReplyValue::Push(all(items)),
            ReplyValue::Set(SetReply::Sequence(items)) => ReplyValue::Set(SetReply::Sequence(all(items))),
            ReplyValue::Set(SetReply::Unique(set)) => ReplyValue::Set(SetReply::Unique(
                set.into_iter().map(ReplyValue::into_text_blobs).collect(),
            )),
            ReplyValue::Map(MapReply::Flat(items)) => ReplyValue::Map(MapReply::Flat(all(items))),
            ReplyValue::Map(MapReply::Keyed(map)) => ReplyValue::Map(MapReply::Keyed(
                map.into_iter().map(|(k, v)| (k, v.into_text_blobs())).collect(),
            )),
            ReplyValue::Map(MapReply::Associative(map)) => ReplyValue::Map(MapReply::Associative(
                map.into_iter()
                    .map(|(k, v)| (k.into_text_blobs(), v.into_text_blobs()))
                    .collect(),
            )),
            other => other,
        }
    }

    /// Text used when this value becomes the key of a keyed map.
    pub fn key_text(&self) -> String {
        match self {
            ReplyValue::SimpleString(blob)
            | ReplyValue::BlobString(blob)
            | ReplyValue::VerbatimString { text: blob, .. } => blob.to_text().into_owned(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ReplyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyValue::Null => f.write_str("(nil)"),
            ReplyValue::Boolean(value) => write!(f, "{}", value),
            ReplyValue::Integer(value) => write!(f, "{}", value),
            ReplyValue::BigNumber(BigNumber::Native(value)) => write!(f, "{}", value),
            ReplyValue::BigNumber(BigNumber::Text(text)) => f.write_str(text),
            ReplyValue::Double(Double::Native(value)) => write!(f, "{}", value),
            ReplyValue::Double(Double::Text(text)) => f.write_str(text),
            ReplyValue::SimpleString(blob)
            | ReplyValue::BlobString(blob)
            | ReplyValue::VerbatimString { text: blob, .. } => f.write_str(&blob.to_text()),
            ReplyValue::Error(err) => write!(f, "(error) {}", err),
            ReplyValue::Array(items) | ReplyValue::Push(items) => write_list(f, items.iter()),
            ReplyValue::Set(SetReply::Sequence(items)) => write_list(f, items.iter()),
            ReplyValue::Set(SetReply::Unique(set)) => write_list(f, set.iter()),
            ReplyValue::Map(MapReply::Flat(items)) => write_list(f, items.iter()),
            ReplyValue::Map(MapReply::Keyed(map)) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
            ReplyValue::Map(MapReply::Associative(map)) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_list<'a>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = &'a ReplyValue>,
) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str("]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_equality_by_bits() {
        assert_eq!(Double::Native(f64::NAN), Double::Native(f64::NAN));
        assert_ne!(Double::Native(0.0), Double::Native(-0.0));
        assert_ne!(Double::Native(1.0), Double::Text("1".to_string()));
    }

    #[test]
    fn test_error_code() {
        let err = ErrorReply::new(ErrorKind::Simple, "WRONGTYPE Operation against a key");
        assert_eq!(err.code(), "WRONGTYPE");
        assert_eq!(ErrorReply::new(ErrorKind::Blob, "").code(), "");
    }

    #[test]
    fn test_unique_set_as_member() {
        let mut outer = IndexSet::new();
        let a: IndexSet<ReplyValue> = [ReplyValue::Integer(1), ReplyValue::Integer(2)]
            .into_iter()
            .collect();
        let b: IndexSet<ReplyValue> = [ReplyValue::Integer(2), ReplyValue::Integer(1)]
            .into_iter()
            .collect();
        outer.insert(ReplyValue::Set(SetReply::Unique(a)));
        outer.insert(ReplyValue::Set(SetReply::Unique(b)));
        assert_eq!(outer.len(), 1);
    }

    #[test]
    fn test_map_get_across_representations() {
        let keyed: IndexMap<String, ReplyValue> =
            [("a".to_string(), ReplyValue::Integer(1))].into_iter().collect();
        assert_eq!(
            MapReply::Keyed(keyed).get("a"),
            Some(&ReplyValue::Integer(1))
        );

        let flat = MapReply::Flat(vec![ReplyValue::simple("a"), ReplyValue::Integer(1)]);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat.get("a"), Some(&ReplyValue::Integer(1)));
        assert_eq!(flat.get("b"), None);
    }

    #[test]
    fn test_key_text() {
        assert_eq!(ReplyValue::simple("k").key_text(), "k");
        assert_eq!(ReplyValue::Integer(-3).key_text(), "-3");
        assert_eq!(ReplyValue::Boolean(true).key_text(), "true");
    }

    #[test]
    fn test_blob_conversions() {
        let raw = Blob::from_bytes(Bytes::from_static(b"\xffab"), BlobMode::Bytes);
        assert_eq!(raw.as_bytes(), b"\xffab");
        assert!(raw.as_str().is_none());
        assert_eq!(raw.clone().into_text(), "\u{fffd}ab");

        let text = Blob::from_bytes(Bytes::from_static(b"hello"), BlobMode::Text);
        assert_eq!(text, Blob::Text("hello".to_string()));
        assert_eq!(text.into_bytes(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_display() {
        let value = ReplyValue::Array(vec![
            ReplyValue::simple("OK"),
            ReplyValue::Null,
            ReplyValue::Integer(7),
        ]);
        assert_eq!(value.to_string(), "[OK, (nil), 7]");
    }
}
