//! Decode configuration: how each wire type is represented once decoded.
//!
//! The configuration is a plain `Copy` value handed to every decode entry
//! point. The decoder captures it when the tag of a top-level value is read
//! and keeps it until that value is complete, so a configuration change only
//! ever takes effect between top-level values.

use crate::value::ReplyValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Representation of blob strings, simple strings and verbatim strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobMode {
    /// Lossy UTF-8 text.
    #[default]
    Text,
    /// Raw bytes, untouched.
    Bytes,
}

/// Representation of big numbers (`(`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BigNumberMode {
    /// Arbitrary precision integer.
    #[default]
    Native,
    /// The decimal digits as sent by the server.
    Text,
}

/// Representation of doubles (`,`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoubleMode {
    /// IEEE-754 `f64`.
    #[default]
    Native,
    /// The decimal literal as sent by the server.
    Text,
}

/// Representation of sets (`~`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetMode {
    /// Deduplicating, insertion-ordered set.
    Unique,
    /// Every element in wire order, duplicates kept.
    #[default]
    Sequence,
}

/// Representation of maps (`%`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapMode {
    /// Keys of any reply type.
    Associative,
    /// Keys converted to strings.
    #[default]
    Keyed,
    /// `[k1, v1, k2, v2, ...]`.
    Flat,
}

/// Per-value representation choices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub blob_string: BlobMode,
    pub big_number: BigNumberMode,
    pub double: DoubleMode,
    pub set: SetMode,
    pub map: MapMode,
}

impl DecodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob_string(mut self, mode: BlobMode) -> Self {
        self.blob_string = mode;
        self
    }

    pub fn with_big_number(mut self, mode: BigNumberMode) -> Self {
        self.big_number = mode;
        self
    }

    pub fn with_double(mut self, mode: DoubleMode) -> Self {
        self.double = mode;
        self
    }

    pub fn with_set(mut self, mode: SetMode) -> Self {
        self.set = mode;
        self
    }

    pub fn with_map(mut self, mode: MapMode) -> Self {
        self.map = mode;
        self
    }
}

/// The configuration applied to one whole top-level reply.
///
/// `Elements` is used for transaction commit replies: the outer array is
/// decoded with `outer`, and its i-th element with `elements[i]` (falling back
/// to `outer` past the end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyShape {
    Uniform(DecodeConfig),
    Elements {
        outer: DecodeConfig,
        elements: Arc<[DecodeConfig]>,
    },
}

impl ReplyShape {
    /// Configuration for the top-level value itself.
    pub fn outer(&self) -> DecodeConfig {
        match self {
            ReplyShape::Uniform(config) => *config,
            ReplyShape::Elements { outer, .. } => *outer,
        }
    }

    /// Configuration for the direct child at `index` of the top-level value.
    pub fn element(&self, index: usize) -> DecodeConfig {
        match self {
            ReplyShape::Uniform(config) => *config,
            ReplyShape::Elements { outer, elements } => {
                elements.get(index).copied().unwrap_or(*outer)
            }
        }
    }

    /// The same shape with every blob decoded as raw bytes.
    pub fn with_raw_blobs(&self) -> ReplyShape {
        let raw = |config: DecodeConfig| config.with_blob_string(BlobMode::Bytes);
        match self {
            ReplyShape::Uniform(config) => ReplyShape::Uniform(raw(*config)),
            ReplyShape::Elements { outer, elements } => ReplyShape::Elements {
                outer: raw(*outer),
                elements: elements.iter().copied().map(raw).collect(),
            },
        }
    }

    /// Turns a value decoded with [`ReplyShape::with_raw_blobs`] back into
    /// what this shape would have produced.
    pub fn restore_text_blobs(&self, value: ReplyValue) -> ReplyValue {
        let restore = |config: DecodeConfig, value: ReplyValue| match config.blob_string {
            BlobMode::Text => value.into_text_blobs(),
            BlobMode::Bytes => value,
        };
        match (self, value) {
            (ReplyShape::Elements { .. }, ReplyValue::Array(items)) => ReplyValue::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| restore(self.element(i), item))
                    .collect(),
            ),
            (_, value) => restore(self.outer(), value),
        }
    }
}

impl Default for ReplyShape {
    fn default() -> Self {
        ReplyShape::Uniform(DecodeConfig::default())
    }
}

impl From<DecodeConfig> for ReplyShape {
    fn from(config: DecodeConfig) -> Self {
        ReplyShape::Uniform(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Blob;
    use bytes::Bytes;

    #[test]
    fn test_defaults() {
        let config = DecodeConfig::default();
        assert_eq!(config.blob_string, BlobMode::Text);
        assert_eq!(config.big_number, BigNumberMode::Native);
        assert_eq!(config.double, DoubleMode::Native);
        assert_eq!(config.set, SetMode::Sequence);
        assert_eq!(config.map, MapMode::Keyed);
    }

    #[test]
    fn test_element_shape_falls_back_to_outer() {
        let raw = DecodeConfig::new().with_blob_string(BlobMode::Bytes);
        let shape = ReplyShape::Elements {
            outer: DecodeConfig::default(),
            elements: Arc::from(vec![DecodeConfig::default(), raw]),
        };

        assert_eq!(shape.element(0), DecodeConfig::default());
        assert_eq!(shape.element(1), raw);
        assert_eq!(shape.element(7), DecodeConfig::default());
    }

    #[test]
    fn test_restore_text_blobs_per_element() {
        let raw = DecodeConfig::new().with_blob_string(BlobMode::Bytes);
        let shape = ReplyShape::Elements {
            outer: DecodeConfig::default(),
            elements: Arc::from(vec![DecodeConfig::default(), raw]),
        };
        assert_eq!(
            shape.with_raw_blobs().element(0).blob_string,
            BlobMode::Bytes
        );

        fn raw_blob(b: &'static [u8]) -> ReplyValue {
            ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b)))
        }
        let decoded = ReplyValue::Array(vec![
            ReplyValue::Array(vec![raw_blob(b"a")]),
            raw_blob(b"\xff"),
        ]);
        assert_eq!(
            shape.restore_text_blobs(decoded),
            ReplyValue::Array(vec![
                ReplyValue::Array(vec![ReplyValue::text("a")]),
                raw_blob(b"\xff"),
            ])
        );
    }
}
