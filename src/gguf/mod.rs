//! GGUF metadata access.
//!
//! Reads the file header and key/value metadata without mapping tensors, and
//! derives the model facts the rest of the crate needs: architecture,
//! quantization, sizing, tokenizer ids, and the embedded chat template.

mod reader;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

pub use reader::{read_metadata, read_metadata_async, LARGE_ARRAY_THRESHOLD};

/// Value type tags from the GGUF wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgufType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GgufType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => GgufType::Uint8,
            1 => GgufType::Int8,
            2 => GgufType::Uint16,
            3 => GgufType::Int16,
            4 => GgufType::Uint32,
            5 => GgufType::Int32,
            6 => GgufType::Float32,
            7 => GgufType::Bool,
            8 => GgufType::String,
            9 => GgufType::Array,
            10 => GgufType::Uint64,
            11 => GgufType::Int64,
            12 => GgufType::Float64,
            _ => return None,
        })
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
    Array(GgufType, Vec<GgufValue>),
}

impl GgufValue {
    /// Widen any integer variant to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::Uint8(n) => Some(u64::from(*n)),
            GgufValue::Uint16(n) => Some(u64::from(*n)),
            GgufValue::Uint32(n) => Some(u64::from(*n)),
            GgufValue::Uint64(n) => Some(*n),
            GgufValue::Int8(n) => u64::try_from(*n).ok(),
            GgufValue::Int16(n) => u64::try_from(*n).ok(),
            GgufValue::Int32(n) => u64::try_from(*n).ok(),
            GgufValue::Int64(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|n| u32::try_from(n).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Display form used when metadata is exposed as a string map.
    pub fn to_display_string(&self) -> String {
        match self {
            GgufValue::Uint8(n) => n.to_string(),
            GgufValue::Int8(n) => n.to_string(),
            GgufValue::Uint16(n) => n.to_string(),
            GgufValue::Int16(n) => n.to_string(),
            GgufValue::Uint32(n) => n.to_string(),
            GgufValue::Int32(n) => n.to_string(),
            GgufValue::Float32(f) => f.to_string(),
            GgufValue::Bool(b) => b.to_string(),
            GgufValue::String(s) => s.clone(),
            GgufValue::Uint64(n) => n.to_string(),
            GgufValue::Int64(n) => n.to_string(),
            GgufValue::Float64(f) => f.to_string(),
            GgufValue::Array(_, items) => format!("[array of {} items]", items.len()),
        }
    }

    /// Default value of a type, used as the placeholder for skipped arrays.
    pub(crate) fn placeholder(ty: GgufType) -> GgufValue {
        match ty {
            GgufType::Uint8 => GgufValue::Uint8(0),
            GgufType::Int8 => GgufValue::Int8(0),
            GgufType::Uint16 => GgufValue::Uint16(0),
            GgufType::Int16 => GgufValue::Int16(0),
            GgufType::Uint32 => GgufValue::Uint32(0),
            GgufType::Int32 => GgufValue::Int32(0),
            GgufType::Float32 => GgufValue::Float32(0.0),
            GgufType::Bool => GgufValue::Bool(false),
            GgufType::String => GgufValue::String(String::new()),
            GgufType::Uint64 => GgufValue::Uint64(0),
            GgufType::Int64 => GgufValue::Int64(0),
            GgufType::Float64 => GgufValue::Float64(0.0),
            GgufType::Array => GgufValue::Array(GgufType::Uint8, Vec::new()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),

    #[error("not a GGUF file (magic mismatch)")]
    NotGguf,

    #[error("unsupported GGUF version {0} (expected 2 or 3)")]
    UnsupportedVersion(u32),

    #[error("malformed GGUF metadata: {0}")]
    Malformed(String),

    #[error("io error reading GGUF: {0}")]
    Io(#[from] std::io::Error),
}

/// `general.file_type` → quantization label, per the llama.cpp ftype table.
const FILE_TYPE_LABELS: &[(u32, &str)] = &[
    (0, "F32"),
    (1, "F16"),
    (2, "Q4_0"),
    (3, "Q4_1"),
    (7, "Q8_0"),
    (8, "Q5_0"),
    (9, "Q5_1"),
    (10, "Q2_K"),
    (11, "Q3_K_S"),
    (12, "Q3_K_M"),
    (13, "Q3_K_L"),
    (14, "Q4_K_S"),
    (15, "Q4_K_M"),
    (16, "Q5_K_S"),
    (17, "Q5_K_M"),
    (18, "Q6_K"),
    (19, "IQ2_XXS"),
    (20, "IQ2_XS"),
    (21, "Q2_K_S"),
    (22, "IQ3_XS"),
    (23, "IQ3_XXS"),
    (24, "IQ1_S"),
    (25, "IQ4_NL"),
    (26, "IQ3_S"),
    (27, "IQ3_M"),
    (28, "IQ2_S"),
    (29, "IQ2_M"),
    (30, "IQ4_XS"),
    (31, "IQ1_M"),
    (32, "BF16"),
];

/// Fallback vocabulary size for the parameter estimate when the tokenizer
/// array was skipped or absent.
const DEFAULT_VOCAB_SIZE: u64 = 32000;

/// Parsed GGUF header and metadata.
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// Format version, 2 or 3.
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    pub entries: HashMap<String, GgufValue>,
    /// File offset of the first byte past the metadata section.
    pub data_offset: u64,
}

impl GgufMetadata {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.entries.get(key)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(GgufValue::as_str)
    }

    /// Architecture-scoped lookup, e.g. `llama.context_length`.
    fn arch_field(&self, field: &str) -> Option<&GgufValue> {
        let arch = self.architecture()?;
        self.get(&format!("{arch}.{field}"))
    }

    pub fn architecture(&self) -> Option<&str> {
        self.get_str("general.architecture")
    }

    pub fn general_name(&self) -> Option<&str> {
        self.get_str("general.name")
    }

    pub fn chat_template(&self) -> Option<&str> {
        self.get_str("tokenizer.chat_template")
    }

    pub fn context_length(&self) -> Option<u32> {
        self.arch_field("context_length").and_then(GgufValue::as_u32)
    }

    pub fn embedding_length(&self) -> Option<u32> {
        self.arch_field("embedding_length").and_then(GgufValue::as_u32)
    }

    pub fn block_count(&self) -> Option<u32> {
        self.arch_field("block_count").and_then(GgufValue::as_u32)
    }

    pub fn head_count(&self) -> Option<u32> {
        self.arch_field("attention.head_count").and_then(GgufValue::as_u32)
    }

    pub fn feed_forward_length(&self) -> Option<u32> {
        self.arch_field("feed_forward_length").and_then(GgufValue::as_u32)
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.get("tokenizer.ggml.bos_token_id").and_then(GgufValue::as_u32)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.get("tokenizer.ggml.eos_token_id").and_then(GgufValue::as_u32)
    }

    pub fn padding_token_id(&self) -> Option<u32> {
        self.get("tokenizer.ggml.padding_token_id").and_then(GgufValue::as_u32)
    }

    /// Vocabulary size: explicit field first, then tokenizer array length
    /// (still correct when the array payload was skipped).
    pub fn vocab_size(&self) -> Option<u64> {
        if let Some(n) = self.arch_field("vocab_size").and_then(GgufValue::as_u64) {
            return Some(n);
        }
        match self.get("tokenizer.ggml.tokens") {
            Some(GgufValue::Array(_, items)) => Some(items.len() as u64),
            _ => None,
        }
    }

    pub fn file_type(&self) -> Option<u32> {
        self.get("general.file_type").and_then(GgufValue::as_u32)
    }

    /// Quantization label from the fixed `general.file_type` table.
    pub fn quantization(&self) -> Option<&'static str> {
        let ftype = self.file_type()?;
        FILE_TYPE_LABELS
            .iter()
            .find(|(id, _)| *id == ftype)
            .map(|(_, label)| *label)
    }

    /// Parameter-count estimate:
    /// `blocks * (4*embd^2 + 3*embd*ff + 2*embd) + vocab*embd*2`.
    pub fn parameter_estimate(&self) -> Option<u64> {
        let blocks = u64::from(self.block_count()?);
        let embd = u64::from(self.embedding_length()?);
        let ff = u64::from(self.feed_forward_length().unwrap_or(0));
        let vocab = self.vocab_size().unwrap_or(DEFAULT_VOCAB_SIZE);
        Some(blocks * (4 * embd * embd + 3 * embd * ff + 2 * embd) + vocab * embd * 2)
    }

    /// Human-readable parameter count, e.g. "7B" or "125M".
    pub fn parameter_label(&self) -> Option<String> {
        let count = self.parameter_estimate()?;
        Some(if count >= 1_000_000_000 {
            format!("{:.0}B", count as f64 / 1e9)
        } else if count >= 1_000_000 {
            format!("{:.0}M", count as f64 / 1e6)
        } else {
            count.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(entries: Vec<(&str, GgufValue)>) -> GgufMetadata {
        GgufMetadata {
            version: 3,
            tensor_count: 0,
            metadata_kv_count: entries.len() as u64,
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            data_offset: 0,
        }
    }

    #[test]
    fn test_quantization_label() {
        let meta = meta_with(vec![("general.file_type", GgufValue::Uint32(15))]);
        assert_eq!(meta.quantization(), Some("Q4_K_M"));

        let meta = meta_with(vec![("general.file_type", GgufValue::Uint32(32))]);
        assert_eq!(meta.quantization(), Some("BF16"));

        let meta = meta_with(vec![("general.file_type", GgufValue::Uint32(999))]);
        assert_eq!(meta.quantization(), None);
    }

    #[test]
    fn test_arch_scoped_fields() {
        let meta = meta_with(vec![
            ("general.architecture", GgufValue::String("llama".into())),
            ("llama.context_length", GgufValue::Uint32(4096)),
            ("llama.embedding_length", GgufValue::Uint32(4096)),
            ("llama.block_count", GgufValue::Uint32(32)),
        ]);
        assert_eq!(meta.context_length(), Some(4096));
        assert_eq!(meta.block_count(), Some(32));
        assert_eq!(meta.head_count(), None);
    }

    #[test]
    fn test_parameter_estimate_vocab_fallback() {
        let meta = meta_with(vec![
            ("general.architecture", GgufValue::String("llama".into())),
            ("llama.embedding_length", GgufValue::Uint32(4096)),
            ("llama.block_count", GgufValue::Uint32(32)),
            ("llama.feed_forward_length", GgufValue::Uint32(11008)),
        ]);
        let embd = 4096u64;
        let expected = 32 * (4 * embd * embd + 3 * embd * 11008 + 2 * embd) + 32000 * embd * 2;
        assert_eq!(meta.parameter_estimate(), Some(expected));
        // ~6.7B puts the label in B territory
        assert_eq!(meta.parameter_label().as_deref(), Some("7B"));
    }

    #[test]
    fn test_vocab_size_from_skipped_array() {
        let placeholders = vec![GgufValue::String(String::new()); 32000];
        let meta = meta_with(vec![(
            "tokenizer.ggml.tokens",
            GgufValue::Array(GgufType::String, placeholders),
        )]);
        assert_eq!(meta.vocab_size(), Some(32000));
    }

    #[test]
    fn test_value_widening() {
        assert_eq!(GgufValue::Uint8(7).as_u64(), Some(7));
        assert_eq!(GgufValue::Int64(-1).as_u64(), None);
        assert_eq!(GgufValue::Uint64(1 << 40).as_u32(), None);
    }
}
