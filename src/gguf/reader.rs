//! GGUF header and metadata parser.
//!
//! Little-endian throughout: 4-byte magic, u32 version, u64 tensor count,
//! u64 metadata pair count, then length-prefixed keys with typed values.
//! Large arrays (the tokenizer vocabulary, mostly) are skipped rather than
//! materialized; the caller still observes their length.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use super::{GgufError, GgufMetadata, GgufType, GgufValue};

const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Arrays with at least this many elements are skipped and replaced with
/// placeholder entries of the correct length.
pub const LARGE_ARRAY_THRESHOLD: u64 = 1000;

/// Read GGUF metadata from a file, blocking.
pub fn read_metadata(path: &Path) -> Result<GgufMetadata, GgufError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GgufError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(GgufError::Io(e)),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    parse(&mut reader, file_len)
}

/// Async variant; runs the identical parser on the blocking pool.
pub async fn read_metadata_async(path: &Path) -> Result<GgufMetadata, GgufError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_metadata(&path))
        .await
        .map_err(|e| GgufError::Malformed(format!("reader task failed: {e}")))?
}

fn parse<R: Read + Seek>(r: &mut R, file_len: u64) -> Result<GgufMetadata, GgufError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|_| GgufError::NotGguf)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::NotGguf);
    }

    let version = read_u32(r)?;
    if version != 2 && version != 3 {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(r)?;
    let metadata_kv_count = read_u64(r)?;
    if metadata_kv_count > file_len {
        return Err(GgufError::Malformed(format!(
            "implausible metadata count {metadata_kv_count}"
        )));
    }

    let mut entries = std::collections::HashMap::with_capacity(metadata_kv_count as usize);
    for _ in 0..metadata_kv_count {
        let key = read_string(r, file_len)?;
        let tag = read_u32(r)?;
        let ty = GgufType::from_tag(tag)
            .ok_or_else(|| GgufError::Malformed(format!("unknown value type tag {tag} for key {key}")))?;
        let value = read_value(r, ty, file_len)?;
        entries.insert(key, value);
    }

    let data_offset = r.stream_position()?;
    debug!(
        version,
        tensor_count,
        metadata_kv_count,
        data_offset,
        "parsed gguf metadata"
    );

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
        entries,
        data_offset,
    })
}

fn read_value<R: Read + Seek>(r: &mut R, ty: GgufType, file_len: u64) -> Result<GgufValue, GgufError> {
    Ok(match ty {
        GgufType::Uint8 => GgufValue::Uint8(read_byte(r)?),
        GgufType::Int8 => GgufValue::Int8(read_byte(r)? as i8),
        GgufType::Uint16 => GgufValue::Uint16(u16::from_le_bytes(read_array(r)?)),
        GgufType::Int16 => GgufValue::Int16(i16::from_le_bytes(read_array(r)?)),
        GgufType::Uint32 => GgufValue::Uint32(read_u32(r)?),
        GgufType::Int32 => GgufValue::Int32(i32::from_le_bytes(read_array(r)?)),
        GgufType::Float32 => GgufValue::Float32(f32::from_le_bytes(read_array(r)?)),
        GgufType::Bool => GgufValue::Bool(read_byte(r)? != 0),
        GgufType::String => GgufValue::String(read_string(r, file_len)?),
        GgufType::Uint64 => GgufValue::Uint64(read_u64(r)?),
        GgufType::Int64 => GgufValue::Int64(i64::from_le_bytes(read_array(r)?)),
        GgufType::Float64 => GgufValue::Float64(f64::from_le_bytes(read_array(r)?)),
        GgufType::Array => read_array_value(r, file_len)?,
    })
}

/// Composite arrays carry an element-type tag and a u64 length. Oversized
/// arrays are skipped element-by-element and replaced with placeholders so
/// the vocabulary never lands in memory.
fn read_array_value<R: Read + Seek>(r: &mut R, file_len: u64) -> Result<GgufValue, GgufError> {
    let elem_tag = read_u32(r)?;
    let elem_ty = GgufType::from_tag(elem_tag)
        .ok_or_else(|| GgufError::Malformed(format!("unknown array element type tag {elem_tag}")))?;
    let len = read_u64(r)?;
    if len > file_len {
        return Err(GgufError::Malformed(format!("implausible array length {len}")));
    }

    if len >= LARGE_ARRAY_THRESHOLD {
        debug!(len, ?elem_ty, "skipping large metadata array");
        skip_elements(r, elem_ty, len, file_len)?;
        let placeholder = GgufValue::placeholder(elem_ty);
        return Ok(GgufValue::Array(elem_ty, vec![placeholder; len as usize]));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_value(r, elem_ty, file_len)?);
    }
    Ok(GgufValue::Array(elem_ty, items))
}

fn skip_elements<R: Read + Seek>(
    r: &mut R,
    ty: GgufType,
    len: u64,
    file_len: u64,
) -> Result<(), GgufError> {
    match fixed_width(ty) {
        Some(width) => {
            r.seek(SeekFrom::Current((width * len) as i64))?;
        }
        None => {
            // Strings and nested arrays are length-prefixed per element.
            for _ in 0..len {
                match ty {
                    GgufType::String => {
                        let n = read_u64(r)?;
                        if n > file_len {
                            return Err(GgufError::Malformed(format!(
                                "implausible string length {n}"
                            )));
                        }
                        r.seek(SeekFrom::Current(n as i64))?;
                    }
                    GgufType::Array => {
                        let inner_tag = read_u32(r)?;
                        let inner_ty = GgufType::from_tag(inner_tag).ok_or_else(|| {
                            GgufError::Malformed(format!("unknown nested array tag {inner_tag}"))
                        })?;
                        let inner_len = read_u64(r)?;
                        skip_elements(r, inner_ty, inner_len, file_len)?;
                    }
                    _ => unreachable!("fixed-width type fell through"),
                }
            }
        }
    }
    Ok(())
}

fn fixed_width(ty: GgufType) -> Option<u64> {
    match ty {
        GgufType::Uint8 | GgufType::Int8 | GgufType::Bool => Some(1),
        GgufType::Uint16 | GgufType::Int16 => Some(2),
        GgufType::Uint32 | GgufType::Int32 | GgufType::Float32 => Some(4),
        GgufType::Uint64 | GgufType::Int64 | GgufType::Float64 => Some(8),
        GgufType::String | GgufType::Array => None,
    }
}

/// u64 length prefix, then that many bytes. Parsed as raw bytes; interpreted
/// as UTF-8 (lossily) for the in-memory representation.
fn read_string<R: Read>(r: &mut R, file_len: u64) -> Result<String, GgufError> {
    let len = read_u64(r)?;
    if len > file_len {
        return Err(GgufError::Malformed(format!("implausible string length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .map_err(|_| GgufError::Malformed("truncated string".into()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_byte<R: Read>(r: &mut R) -> Result<u8, GgufError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)
        .map_err(|_| GgufError::Malformed("unexpected end of file".into()))?;
    Ok(b[0])
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)
        .map_err(|_| GgufError::Malformed("unexpected end of file".into()))?;
    Ok(buf)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, GgufError> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, GgufError> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal GGUF writer for fixtures.
    struct Builder {
        buf: Vec<u8>,
        kv_count: u64,
    }

    impl Builder {
        fn new(version: u32, tensor_count: u64) -> Self {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"GGUF");
            buf.extend_from_slice(&version.to_le_bytes());
            buf.extend_from_slice(&tensor_count.to_le_bytes());
            buf.extend_from_slice(&0u64.to_le_bytes()); // kv count patched in finish()
            Self { buf, kv_count: 0 }
        }

        fn push_key(&mut self, key: &str) {
            self.buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
            self.buf.extend_from_slice(key.as_bytes());
            self.kv_count += 1;
        }

        fn push_string_value(&mut self, value: &str) {
            self.buf.extend_from_slice(&8u32.to_le_bytes());
            self.buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
            self.buf.extend_from_slice(value.as_bytes());
        }

        fn push_u32_value(&mut self, value: u32) {
            self.buf.extend_from_slice(&4u32.to_le_bytes());
            self.buf.extend_from_slice(&value.to_le_bytes());
        }

        fn push_string_array_value(&mut self, items: &[&str]) {
            self.buf.extend_from_slice(&9u32.to_le_bytes());
            self.buf.extend_from_slice(&8u32.to_le_bytes());
            self.buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                self.buf.extend_from_slice(&(item.len() as u64).to_le_bytes());
                self.buf.extend_from_slice(item.as_bytes());
            }
        }

        fn finish(mut self, trailing: &[u8]) -> Vec<u8> {
            self.buf[16..24].copy_from_slice(&self.kv_count.to_le_bytes());
            self.buf.extend_from_slice(trailing);
            self.buf
        }
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = read_metadata(Path::new("/nonexistent/model.gguf")).unwrap_err();
        assert!(matches!(err, GgufError::NotFound(_)));
    }

    #[test]
    fn test_magic_mismatch() {
        let file = write_temp(b"NOTGGUFDATA");
        let err = read_metadata(file.path()).unwrap_err();
        assert!(matches!(err, GgufError::NotGguf));
    }

    #[test]
    fn test_unsupported_version() {
        let builder = Builder::new(1, 0);
        let file = write_temp(&builder.finish(&[]));
        let err = read_metadata(file.path()).unwrap_err();
        assert!(matches!(err, GgufError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_basic_metadata_roundtrip() {
        let mut b = Builder::new(3, 291);
        b.push_key("general.architecture");
        b.push_string_value("llama");
        b.push_key("llama.context_length");
        b.push_u32_value(8192);
        let file = write_temp(&b.finish(&[]));

        let meta = read_metadata(file.path()).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.tensor_count, 291);
        assert_eq!(meta.metadata_kv_count, 2);
        assert_eq!(meta.entries.len() as u64, meta.metadata_kv_count);
        assert_eq!(meta.architecture(), Some("llama"));
        assert_eq!(meta.context_length(), Some(8192));
    }

    #[test]
    fn test_large_array_skipped_with_correct_length() {
        let tokens: Vec<String> = (0..32000).map(|i| format!("tok{i}")).collect();
        let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();

        let mut b = Builder::new(3, 0);
        b.push_key("tokenizer.ggml.tokens");
        b.push_string_array_value(&token_refs);
        // Sentinel tensor bytes directly after the metadata section.
        let bytes = b.finish(b"TENSORDATA");
        let header_len = (bytes.len() - b"TENSORDATA".len()) as u64;
        let file = write_temp(&bytes);

        let meta = read_metadata(file.path()).unwrap();
        match meta.get("tokenizer.ggml.tokens") {
            Some(GgufValue::Array(GgufType::String, items)) => {
                assert_eq!(items.len(), 32000);
                assert!(items.iter().all(|v| v == &GgufValue::String(String::new())));
            }
            other => panic!("unexpected value: {other:?}"),
        }
        // Position is exactly at the start of tensor data.
        assert_eq!(meta.data_offset, header_len);
    }

    #[test]
    fn test_small_array_materialized() {
        let mut b = Builder::new(2, 0);
        b.push_key("tokenizer.ggml.merges");
        b.push_string_array_value(&["a b", "c d"]);
        let file = write_temp(&b.finish(&[]));

        let meta = read_metadata(file.path()).unwrap();
        match meta.get("tokenizer.ggml.merges") {
            Some(GgufValue::Array(GgufType::String, items)) => {
                assert_eq!(items[0], GgufValue::String("a b".into()));
                assert_eq!(items[1], GgufValue::String("c d".into()));
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let mut b = Builder::new(3, 0);
        b.push_key("general.name");
        b.push_string_value("model");
        let mut bytes = b.finish(&[]);
        bytes.truncate(bytes.len() - 3);
        let file = write_temp(&bytes);

        let err = read_metadata(file.path()).unwrap_err();
        assert!(matches!(err, GgufError::Malformed(_)));
    }

    #[test]
    fn test_copy_yields_identical_metadata() {
        let mut b = Builder::new(3, 4);
        b.push_key("general.architecture");
        b.push_string_value("qwen2");
        b.push_key("general.file_type");
        b.push_u32_value(15);
        let bytes = b.finish(&[]);

        let file_a = write_temp(&bytes);
        let file_b = write_temp(&bytes);
        let meta_a = read_metadata(file_a.path()).unwrap();
        let meta_b = read_metadata(file_b.path()).unwrap();
        assert_eq!(meta_a.entries, meta_b.entries);
        assert_eq!(meta_a.quantization(), Some("Q4_K_M"));
    }

    #[tokio::test]
    async fn test_async_reader_matches_blocking() {
        let mut b = Builder::new(3, 0);
        b.push_key("general.name");
        b.push_string_value("tiny");
        let file = write_temp(&b.finish(&[]));

        let sync_meta = read_metadata(file.path()).unwrap();
        let async_meta = read_metadata_async(file.path()).await.unwrap();
        assert_eq!(sync_meta.entries, async_meta.entries);
    }
}
