//! Container reader: parses the GGUF-style binary layout into an in-memory
//! header (key/value metadata + tensor descriptors) and exposes a
//! `read_span` primitive for pulling contiguous byte ranges out of the data
//! region, either via a memory map or a positional file read.
//!
//! Byte order is little-endian throughout, matching the container format.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{EngineError, Result};

const MAGIC: &[u8; 4] = b"GGUF";
const DEFAULT_ALIGNMENT: u64 = 32;
/// Defensive upper bound on any length-prefixed string (KV keys/values,
/// tensor names, vocab tokens): rejects malformed length prefixes before
/// they turn into a multi-gigabyte allocation.
const MAX_STRING_LEN: usize = 1024 * 1024;

/// GGML tensor element types we understand. Anything else round-trips as
/// `Unsupported` and is rejected the moment it would need dequantizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q8_0,
    Q4K,
    Q5K,
    Q6K,
    Unsupported(u32),
}

impl From<u32> for GgmlType {
    fn from(id: u32) -> Self {
        match id {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            8 => GgmlType::Q8_0,
            12 => GgmlType::Q4K,
            13 => GgmlType::Q5K,
            14 => GgmlType::Q6K,
            other => GgmlType::Unsupported(other),
        }
    }
}

impl GgmlType {
    /// Number of values packed per on-disk block for quantized types; `1`
    /// for plain F32/F16 (each value is its own "block").
    pub fn block_size(self) -> usize {
        match self {
            GgmlType::F32 | GgmlType::F16 => 1,
            GgmlType::Q8_0 => 32,
            GgmlType::Q4K | GgmlType::Q5K | GgmlType::Q6K => 256,
        }
    }

    /// Bytes occupied by one block of this type.
    pub fn block_byte_size(self) -> usize {
        match self {
            GgmlType::F32 => 4,
            GgmlType::F16 => 2,
            GgmlType::Q8_0 => 4 + 32,
            GgmlType::Q4K => 2 + 2 + 12 + 128,
            GgmlType::Q5K => 2 + 2 + 12 + 32 + 128,
            GgmlType::Q6K => 128 + 64 + 16 + 2,
            GgmlType::Unsupported(_) => 0,
        }
    }

    /// Total byte size of `n_elements` values of this type, laid out in
    /// whole blocks (n_elements must be a multiple of `block_size()`).
    pub fn row_byte_size(self, n_elements: u64) -> u64 {
        let bs = self.block_size() as u64;
        let blocks = n_elements.div_ceil(bs);
        blocks * self.block_byte_size() as u64
    }
}

#[derive(Debug, Clone)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            GgufValue::U32(v) => Some(*v),
            GgufValue::I32(v) => Some(*v as u32),
            GgufValue::U64(v) => Some(*v as u32),
            GgufValue::I64(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            GgufValue::F32(v) => Some(*v),
            GgufValue::F64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    pub name: String,
    pub dims: Vec<u64>,
    pub dtype: GgmlType,
    pub offset: u64,
    pub size: u64,
}

impl TensorDescriptor {
    pub fn n_elements(&self) -> u64 {
        self.dims.iter().product()
    }
}

/// A little-endian typed byte reader, mirroring the role the container
/// format's own reader plays on top of a generic seekable stream.
pub struct Reader<R: Read + Seek> {
    inner: R,
}

impl<R: Read + Seek> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader { inner }
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.inner.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.inner.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Rejects length prefixes over 1 MiB before allocating -- a malformed
    /// or adversarial length prefix otherwise turns a few header bytes into
    /// an unbounded allocation. Covers every string read in the container
    /// (KV keys/values, tensor names, vocab tokens all funnel through here).
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        if len > MAX_STRING_LEN {
            return Err(EngineError::format(format!("string length {len} exceeds {MAX_STRING_LEN} byte limit")));
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| EngineError::format(format!("invalid utf8 string: {e}")))
    }

    fn read_value(&mut self, kind: u32) -> Result<GgufValue> {
        Ok(match kind {
            0 => GgufValue::U8(self.read_u8()?),
            1 => GgufValue::I8(self.read_i8()?),
            2 => GgufValue::U16(self.read_u16()?),
            3 => GgufValue::I16(self.read_i16()?),
            4 => GgufValue::U32(self.read_u32()?),
            5 => GgufValue::I32(self.read_i32()?),
            6 => GgufValue::F32(self.read_f32()?),
            7 => GgufValue::Bool(self.read_bool()?),
            8 => GgufValue::String(self.read_string()?),
            9 => {
                let elem_kind = self.read_u32()?;
                let len = self.read_u64()? as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value(elem_kind)?);
                }
                GgufValue::Array(items)
            }
            10 => GgufValue::U64(self.read_u64()?),
            11 => GgufValue::I64(self.read_i64()?),
            12 => GgufValue::F64(self.read_f64()?),
            other => return Err(EngineError::format(format!("unknown kv value type {other}"))),
        })
    }
}

/// Parsed container: metadata map, tensor descriptors, and the resolved
/// start of the aligned data region.
pub struct GgufContainer {
    pub metadata: HashMap<String, GgufValue>,
    pub tensors: Vec<TensorDescriptor>,
    pub data_start: u64,
    path: std::path::PathBuf,
    mmap: Option<memmap2::Mmap>,
}

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

impl GgufContainer {
    /// Parse the header (magic, version, KV section, tensor descriptors)
    /// and resolve the data region's start offset. `use_mmap` selects the
    /// backend used later by `read_span`.
    pub fn open<P: AsRef<Path>>(path: P, use_mmap: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = Reader::new(file);

        let magic = reader.read_bytes(4)?;
        if magic.as_slice() != MAGIC {
            return Err(EngineError::format("bad magic, not a recognized container"));
        }
        let _version = reader.read_u32()?;
        let n_tensors = reader.read_i64()?;
        let n_kv = reader.read_i64()?;
        if n_tensors < 0 || n_kv < 0 {
            return Err(EngineError::format("negative tensor/kv count"));
        }

        let mut metadata = HashMap::with_capacity(n_kv as usize);
        for _ in 0..n_kv {
            let key = reader.read_string()?;
            let value_type = reader.read_u32()?;
            let value = reader.read_value(value_type)?;
            metadata.insert(key, value);
        }

        let mut raw_tensors = Vec::with_capacity(n_tensors as usize);
        for _ in 0..n_tensors {
            let name = reader.read_string()?;
            let n_dims = reader.read_u32()? as usize;
            let mut dims = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                dims.push(reader.read_u64()?);
            }
            let dtype_id = reader.read_u32()?;
            let offset = reader.read_u64()?;
            raw_tensors.push((name, dims, GgmlType::from(dtype_id), offset));
        }

        let alignment = metadata
            .get("general.alignment")
            .and_then(GgufValue::as_u32)
            .map(|a| a as u64)
            .unwrap_or(DEFAULT_ALIGNMENT);

        let meta_end = reader.position()?;
        let data_start = align_up(meta_end, alignment);

        // Tensor byte sizes come from the delta between consecutive
        // offsets; the final tensor's size is whatever remains in the file.
        let mut tensors = Vec::with_capacity(raw_tensors.len());
        for i in 0..raw_tensors.len() {
            let (name, dims, dtype, offset) = raw_tensors[i].clone();
            let size = if i + 1 < raw_tensors.len() {
                raw_tensors[i + 1].3 - offset
            } else {
                file_len
                    .checked_sub(data_start + offset)
                    .ok_or_else(|| EngineError::format("tensor offset past end of file"))?
            };
            tensors.push(TensorDescriptor { name, dims, dtype, offset, size });
        }

        let mmap = if use_mmap {
            let file = File::open(path)?;
            Some(unsafe { memmap2::Mmap::map(&file)? })
        } else {
            None
        };

        Ok(GgufContainer { metadata, tensors, data_start, path: path.to_path_buf(), mmap })
    }

    pub fn find_tensor(&self, name: &str) -> Option<&TensorDescriptor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(GgufValue::as_u32)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.metadata.get(key).and_then(GgufValue::as_f32)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(GgufValue::as_str)
    }

    pub fn get_string_array(&self, key: &str) -> Option<Vec<String>> {
        self.metadata.get(key).and_then(GgufValue::as_array).map(|arr| {
            arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect()
        })
    }

    /// Read `len` bytes starting at `data_start + offset` into a freshly
    /// allocated buffer, via the mmap if one is open or a positional file
    /// read otherwise.
    pub fn read_span(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let start = (self.data_start + offset) as usize;
        let end = start + len as usize;
        if let Some(mmap) = &self.mmap {
            if end > mmap.len() {
                return Err(EngineError::format("span past end of mapped file"));
            }
            Ok(mmap[start..end].to_vec())
        } else {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(start as u64))?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        }
    }

    /// Read `len` bytes directly into `out[..len]`, avoiding the
    /// intermediate allocation `read_span` makes. Used for the staging
    /// buffer in the streaming layer loader.
    pub fn read_span_into(&self, offset: u64, len: u64, out: &mut [u8]) -> Result<()> {
        let start = (self.data_start + offset) as usize;
        let end = start + len as usize;
        if out.len() < len as usize {
            return Err(EngineError::BufferTooSmall { needed: len as usize, have: out.len() });
        }
        if let Some(mmap) = &self.mmap {
            if end > mmap.len() {
                return Err(EngineError::format("span past end of mapped file"));
            }
            out[..len as usize].copy_from_slice(&mmap[start..end]);
        } else {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(start as u64))?;
            file.read_exact(&mut out[..len as usize])?;
        }
        Ok(())
    }
}
