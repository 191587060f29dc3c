//! Reader for the GGUF model container.
//!
//! A GGUF file is a little-endian binary: a fixed header, a metadata
//! key-value section, a tensor descriptor section, then an aligned data
//! region holding the raw tensor bytes. The whole file is memory-mapped;
//! tensors are exposed as byte windows into the mapping and are never
//! copied or eagerly dequantized.

use crate::utils::MemoryMapper;
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF"
const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];
const DEFAULT_ALIGNMENT: usize = 32;
const MAX_TENSOR_NAME_BYTES: usize = 64;
const MAX_TENSOR_DIMS: usize = 4;

/// GGML tensor encoding, by the numeric id stored in the file.
///
/// The table covers every id the format defines so that files carrying
/// other encodings parse cleanly; only `F32`, `Q8_0` and `Q4_0` can back
/// a [`crate::tensor::Tensor`] view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
}

impl GgmlType {
    pub fn from_id(id: u32) -> Result<Self> {
        Ok(match id {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2_K,
            11 => Self::Q3_K,
            12 => Self::Q4_K,
            13 => Self::Q5_K,
            14 => Self::Q6_K,
            15 => Self::Q8_K,
            16 => Self::I8,
            17 => Self::I16,
            18 => Self::I32,
            _ => anyhow::bail!("Unknown GGML type id {id}"),
        })
    }

    /// Bytes occupied by one block of `block_size` elements.
    pub fn type_size(self) -> Result<usize> {
        const F16_BYTES: usize = 2;
        Ok(match self {
            Self::F32 => 4,
            Self::F16 => F16_BYTES,
            Self::Q4_0 => F16_BYTES + 16,
            Self::Q4_1 => 2 * F16_BYTES + 16,
            Self::Q8_0 => F16_BYTES + 32,
            Self::Q8_1 => 4 + 32,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            other => anyhow::bail!("No size table entry for GGML type {other:?}"),
        })
    }

    /// Elements per quantization block; 1 for unblocked encodings.
    pub fn block_size(self) -> usize {
        match self {
            Self::Q4_0 | Self::Q4_1 | Self::Q8_0 | Self::Q8_1 => 32,
            _ => 1,
        }
    }

    /// Storage size of `elements` values in this encoding.
    pub fn byte_size_for(self, elements: usize) -> Result<usize> {
        let total = elements
            .checked_mul(self.type_size()?)
            .context("Tensor byte size overflow")?;
        if total % self.block_size() != 0 {
            anyhow::bail!(
                "Element count {elements} is not a whole number of {self:?} blocks"
            );
        }
        Ok(total / self.block_size())
    }
}

/// A single metadata value, tagged by the on-disk type code.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    U64(u64),
    I64(i64),
    F64(f64),
    Array(ArrayValue),
}

/// Homogeneous metadata array; arrays may nest.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
    String(Vec<String>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F64(Vec<f64>),
    Nested(Vec<ArrayValue>),
}

impl MetadataValue {
    fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            Self::F64(v) => Some(v as f32),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Descriptor of one tensor, as parsed from the descriptor section.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<usize>,
    pub ggml_type: GgmlType,
    pub offset: usize,
}

impl TensorInfo {
    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// A tensor resolved to its byte window in the data region.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub ggml_type: GgmlType,
    pub dims: Vec<usize>,
    pub bytes: &'static [u8],
}

impl TensorEntry {
    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// A parsed GGUF file. Owns the memory mapping that every tensor window
/// borrows from, so it must outlive all views handed out.
pub struct GgufFile {
    /// Keeps the mapping alive; every tensor window borrows from it.
    _mapper: MemoryMapper,
    pub version: u32,
    pub alignment: usize,
    metadata: HashMap<String, MetadataValue>,
    tensors: HashMap<String, TensorEntry>,
}

impl GgufFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open model file {}", path.display()))?;
        let mapper = MemoryMapper::new(file)?;
        Self::parse(mapper)
    }

    fn parse(mapper: MemoryMapper) -> Result<Self> {
        let mut cursor = Cursor::new(mapper.bytes());

        let magic = cursor.read_u32::<LittleEndian>().context("Failed to read magic")?;
        if magic != GGUF_MAGIC {
            anyhow::bail!("Unsupported header magic {magic:#010x}");
        }
        let version = cursor.read_u32::<LittleEndian>().context("Failed to read version")?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            anyhow::bail!("Unsupported header version {version}");
        }
        let tensor_count = cursor.read_u64::<LittleEndian>()? as usize;
        let metadata_count = cursor.read_u64::<LittleEndian>()? as usize;

        let mut metadata = HashMap::with_capacity(metadata_count);
        for _ in 0..metadata_count {
            let key = read_key(&mut cursor)?;
            let value = read_value(&mut cursor)
                .with_context(|| format!("Failed to read metadata value for '{key}'"))?;
            metadata.insert(key, value);
        }

        let alignment = match metadata.get("general.alignment") {
            Some(value) => value
                .as_u64()
                .context("general.alignment is not an integer")? as usize,
            None => DEFAULT_ALIGNMENT,
        };
        if !alignment.is_power_of_two() {
            anyhow::bail!("Alignment {alignment} is not a power of two");
        }

        let mut infos = Vec::with_capacity(tensor_count);
        for _ in 0..tensor_count {
            infos.push(read_tensor_info(&mut cursor)?);
        }

        // The data region starts at the next alignment boundary after the
        // descriptor section; every tensor offset is relative to it.
        let header_end = cursor.position() as usize;
        let data_base = header_end
            .checked_next_multiple_of(alignment)
            .context("Data region offset overflow")?;

        let mut tensors = HashMap::with_capacity(tensor_count);
        for info in infos {
            if info.offset % alignment != 0 {
                anyhow::bail!(
                    "Tensor '{}' offset {} is not {alignment}-byte aligned",
                    info.name,
                    info.offset
                );
            }
            let size = info.ggml_type.byte_size_for(info.elements())?;
            let bytes = mapper
                .static_window(data_base + info.offset, size)
                .with_context(|| format!("Tensor '{}' data out of bounds", info.name))?;
            tensors.insert(
                info.name,
                TensorEntry { ggml_type: info.ggml_type, dims: info.dims, bytes },
            );
        }

        Ok(Self { _mapper: mapper, version, alignment, metadata, tensors })
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.get(name)
    }

    pub fn require_tensor(&self, name: &str) -> Result<&TensorEntry> {
        self.tensors
            .get(name)
            .with_context(|| format!("Missing required tensor '{name}'"))
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    fn require(&self, key: &str) -> Result<&MetadataValue> {
        self.metadata
            .get(key)
            .with_context(|| format!("Missing required metadata key '{key}'"))
    }

    pub fn require_usize(&self, key: &str) -> Result<usize> {
        self.require(key)?
            .as_u64()
            .map(|v| v as usize)
            .with_context(|| format!("Metadata key '{key}' is not an unsigned integer"))
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.metadata.get(key) {
            Some(value) => value
                .as_u64()
                .map(|v| v as usize)
                .with_context(|| format!("Metadata key '{key}' is not an unsigned integer")),
            None => Ok(default),
        }
    }

    pub fn require_f32(&self, key: &str) -> Result<f32> {
        self.require(key)?
            .as_f32()
            .with_context(|| format!("Metadata key '{key}' is not a float"))
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.require(key)?
            .as_str()
            .with_context(|| format!("Metadata key '{key}' is not a string"))
    }

    pub fn require_str_array(&self, key: &str) -> Result<&[String]> {
        match self.require(key)? {
            MetadataValue::Array(ArrayValue::String(items)) => Ok(items),
            _ => anyhow::bail!("Metadata key '{key}' is not a string array"),
        }
    }

    pub fn require_f32_array(&self, key: &str) -> Result<&[f32]> {
        match self.require(key)? {
            MetadataValue::Array(ArrayValue::F32(items)) => Ok(items),
            _ => anyhow::bail!("Metadata key '{key}' is not a float array"),
        }
    }

    pub fn require_i32_array(&self, key: &str) -> Result<&[i32]> {
        match self.require(key)? {
            MetadataValue::Array(ArrayValue::I32(items)) => Ok(items),
            _ => anyhow::bail!("Metadata key '{key}' is not an int array"),
        }
    }
}

impl std::fmt::Debug for GgufFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufFile")
            .field("version", &self.version)
            .field("alignment", &self.alignment)
            .field("metadata_keys", &self.metadata.len())
            .field("tensors", &self.tensors.len())
            .finish_non_exhaustive()
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u64::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .context("Truncated string in header")?;
    String::from_utf8(bytes).context("Header string is not valid UTF-8")
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let key = read_string(cursor)?;
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.');
    if !valid {
        anyhow::bail!("Metadata key '{key}' contains characters outside [a-z0-9_.]");
    }
    Ok(key)
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> Result<MetadataValue> {
    let type_code = cursor.read_u32::<LittleEndian>()?;
    read_value_of_type(cursor, type_code)
}

fn read_value_of_type(cursor: &mut Cursor<&[u8]>, type_code: u32) -> Result<MetadataValue> {
    Ok(match type_code {
        0 => MetadataValue::U8(cursor.read_u8()?),
        1 => MetadataValue::I8(cursor.read_i8()?),
        2 => MetadataValue::U16(cursor.read_u16::<LittleEndian>()?),
        3 => MetadataValue::I16(cursor.read_i16::<LittleEndian>()?),
        4 => MetadataValue::U32(cursor.read_u32::<LittleEndian>()?),
        5 => MetadataValue::I32(cursor.read_i32::<LittleEndian>()?),
        6 => MetadataValue::F32(cursor.read_f32::<LittleEndian>()?),
        7 => MetadataValue::Bool(cursor.read_u8()? != 0),
        8 => MetadataValue::String(read_string(cursor)?),
        9 => MetadataValue::Array(read_array(cursor)?),
        10 => MetadataValue::U64(cursor.read_u64::<LittleEndian>()?),
        11 => MetadataValue::I64(cursor.read_i64::<LittleEndian>()?),
        12 => MetadataValue::F64(cursor.read_f64::<LittleEndian>()?),
        _ => anyhow::bail!("Unknown metadata value type {type_code}"),
    })
}

fn read_array(cursor: &mut Cursor<&[u8]>) -> Result<ArrayValue> {
    let element_type = cursor.read_u32::<LittleEndian>()?;
    let len = cursor.read_u64::<LittleEndian>()? as usize;

    macro_rules! read_elems {
        ($variant:ident, $read:expr) => {{
            let mut items = Vec::with_capacity(len.min(1 << 20));
            for _ in 0..len {
                items.push($read);
            }
            ArrayValue::$variant(items)
        }};
    }

    Ok(match element_type {
        0 => read_elems!(U8, cursor.read_u8()?),
        1 => read_elems!(I8, cursor.read_i8()?),
        2 => read_elems!(U16, cursor.read_u16::<LittleEndian>()?),
        3 => read_elems!(I16, cursor.read_i16::<LittleEndian>()?),
        4 => read_elems!(U32, cursor.read_u32::<LittleEndian>()?),
        5 => read_elems!(I32, cursor.read_i32::<LittleEndian>()?),
        6 => read_elems!(F32, cursor.read_f32::<LittleEndian>()?),
        7 => read_elems!(Bool, cursor.read_u8()? != 0),
        8 => read_elems!(String, read_string(cursor)?),
        9 => read_elems!(Nested, read_array(cursor)?),
        10 => read_elems!(U64, cursor.read_u64::<LittleEndian>()?),
        11 => read_elems!(I64, cursor.read_i64::<LittleEndian>()?),
        12 => read_elems!(F64, cursor.read_f64::<LittleEndian>()?),
        _ => anyhow::bail!("Unknown array element type {element_type}"),
    })
}

fn read_tensor_info(cursor: &mut Cursor<&[u8]>) -> Result<TensorInfo> {
    let name = read_string(cursor)?;
    if name.len() > MAX_TENSOR_NAME_BYTES {
        anyhow::bail!("Tensor name '{name}' exceeds {MAX_TENSOR_NAME_BYTES} bytes");
    }
    let n_dims = cursor.read_u32::<LittleEndian>()? as usize;
    if n_dims > MAX_TENSOR_DIMS {
        anyhow::bail!("Tensor '{name}' has {n_dims} dimensions, at most {MAX_TENSOR_DIMS} supported");
    }
    let mut dims = Vec::with_capacity(n_dims);
    for _ in 0..n_dims {
        dims.push(cursor.read_u64::<LittleEndian>()? as usize);
    }
    let ggml_type = GgmlType::from_id(cursor.read_u32::<LittleEndian>()?)
        .with_context(|| format!("Tensor '{name}'"))?;
    let offset = cursor.read_u64::<LittleEndian>()? as usize;
    Ok(TensorInfo { name, dims, ggml_type, offset })
}
