//! Metadata Schema
//!
//! A metadata object is a key-value store built on a sparse array. The user
//! sees attributes and a string key; internally:
//!
//! ```text
//! dimensions : __key_hi, __key_lo   (Int64, full range)
//!              the two halves of xxh3_128(key)
//! attributes : <user attributes...>, __key (Char, var)
//! ```
//!
//! Two distinct keys would have to collide on all 128 bits to share a cell.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{AtlasError, Result};

use super::array_schema::RESERVED_PREFIX;
use super::{
    ArraySchema, Attribute, CellOrder, CellValNum, Compression, Datatype, Domain,
    RawArraySchema, TileOrder,
};

/// Name of the hidden attribute holding the key itself
pub const KEY_ATTRIBUTE: &str = "__key";

const KEY_DIMENSIONS: [&str; 2] = ["__key_hi", "__key_lo"];

const SCHEMA_MAGIC: &[u8; 4] = b"ATMS";

/// Caller-supplied metadata description.
///
/// `types` and `cell_val_num` hold one entry per attribute; `compression`
/// holds one entry per attribute plus a trailing entry for the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetadataSchema {
    pub name: String,
    pub attributes: Vec<String>,
    pub types: Vec<Datatype>,
    pub cell_val_num: Option<Vec<CellValNum>>,
    pub capacity: Option<u64>,
    pub compression: Option<Vec<Compression>>,
}

impl RawMetadataSchema {
    pub fn new(name: &str, attributes: &[&str], types: &[Datatype]) -> Self {
        Self {
            name: name.to_string(),
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
            types: types.to_vec(),
            cell_val_num: None,
            capacity: None,
            compression: None,
        }
    }
}

/// Validated metadata schema and the array schema that stores it
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataSchema {
    array: ArraySchema,
}

impl MetadataSchema {
    pub fn new(raw: RawMetadataSchema) -> Result<Self> {
        let n = raw.attributes.len();
        if let Some(name) = raw
            .attributes
            .iter()
            .find(|a| a.starts_with(RESERVED_PREFIX))
        {
            return Err(AtlasError::Schema(format!(
                "name '{}' uses the reserved prefix '{}'",
                name, RESERVED_PREFIX
            )));
        }
        if raw.types.len() != n {
            return Err(AtlasError::Schema(format!(
                "expected {} types, got {}",
                n,
                raw.types.len()
            )));
        }
        if let Some(cvn) = &raw.cell_val_num {
            if cvn.len() != n {
                return Err(AtlasError::Schema(format!(
                    "expected {} cell_val_num entries, got {}",
                    n,
                    cvn.len()
                )));
            }
        }
        let compression = raw
            .compression
            .clone()
            .unwrap_or_else(|| vec![Compression::None; n + 1]);
        if compression.len() != n + 1 {
            return Err(AtlasError::Schema(format!(
                "expected {} compression entries (attributes + key), got {}",
                n + 1,
                compression.len()
            )));
        }

        let mut attributes = raw.attributes.clone();
        attributes.push(KEY_ATTRIBUTE.to_string());
        let mut types = raw.types.clone();
        types.push(Datatype::Char);
        types.push(Datatype::Int64);
        let mut cell_val_num = raw
            .cell_val_num
            .clone()
            .unwrap_or_else(|| vec![CellValNum::Fixed(1); n]);
        cell_val_num.push(CellValNum::Var);
        let key_compression = compression[n];
        let mut array_compression = compression;
        array_compression.push(key_compression);

        let array = ArraySchema::new_internal(RawArraySchema {
            name: raw.name,
            attributes,
            dimensions: KEY_DIMENSIONS.iter().map(|s| s.to_string()).collect(),
            dense: false,
            domain: Domain::Int64(vec![[i64::MIN, i64::MAX]; 2]),
            tile_extents: None,
            types,
            cell_val_num: Some(cell_val_num),
            cell_order: CellOrder::RowMajor,
            tile_order: TileOrder::RowMajor,
            capacity: raw.capacity,
            compression: Some(array_compression),
        })?;
        Ok(Self { array })
    }

    pub fn to_raw(&self) -> RawMetadataSchema {
        let attrs = self.attributes();
        let mut compression: Vec<Compression> = attrs.iter().map(|a| a.compression).collect();
        compression.push(self.array.compression_of(self.key_index()));
        RawMetadataSchema {
            name: self.array.name().to_string(),
            attributes: attrs.iter().map(|a| a.name.clone()).collect(),
            types: attrs.iter().map(|a| a.datatype).collect(),
            cell_val_num: Some(attrs.iter().map(|a| a.cell_val_num).collect()),
            capacity: Some(self.array.capacity()),
            compression: Some(compression),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode_framed(SCHEMA_MAGIC, &self.to_raw())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawMetadataSchema = codec::decode_framed(SCHEMA_MAGIC, bytes)?;
        Self::new(raw)
    }

    pub fn name(&self) -> &str {
        self.array.name()
    }

    /// User attributes (the key attribute excluded)
    pub fn attributes(&self) -> &[Attribute] {
        &self.array.attributes()[..self.key_index()]
    }

    pub fn attribute_num(&self) -> usize {
        self.key_index()
    }

    pub fn capacity(&self) -> u64 {
        self.array.capacity()
    }

    /// Index of an attribute; `KEY_ATTRIBUTE` resolves to `attribute_num()`
    pub fn attribute_index(&self, name: &str) -> Result<usize> {
        match self.array.attribute_index(name) {
            Ok(idx) if idx <= self.key_index() => Ok(idx),
            _ => Err(AtlasError::NotFound(format!(
                "attribute '{}' in metadata '{}'",
                name,
                self.name()
            ))),
        }
    }

    /// Schema of the backing sparse array
    pub(crate) fn array_schema(&self) -> &ArraySchema {
        &self.array
    }

    pub(crate) fn key_index(&self) -> usize {
        self.array.attribute_num() - 1
    }
}

/// Coordinates of a key in the backing array: both halves of its xxh3-128
pub(crate) fn key_coords(key: &[u8]) -> [i64; 2] {
    let h = xxhash_rust::xxh3::xxh3_128(key);
    [(h >> 64) as u64 as i64, h as u64 as i64]
}
