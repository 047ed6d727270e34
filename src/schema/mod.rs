//! Schema Module
//!
//! Immutable description of an array (or metadata object): attributes,
//! dimensions, domain, tiling and compression.
//!
//! ## Responsibilities
//! - Validate raw, parallel-array schema fields once, at construction
//! - Persist schemas in a stable, checksummed encoding
//! - Define the global cell order used by every other component
//!
//! ## Coordinate Keys
//! Internally every coordinate value is mapped onto an order-preserving
//! `u64` ("sort key"). Comparing keys is equivalent to comparing the
//! original values, for every coordinate type, so ordering, bounding boxes
//! and subarray tests never need to know the concrete type.

mod array_schema;
mod dense;
mod domain;
mod metadata_schema;
mod order;

use serde::{Deserialize, Serialize};

pub use array_schema::{ArraySchema, Attribute, RawArraySchema, COORDS_ATTRIBUTE, DEFAULT_CAPACITY};
pub use domain::{Domain, TileExtents};
pub use metadata_schema::{MetadataSchema, RawMetadataSchema, KEY_ATTRIBUTE};

pub(crate) use dense::DenseLayout;
pub(crate) use metadata_schema::key_coords;
pub(crate) use order::CellOrdering;

/// A box of inclusive sort-key ranges, one per dimension
pub(crate) type KeyBox = Vec<(u64, u64)>;

/// True if `key` lies inside `bx` on every dimension
pub(crate) fn key_in_box(key: &[u64], bx: &[(u64, u64)]) -> bool {
    key.iter()
        .zip(bx.iter())
        .all(|(k, (lo, hi))| k >= lo && k <= hi)
}

/// True if the two boxes share at least one point
pub(crate) fn boxes_intersect(a: &[(u64, u64)], b: &[(u64, u64)]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|((alo, ahi), (blo, bhi))| alo <= bhi && blo <= ahi)
}

// =============================================================================
// Scalar Types
// =============================================================================

/// Scalar type of an attribute value or a coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    Int32,
    Int64,
    Float32,
    Float64,
    Char,
}

impl Datatype {
    /// Size of one value in bytes
    pub fn size(self) -> usize {
        match self {
            Datatype::Int32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Float64 => 8,
            Datatype::Char => 1,
        }
    }

    /// Numeric types may be used for coordinates
    pub fn is_numeric(self) -> bool {
        !matches!(self, Datatype::Char)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Datatype::Int32 | Datatype::Int64)
    }

    /// The value reported for dense cells that were never written
    pub fn empty_value(self) -> Vec<u8> {
        match self {
            Datatype::Int32 => i32::MAX.to_le_bytes().to_vec(),
            Datatype::Int64 => i64::MAX.to_le_bytes().to_vec(),
            Datatype::Float32 => f32::MAX.to_le_bytes().to_vec(),
            Datatype::Float64 => f64::MAX.to_le_bytes().to_vec(),
            Datatype::Char => vec![0x7F],
        }
    }

    /// Order-preserving key of one little-endian encoded value.
    ///
    /// `bytes` must hold at least `self.size()` bytes.
    pub(crate) fn sort_key(self, bytes: &[u8]) -> u64 {
        match self {
            Datatype::Int32 => (i32::from_le_bytes(le4(bytes)) as u32 ^ 0x8000_0000) as u64,
            Datatype::Int64 => i64::from_le_bytes(le8(bytes)) as u64 ^ (1 << 63),
            Datatype::Float32 => {
                let bits = f32::from_le_bytes(le4(bytes)).to_bits();
                let key = if bits & 0x8000_0000 != 0 {
                    !bits
                } else {
                    bits | 0x8000_0000
                };
                key as u64
            }
            Datatype::Float64 => {
                let bits = f64::from_le_bytes(le8(bytes)).to_bits();
                if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits | (1 << 63)
                }
            }
            Datatype::Char => bytes[0] as u64,
        }
    }

    /// Inverse of `sort_key`: append the little-endian value to `out`
    pub(crate) fn write_key(self, key: u64, out: &mut Vec<u8>) {
        match self {
            Datatype::Int32 => {
                out.extend_from_slice(&(((key as u32) ^ 0x8000_0000) as i32).to_le_bytes())
            }
            Datatype::Int64 => out.extend_from_slice(&((key ^ (1 << 63)) as i64).to_le_bytes()),
            Datatype::Float32 => {
                let k = key as u32;
                let bits = if k & 0x8000_0000 != 0 { k & 0x7FFF_FFFF } else { !k };
                out.extend_from_slice(&f32::from_bits(bits).to_le_bytes())
            }
            Datatype::Float64 => {
                let bits = if key & (1 << 63) != 0 {
                    key & !(1 << 63)
                } else {
                    !key
                };
                out.extend_from_slice(&f64::from_bits(bits).to_le_bytes())
            }
            Datatype::Char => out.push(key as u8),
        }
    }

    /// Key of an integer value (Int32 values are truncated to 32 bits)
    pub(crate) fn key_from_i64(self, value: i64) -> u64 {
        match self {
            Datatype::Int32 => ((value as i32) as u32 ^ 0x8000_0000) as u64,
            _ => value as u64 ^ (1 << 63),
        }
    }

    /// Integer value behind a key; floating-point values are truncated
    pub(crate) fn key_to_i64(self, key: u64) -> i64 {
        match self {
            Datatype::Int32 => ((key as u32) ^ 0x8000_0000) as i32 as i64,
            Datatype::Int64 => (key ^ (1 << 63)) as i64,
            Datatype::Char => key as i64,
            Datatype::Float32 | Datatype::Float64 => self.key_to_f64(key) as i64,
        }
    }

    /// Numeric value behind a key
    pub(crate) fn key_to_f64(self, key: u64) -> f64 {
        match self {
            Datatype::Float32 => {
                let mut bytes = Vec::with_capacity(4);
                self.write_key(key, &mut bytes);
                f32::from_le_bytes(le4(&bytes)) as f64
            }
            Datatype::Float64 => {
                let mut bytes = Vec::with_capacity(8);
                self.write_key(key, &mut bytes);
                f64::from_le_bytes(le8(&bytes))
            }
            _ => self.key_to_i64(key) as f64,
        }
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

// =============================================================================
// Attribute Properties
// =============================================================================

/// Number of values an attribute stores per cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValNum {
    /// Exactly N values per cell
    Fixed(u32),
    /// A variable number of values per cell (offsets + values buffers)
    Var,
}

/// Per-tile compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    /// LZ4 block compression
    Lz4,
    /// Deflate in a gzip frame
    Gzip,
}

// =============================================================================
// Orders
// =============================================================================

/// Order of cells inside a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellOrder {
    RowMajor,
    ColMajor,
    /// Hilbert space-filling curve, ties broken row-major
    Hilbert,
}

/// Order of tiles on the regular tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileOrder {
    RowMajor,
    ColMajor,
}
