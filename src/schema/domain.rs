//! Domains, subarrays and tile extents
//!
//! A `Domain` is one inclusive `[lo, hi]` pair per dimension, typed by the
//! coordinate type. The same type describes query subarrays.

use serde::{Deserialize, Serialize};

use crate::buffer::Scalar;
use crate::error::{AtlasError, Result};

use super::{Datatype, KeyBox};

/// Inclusive per-dimension ranges, all of one coordinate type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Domain {
    Int32(Vec<[i32; 2]>),
    Int64(Vec<[i64; 2]>),
    Float32(Vec<[f32; 2]>),
    Float64(Vec<[f64; 2]>),
}

impl Domain {
    /// Coordinate type of the ranges
    pub fn datatype(&self) -> Datatype {
        match self {
            Domain::Int32(_) => Datatype::Int32,
            Domain::Int64(_) => Datatype::Int64,
            Domain::Float32(_) => Datatype::Float32,
            Domain::Float64(_) => Datatype::Float64,
        }
    }

    /// Number of dimensions
    pub fn dim_num(&self) -> usize {
        match self {
            Domain::Int32(r) => r.len(),
            Domain::Int64(r) => r.len(),
            Domain::Float32(r) => r.len(),
            Domain::Float64(r) => r.len(),
        }
    }

    /// Raw encoding: `lo, hi` little-endian pairs, dimension by dimension
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Domain::Int32(r) => pairs_to_bytes(r),
            Domain::Int64(r) => pairs_to_bytes(r),
            Domain::Float32(r) => pairs_to_bytes(r),
            Domain::Float64(r) => pairs_to_bytes(r),
        }
    }

    /// Decode the raw encoding produced by `to_bytes`
    pub fn from_bytes(datatype: Datatype, bytes: &[u8]) -> Result<Self> {
        let pair = 2 * datatype.size();
        if bytes.is_empty() || bytes.len() % pair != 0 {
            return Err(AtlasError::InvalidInput(format!(
                "domain buffer of {} bytes is not a whole number of {:?} pairs",
                bytes.len(),
                datatype
            )));
        }
        match datatype {
            Datatype::Int32 => Ok(Domain::Int32(pairs_from_bytes(bytes))),
            Datatype::Int64 => Ok(Domain::Int64(pairs_from_bytes(bytes))),
            Datatype::Float32 => Ok(Domain::Float32(pairs_from_bytes(bytes))),
            Datatype::Float64 => Ok(Domain::Float64(pairs_from_bytes(bytes))),
            Datatype::Char => Err(AtlasError::InvalidInput(
                "domain ranges must use a numeric type".to_string(),
            )),
        }
    }

    /// Reject NaN bounds and empty ranges
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        match self {
            Domain::Int32(r) => check_pairs(r),
            Domain::Int64(r) => check_pairs(r),
            Domain::Float32(r) => check_pairs(r),
            Domain::Float64(r) => check_pairs(r),
        }
    }

    pub(crate) fn key_box(&self) -> KeyBox {
        match self {
            Domain::Int32(r) => key_box_of(r),
            Domain::Int64(r) => key_box_of(r),
            Domain::Float32(r) => key_box_of(r),
            Domain::Float64(r) => key_box_of(r),
        }
    }

    /// Ranges as `i64` pairs, for integer domains only
    pub(crate) fn int_ranges(&self) -> Option<Vec<(i64, i64)>> {
        match self {
            Domain::Int32(r) => Some(r.iter().map(|p| (p[0] as i64, p[1] as i64)).collect()),
            Domain::Int64(r) => Some(r.iter().map(|p| (p[0], p[1])).collect()),
            _ => None,
        }
    }

    pub(crate) fn f64_ranges(&self) -> Vec<(f64, f64)> {
        match self {
            Domain::Int32(r) => r.iter().map(|p| (p[0] as f64, p[1] as f64)).collect(),
            Domain::Int64(r) => r.iter().map(|p| (p[0] as f64, p[1] as f64)).collect(),
            Domain::Float32(r) => r.iter().map(|p| (p[0] as f64, p[1] as f64)).collect(),
            Domain::Float64(r) => r.iter().map(|p| (p[0], p[1])).collect(),
        }
    }
}

/// Tile extent per dimension, typed like the domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TileExtents {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl TileExtents {
    pub fn datatype(&self) -> Datatype {
        match self {
            TileExtents::Int32(_) => Datatype::Int32,
            TileExtents::Int64(_) => Datatype::Int64,
            TileExtents::Float32(_) => Datatype::Float32,
            TileExtents::Float64(_) => Datatype::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TileExtents::Int32(e) => e.len(),
            TileExtents::Int64(e) => e.len(),
            TileExtents::Float32(e) => e.len(),
            TileExtents::Float64(e) => e.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn as_i64(&self) -> Option<Vec<i64>> {
        match self {
            TileExtents::Int32(e) => Some(e.iter().map(|v| *v as i64).collect()),
            TileExtents::Int64(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub(crate) fn as_f64(&self) -> Vec<f64> {
        match self {
            TileExtents::Int32(e) => e.iter().map(|v| *v as f64).collect(),
            TileExtents::Int64(e) => e.iter().map(|v| *v as f64).collect(),
            TileExtents::Float32(e) => e.iter().map(|v| *v as f64).collect(),
            TileExtents::Float64(e) => e.clone(),
        }
    }
}

// =============================================================================
// Generic Helpers
// =============================================================================

fn pairs_to_bytes<T: Scalar>(ranges: &[[T; 2]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ranges.len() * 2 * T::DATATYPE.size());
    for r in ranges {
        r[0].write_le(&mut out);
        r[1].write_le(&mut out);
    }
    out
}

fn pairs_from_bytes<T: Scalar>(bytes: &[u8]) -> Vec<[T; 2]> {
    let size = T::DATATYPE.size();
    bytes
        .chunks_exact(2 * size)
        .map(|c| [T::read_le(&c[..size]), T::read_le(&c[size..])])
        .collect()
}

fn check_pairs<T: Scalar>(ranges: &[[T; 2]]) -> std::result::Result<(), String> {
    for (d, r) in ranges.iter().enumerate() {
        if r[0].is_nan() || r[1].is_nan() {
            return Err(format!("dimension {} has a NaN bound", d));
        }
        if r[0] > r[1] {
            return Err(format!(
                "dimension {} has lower bound {:?} above upper bound {:?}",
                d, r[0], r[1]
            ));
        }
    }
    Ok(())
}

fn key_box_of<T: Scalar>(ranges: &[[T; 2]]) -> KeyBox {
    ranges.iter().map(|r| (key_of(r[0]), key_of(r[1]))).collect()
}

fn key_of<T: Scalar>(value: T) -> u64 {
    let mut bytes = Vec::with_capacity(8);
    value.write_le(&mut bytes);
    T::DATATYPE.sort_key(&bytes)
}
