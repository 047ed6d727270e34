//! Cell Buffer Protocol
//!
//! Callers exchange cells with sessions through plain byte buffers, one per
//! session attribute, in the session's attribute order.
//!
//! ## Layout
//! ```text
//! fixed-size attribute : [cell 0 values][cell 1 values]...
//! variable-length      : offsets = [o0, o1, ...]  (u64, byte offset of
//!                        each cell's first value inside `values`)
//!                        values  = [cell 0 bytes][cell 1 bytes]...
//! coordinates          : fixed-size, one tuple of `dim_num` values per cell
//! ```
//!
//! All values are little-endian. Reads only ever write whole cells.

use std::fmt::Debug;

use crate::error::{AtlasError, Result};
use crate::schema::{CellValNum, Datatype};

// =============================================================================
// Scalar Values
// =============================================================================

/// A Rust type that maps onto one `Datatype`
pub trait Scalar: Copy + PartialOrd + Debug + Send + Sync + 'static {
    const DATATYPE: Datatype;

    /// Append the little-endian encoding
    fn write_le(self, out: &mut Vec<u8>);

    /// Read from the first `DATATYPE.size()` bytes
    fn read_le(bytes: &[u8]) -> Self;

    fn is_nan(self) -> bool {
        false
    }
}

macro_rules! impl_scalar {
    ($t:ty, $dt:expr, $n:expr) => {
        impl Scalar for $t {
            const DATATYPE: Datatype = $dt;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut b = [0u8; $n];
                b.copy_from_slice(&bytes[..$n]);
                <$t>::from_le_bytes(b)
            }
        }
    };
}

impl_scalar!(i32, Datatype::Int32, 4);
impl_scalar!(i64, Datatype::Int64, 8);
impl_scalar!(u8, Datatype::Char, 1);

impl Scalar for f32 {
    const DATATYPE: Datatype = Datatype::Float32;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 4];
        b.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(b)
    }

    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }
}

impl Scalar for f64 {
    const DATATYPE: Datatype = Datatype::Float64;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(b)
    }

    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }
}

/// Pack values into a fixed-size attribute buffer
pub fn encode<T: Scalar>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::DATATYPE.size());
    for v in values {
        v.write_le(&mut out);
    }
    out
}

/// Unpack a fixed-size attribute buffer
pub fn decode<T: Scalar>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = T::DATATYPE.size();
    if bytes.len() % size != 0 {
        return Err(AtlasError::InvalidInput(format!(
            "{} bytes is not a whole number of {:?} values",
            bytes.len(),
            T::DATATYPE
        )));
    }
    Ok(bytes.chunks_exact(size).map(T::read_le).collect())
}

/// Build the offsets/values pair of a variable-length `Char` attribute
pub fn var_from_strs(values: &[&str]) -> (Vec<u64>, Vec<u8>) {
    let mut offsets = Vec::with_capacity(values.len());
    let mut bytes = Vec::new();
    for v in values {
        offsets.push(bytes.len() as u64);
        bytes.extend_from_slice(v.as_bytes());
    }
    (offsets, bytes)
}

/// Split an offsets/values pair back into cells
pub fn var_cells<'a>(offsets: &[u64], values: &'a [u8]) -> Vec<&'a [u8]> {
    let mut cells = Vec::with_capacity(offsets.len());
    for (i, start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(values.len() as u64);
        let start = (*start as usize).min(values.len());
        let end = (end as usize).clamp(start, values.len());
        cells.push(&values[start..end]);
    }
    cells
}

// =============================================================================
// Attribute Layout
// =============================================================================

/// Type and values-per-cell of one session attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLayout {
    pub datatype: Datatype,
    pub cell_val_num: CellValNum,
}

impl AttributeLayout {
    /// Bytes per cell, or `None` for variable-length attributes
    pub fn cell_size(&self) -> Option<usize> {
        match self.cell_val_num {
            CellValNum::Fixed(n) => Some(n as usize * self.datatype.size()),
            CellValNum::Var => None,
        }
    }

    pub fn is_var(&self) -> bool {
        self.cell_val_num == CellValNum::Var
    }
}

// =============================================================================
// Write Buffers
// =============================================================================

/// One attribute's cells handed to a write call
#[derive(Debug, Clone, Copy)]
pub enum WriteBuffer<'a> {
    /// Packed fixed-size cells
    Fixed(&'a [u8]),
    /// Variable-length cells
    Var { offsets: &'a [u64], values: &'a [u8] },
}

impl<'a> WriteBuffer<'a> {
    /// Split into per-cell byte slices, checking the buffer against `layout`
    pub(crate) fn cells(&self, layout: &AttributeLayout, name: &str) -> Result<Vec<&'a [u8]>> {
        let value_size = layout.datatype.size();
        match (*self, layout.cell_size()) {
            (WriteBuffer::Fixed(data), Some(cell_size)) => {
                if data.len() % cell_size != 0 {
                    return Err(AtlasError::SchemaMismatch(format!(
                        "buffer of '{}' holds {} bytes, not a multiple of the {}-byte cell",
                        name,
                        data.len(),
                        cell_size
                    )));
                }
                Ok(data.chunks_exact(cell_size).collect())
            }
            (WriteBuffer::Var { offsets, values }, None) => {
                let mut cells = Vec::with_capacity(offsets.len());
                for (i, start) in offsets.iter().enumerate() {
                    let end = offsets.get(i + 1).copied().unwrap_or(values.len() as u64);
                    if *start > end || end > values.len() as u64 {
                        return Err(AtlasError::SchemaMismatch(format!(
                            "offsets of '{}' are not monotonic within {} value bytes",
                            name,
                            values.len()
                        )));
                    }
                    let cell = &values[*start as usize..end as usize];
                    if cell.len() % value_size != 0 {
                        return Err(AtlasError::SchemaMismatch(format!(
                            "cell {} of '{}' is not a whole number of {:?} values",
                            i, name, layout.datatype
                        )));
                    }
                    cells.push(cell);
                }
                Ok(cells)
            }
            (WriteBuffer::Fixed(_), None) => Err(AtlasError::SchemaMismatch(format!(
                "attribute '{}' is variable-length and needs offsets and values",
                name
            ))),
            (WriteBuffer::Var { .. }, Some(_)) => Err(AtlasError::SchemaMismatch(format!(
                "attribute '{}' is fixed-size and takes a single buffer",
                name
            ))),
        }
    }
}

// =============================================================================
// Read Buffers
// =============================================================================

/// One attribute's destination for a read call
#[derive(Debug)]
pub enum ReadBuffer<'a> {
    Fixed {
        data: &'a mut [u8],
        used: usize,
    },
    Var {
        offsets: &'a mut [u64],
        values: &'a mut [u8],
        cells: usize,
        used: usize,
    },
}

impl<'a> ReadBuffer<'a> {
    pub fn fixed(data: &'a mut [u8]) -> Self {
        ReadBuffer::Fixed { data, used: 0 }
    }

    pub fn var(offsets: &'a mut [u64], values: &'a mut [u8]) -> Self {
        ReadBuffer::Var {
            offsets,
            values,
            cells: 0,
            used: 0,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, ReadBuffer::Var { .. })
    }

    /// Bytes used in the primary buffer: data bytes, or `cells * 8` for offsets
    pub fn size(&self) -> usize {
        match self {
            ReadBuffer::Fixed { used, .. } => *used,
            ReadBuffer::Var { cells, .. } => cells * std::mem::size_of::<u64>(),
        }
    }

    /// Value bytes used (equals `size()` for fixed-size buffers)
    pub fn values_size(&self) -> usize {
        match self {
            ReadBuffer::Fixed { used, .. } | ReadBuffer::Var { used, .. } => *used,
        }
    }

    /// The filled part of the data (fixed) or values (variable) buffer
    pub fn data(&self) -> &[u8] {
        match self {
            ReadBuffer::Fixed { data, used } => &data[..*used],
            ReadBuffer::Var { values, used, .. } => &values[..*used],
        }
    }

    /// The filled part of the offsets buffer (empty for fixed-size buffers)
    pub fn offsets(&self) -> &[u64] {
        match self {
            ReadBuffer::Fixed { .. } => &[],
            ReadBuffer::Var { offsets, cells, .. } => &offsets[..*cells],
        }
    }

    /// Variable-length cells written by the last read
    pub fn var_cells(&self) -> Vec<&[u8]> {
        var_cells(self.offsets(), self.data())
    }

    pub(crate) fn reset(&mut self) {
        match self {
            ReadBuffer::Fixed { used, .. } => *used = 0,
            ReadBuffer::Var { cells, used, .. } => {
                *cells = 0;
                *used = 0;
            }
        }
    }

    /// Append one whole cell; false if it does not fit
    pub(crate) fn try_push(&mut self, cell: &[u8]) -> bool {
        match self {
            ReadBuffer::Fixed { data, used } => {
                if data.len() - *used < cell.len() {
                    return false;
                }
                data[*used..*used + cell.len()].copy_from_slice(cell);
                *used += cell.len();
                true
            }
            ReadBuffer::Var {
                offsets,
                values,
                cells,
                used,
            } => {
                if *cells >= offsets.len() || values.len() - *used < cell.len() {
                    return false;
                }
                offsets[*cells] = *used as u64;
                values[*used..*used + cell.len()].copy_from_slice(cell);
                *cells += 1;
                *used += cell.len();
                true
            }
        }
    }
}
