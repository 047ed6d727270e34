//! Dense Layout
//!
//! The regular tile grid of a dense array, restricted to a subarray. Tiles
//! are numbered in tile order; each tile covers the intersection of its
//! space tile with the subarray. Cells of a tile are enumerated in cell order.
//!
//! Nothing is materialized up front: tile boxes are derived from the tile
//! number, so a layout over a huge domain costs a few vectors.

use std::cmp::Ordering;

use crate::error::{AtlasError, Result};

use super::{ArraySchema, CellOrder, CellOrdering, Datatype, TileOrder};

/// Tile grid of a dense array over one subarray
#[derive(Debug, Clone)]
pub(crate) struct DenseLayout {
    datatype: Datatype,
    tile_order: TileOrder,
    cell_order: CellOrder,
    lows: Vec<i64>,
    extents: Vec<i64>,
    subarray: Vec<(i64, i64)>,
    /// First and last tile index touched, per dimension
    tile_ranges: Vec<(i64, i64)>,
}

impl DenseLayout {
    pub(crate) fn new(schema: &ArraySchema, subarray: &[(u64, u64)]) -> Result<Self> {
        let datatype = schema.coords_type();
        let (ranges, extents) = match (
            schema.domain().int_ranges(),
            schema.tile_extents().and_then(|e| e.as_i64()),
        ) {
            (Some(r), Some(e)) => (r, e),
            _ => {
                return Err(AtlasError::InvalidOperation(format!(
                    "array '{}' has no integer tile grid",
                    schema.name()
                )))
            }
        };

        let lows: Vec<i64> = ranges.iter().map(|r| r.0).collect();
        let subarray: Vec<(i64, i64)> = subarray
            .iter()
            .map(|(lo, hi)| (datatype.key_to_i64(*lo), datatype.key_to_i64(*hi)))
            .collect();
        let tile_ranges = subarray
            .iter()
            .enumerate()
            .map(|(d, (lo, hi))| {
                (
                    tile_of(*lo, lows[d], extents[d]),
                    tile_of(*hi, lows[d], extents[d]),
                )
            })
            .collect();

        Ok(Self {
            datatype,
            tile_order: schema.tile_order(),
            cell_order: schema.cell_order(),
            lows,
            extents,
            subarray,
            tile_ranges,
        })
    }

    /// Number of tiles intersecting the subarray
    pub(crate) fn tile_count(&self) -> u64 {
        self.tile_ranges
            .iter()
            .map(|(lo, hi)| (hi - lo + 1) as u64)
            .fold(1u64, |acc, n| acc.saturating_mul(n))
    }

    /// Number of cells in the subarray
    pub(crate) fn total_cells(&self) -> u64 {
        span_product(&self.subarray)
    }

    /// Number of cells of tile `idx` inside the subarray
    pub(crate) fn tile_cell_count(&self, idx: u64) -> u64 {
        span_product(&self.tile_box(idx))
    }

    /// Cell counts of every tile, in tile order
    #[cfg(test)]
    pub(crate) fn tile_cell_counts(&self) -> Vec<u64> {
        (0..self.tile_count()).map(|i| self.tile_cell_count(i)).collect()
    }

    /// Coordinate keys of the cells of tile `idx`, in cell order
    pub(crate) fn tile_cells(&self, idx: u64, ordering: &CellOrdering) -> Vec<Vec<u64>> {
        let bx = self.tile_box(idx);
        let fast_last = self.cell_order != CellOrder::ColMajor;
        let mut cells: Vec<Vec<u64>> = Odometer::new(bx, fast_last)
            .map(|cell| {
                cell.iter()
                    .map(|v| self.datatype.key_from_i64(*v))
                    .collect()
            })
            .collect();
        if self.cell_order == CellOrder::Hilbert {
            cells.sort_by(|a, b| ordering.compare_cells(a, b));
        }
        cells
    }

    /// The part of tile `idx` that lies inside the subarray
    fn tile_box(&self, idx: u64) -> Vec<(i64, i64)> {
        let tile = self.tile_coords(idx);
        tile.iter()
            .enumerate()
            .map(|(d, t)| {
                let start = self.lows[d] as i128 + *t as i128 * self.extents[d] as i128;
                let end = start + self.extents[d] as i128 - 1;
                let (lo, hi) = self.subarray[d];
                (
                    start.max(lo as i128) as i64,
                    end.min(hi as i128) as i64,
                )
            })
            .collect()
    }

    /// Tile grid coordinates of tile number `idx`
    fn tile_coords(&self, mut idx: u64) -> Vec<i64> {
        let dims = self.tile_ranges.len();
        let mut coords = vec![0i64; dims];
        for step in 0..dims {
            let d = match self.tile_order {
                TileOrder::RowMajor => dims - 1 - step,
                TileOrder::ColMajor => step,
            };
            let (lo, hi) = self.tile_ranges[d];
            let n = (hi - lo + 1) as u64;
            coords[d] = lo + (idx % n) as i64;
            idx /= n;
        }
        coords
    }
}

fn tile_of(value: i64, low: i64, extent: i64) -> i64 {
    ((value as i128 - low as i128) / extent as i128) as i64
}

fn span_product(bx: &[(i64, i64)]) -> u64 {
    bx.iter()
        .map(|(lo, hi)| (*hi as i128 - *lo as i128 + 1) as u64)
        .fold(1u64, |acc, n| acc.saturating_mul(n))
}

// =============================================================================
// Odometer
// =============================================================================

/// Enumerates every point of an integer box.
///
/// With `fast_last` the last dimension varies fastest (row-major),
/// otherwise the first one does (column-major).
pub(crate) struct Odometer {
    ranges: Vec<(i64, i64)>,
    current: Option<Vec<i64>>,
    fast_last: bool,
}

impl Odometer {
    pub(crate) fn new(ranges: Vec<(i64, i64)>, fast_last: bool) -> Self {
        let current = if ranges.iter().all(|(lo, hi)| lo <= hi) {
            Some(ranges.iter().map(|r| r.0).collect())
        } else {
            None
        };
        Self {
            ranges,
            current,
            fast_last,
        }
    }
}

impl Iterator for Odometer {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Vec<i64>> {
        let out = self.current.clone()?;
        let dims = self.ranges.len();
        let mut carried = true;
        if let Some(cur) = self.current.as_mut() {
            for step in 0..dims {
                let d = if self.fast_last { dims - 1 - step } else { step };
                let (lo, hi) = self.ranges[d];
                if cur[d].cmp(&hi) == Ordering::Less {
                    cur[d] += 1;
                    carried = false;
                    break;
                }
                cur[d] = lo;
            }
        }
        if carried {
            self.current = None;
        }
        Some(out)
    }
}
