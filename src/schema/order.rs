//! Global cell order
//!
//! With regular tiles (tile extents present) cells are ordered first by the
//! tile they fall in (tile order over the tile grid), then by cell order
//! inside the tile. Without tile extents only the cell order applies.

use std::cmp::Ordering;

use super::{ArraySchema, CellOrder, Datatype, TileOrder};

/// Comparator over coordinate sort keys
#[derive(Debug, Clone)]
pub(crate) struct CellOrdering {
    datatype: Datatype,
    cell_order: CellOrder,
    tile_order: TileOrder,
    tiling: Option<Tiling>,
    hilbert: Option<Hilbert>,
}

/// Domain origin, used to turn a coordinate into an offset along its dimension
#[derive(Debug, Clone)]
enum Origin {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl Origin {
    fn offset(&self, datatype: Datatype, dim: usize, key: u64) -> u64 {
        match self {
            Origin::Int(lows) => (datatype.key_to_i64(key) as i128 - lows[dim] as i128) as u64,
            Origin::Float(lows) => (datatype.key_to_f64(key) - lows[dim]) as u64,
        }
    }
}

#[derive(Debug, Clone)]
enum Tiling {
    Int { lows: Vec<i64>, extents: Vec<i64> },
    Float { lows: Vec<f64>, extents: Vec<f64> },
}

impl Tiling {
    fn tile_index(&self, datatype: Datatype, dim: usize, key: u64) -> u64 {
        match self {
            Tiling::Int { lows, extents } => {
                let offset = datatype.key_to_i64(key) as i128 - lows[dim] as i128;
                (offset / extents[dim] as i128) as u64
            }
            Tiling::Float { lows, extents } => {
                ((datatype.key_to_f64(key) - lows[dim]) / extents[dim]).floor() as u64
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Hilbert {
    bits: u32,
    origin: Origin,
    /// Right shift per dimension so each offset fits in `bits`
    shifts: Vec<u32>,
}

impl CellOrdering {
    pub(crate) fn new(schema: &ArraySchema) -> Self {
        let datatype = schema.coords_type();
        let domain = schema.domain();

        let origin = match domain.int_ranges() {
            Some(ranges) => Origin::Int(ranges.iter().map(|r| r.0).collect()),
            None => Origin::Float(domain.f64_ranges().iter().map(|r| r.0).collect()),
        };

        let tiling = schema.tile_extents().map(|extents| match (&origin, extents.as_i64()) {
            (Origin::Int(lows), Some(ext)) => Tiling::Int {
                lows: lows.clone(),
                extents: ext,
            },
            _ => Tiling::Float {
                lows: domain.f64_ranges().iter().map(|r| r.0).collect(),
                extents: extents.as_f64(),
            },
        });

        let hilbert = (schema.cell_order() == CellOrder::Hilbert).then(|| {
            let dims = domain.dim_num().max(1) as u32;
            let bits = (63 / dims).clamp(1, 32);
            let spans: Vec<u64> = match domain.int_ranges() {
                Some(ranges) => ranges
                    .iter()
                    .map(|(lo, hi)| (*hi as i128 - *lo as i128) as u64)
                    .collect(),
                None => domain
                    .f64_ranges()
                    .iter()
                    .map(|(lo, hi)| (hi - lo) as u64)
                    .collect(),
            };
            let shifts = spans
                .iter()
                .map(|span| (64 - span.leading_zeros()).saturating_sub(bits))
                .collect();
            Hilbert {
                bits,
                origin: origin.clone(),
                shifts,
            }
        });

        Self {
            datatype,
            cell_order: schema.cell_order(),
            tile_order: schema.tile_order(),
            tiling,
            hilbert,
        }
    }

    /// Compare two coordinate keys in global order
    pub(crate) fn compare(&self, a: &[u64], b: &[u64]) -> Ordering {
        if let Some(tiling) = &self.tiling {
            let ord = self.compare_tiles(tiling, a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.compare_cells(a, b)
    }

    /// Compare two coordinate keys by cell order only
    pub(crate) fn compare_cells(&self, a: &[u64], b: &[u64]) -> Ordering {
        match self.cell_order {
            CellOrder::RowMajor => a.cmp(b),
            CellOrder::ColMajor => a.iter().rev().cmp(b.iter().rev()),
            CellOrder::Hilbert => self
                .hilbert_index(a)
                .cmp(&self.hilbert_index(b))
                .then_with(|| a.cmp(b)),
        }
    }

    fn compare_tiles(&self, tiling: &Tiling, a: &[u64], b: &[u64]) -> Ordering {
        let dims = a.len();
        for step in 0..dims {
            let d = match self.tile_order {
                TileOrder::RowMajor => step,
                TileOrder::ColMajor => dims - 1 - step,
            };
            let ord = tiling
                .tile_index(self.datatype, d, a[d])
                .cmp(&tiling.tile_index(self.datatype, d, b[d]));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Position of a cell along the Hilbert curve over the domain
    fn hilbert_index(&self, key: &[u64]) -> u64 {
        let Some(h) = &self.hilbert else {
            return 0;
        };
        let mut axes: Vec<u64> = key
            .iter()
            .enumerate()
            .map(|(d, k)| h.origin.offset(self.datatype, d, *k) >> h.shifts[d])
            .collect();
        hilbert_from_axes(&mut axes, h.bits)
    }
}

/// Skilling's transform: map axis values (each < 2^bits) to a Hilbert index.
///
/// `bits * axes.len()` must not exceed 64.
fn hilbert_from_axes(x: &mut [u64], bits: u32) -> u64 {
    let n = x.len();
    if n == 0 {
        return 0;
    }
    let m: u64 = 1 << (bits - 1);

    // Inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }

    // Interleave the transposed bits, most significant first
    let mut index = 0u64;
    for b in (0..bits).rev() {
        for v in x.iter() {
            index = (index << 1) | ((v >> b) & 1);
        }
    }
    index
}
