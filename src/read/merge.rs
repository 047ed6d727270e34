//! Merge Scan
//!
//! Produces the merged cell stream of a read: cells of every overlapping
//! fragment inside the subarray, in global order, newest fragment winning on
//! equal coordinates. Dense reads add a fill source that enumerates every
//! cell of the subarray with the lowest priority, so cells nobody wrote
//! still appear (with empty values).
//!
//! Sources are consumed lazily, one tile at a time.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::fragment::FragmentReader;
use crate::schema::{key_in_box, CellOrdering, DenseLayout, KeyBox};

/// Source id of the dense fill; fragment `i` of the session is source `i + 1`
pub(crate) const FILL_SOURCE: usize = 0;

/// One entry of the merged stream
#[derive(Debug, Clone)]
pub(crate) struct ResultCell {
    pub source: usize,
    pub tile: usize,
    /// Index of the cell inside its tile
    pub cell: usize,
    pub key: Vec<u64>,
}

// =============================================================================
// Sources
// =============================================================================

/// Cells of one fragment inside the subarray
struct FragmentScan {
    source: usize,
    fragment: Arc<FragmentReader>,
    subarray: KeyBox,
    dims: usize,
    tiles: Vec<usize>,
    next_tile: usize,
    tile: usize,
    keys: Vec<u64>,
    cell: usize,
}

impl FragmentScan {
    fn new(source: usize, fragment: Arc<FragmentReader>, subarray: KeyBox) -> Self {
        let tiles = fragment.tiles_in(&subarray);
        Self {
            source,
            dims: subarray.len(),
            fragment,
            subarray,
            tiles,
            next_tile: 0,
            tile: 0,
            keys: Vec::new(),
            cell: 0,
        }
    }

    fn next(&mut self) -> Result<Option<ResultCell>> {
        loop {
            while (self.cell + 1) * self.dims <= self.keys.len() {
                let i = self.cell;
                self.cell += 1;
                let key = &self.keys[i * self.dims..(i + 1) * self.dims];
                if key_in_box(key, &self.subarray) {
                    return Ok(Some(ResultCell {
                        source: self.source,
                        tile: self.tile,
                        cell: i,
                        key: key.to_vec(),
                    }));
                }
            }

            let Some(tile) = self.tiles.get(self.next_tile).copied() else {
                return Ok(None);
            };
            self.next_tile += 1;
            self.keys = self.fragment.load_keys(tile)?;
            self.tile = tile;
            self.cell = 0;
        }
    }
}

/// Every cell of a dense subarray
struct FillScan {
    layout: DenseLayout,
    ordering: CellOrdering,
    tile: u64,
    cells: std::vec::IntoIter<Vec<u64>>,
    cell: usize,
}

impl FillScan {
    fn next(&mut self) -> Option<ResultCell> {
        loop {
            if let Some(key) = self.cells.next() {
                let cell = self.cell;
                self.cell += 1;
                return Some(ResultCell {
                    source: FILL_SOURCE,
                    tile: self.tile.saturating_sub(1) as usize,
                    cell,
                    key,
                });
            }
            if self.tile >= self.layout.tile_count() {
                return None;
            }
            self.cells = self.layout.tile_cells(self.tile, &self.ordering).into_iter();
            self.tile += 1;
            self.cell = 0;
        }
    }
}

enum Source {
    Fragment(FragmentScan),
    Fill(FillScan),
}

impl Source {
    fn next(&mut self) -> Result<Option<ResultCell>> {
        match self {
            Source::Fragment(scan) => scan.next(),
            Source::Fill(scan) => Ok(scan.next()),
        }
    }
}

// =============================================================================
// Merge
// =============================================================================

/// K-way merge over all sources of a read
pub(crate) struct MergeScan {
    ordering: CellOrdering,
    sources: Vec<Source>,
    heads: Vec<Option<ResultCell>>,
    primed: bool,
}

impl MergeScan {
    /// `fragments` pairs each overlapping fragment with its source id
    pub(crate) fn new(
        ordering: CellOrdering,
        fragments: Vec<(usize, Arc<FragmentReader>)>,
        subarray: &KeyBox,
        fill: Option<DenseLayout>,
    ) -> Self {
        let mut sources: Vec<Source> = fragments
            .into_iter()
            .map(|(source, f)| Source::Fragment(FragmentScan::new(source, f, subarray.clone())))
            .collect();
        if let Some(layout) = fill {
            sources.push(Source::Fill(FillScan {
                layout,
                ordering: ordering.clone(),
                tile: 0,
                cells: Vec::new().into_iter(),
                cell: 0,
            }));
        }
        let heads = (0..sources.len()).map(|_| None).collect();
        Self {
            ordering,
            sources,
            heads,
            primed: false,
        }
    }

    /// Next cell of the merged stream
    pub(crate) fn next(&mut self) -> Result<Option<ResultCell>> {
        if !self.primed {
            for (head, source) in self.heads.iter_mut().zip(self.sources.iter_mut()) {
                *head = source.next()?;
            }
            self.primed = true;
        }

        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(cell) = head else { continue };
            best = match best.and_then(|b| self.heads[b].as_ref().map(|h| (b, h))) {
                None => Some(i),
                Some((b, current)) => match self.ordering.compare(&cell.key, &current.key) {
                    Ordering::Less => Some(i),
                    Ordering::Equal if cell.source > current.source => Some(i),
                    _ => Some(b),
                },
            };
        }

        let Some(winner_idx) = best else {
            return Ok(None);
        };
        let winner = self.heads[winner_idx].take();
        self.heads[winner_idx] = self.sources[winner_idx].next()?;

        // Older versions of the same cell are shadowed
        if let Some(w) = &winner {
            for i in 0..self.heads.len() {
                let shadowed = matches!(&self.heads[i], Some(h) if h.key == w.key);
                if shadowed {
                    self.heads[i] = self.sources[i].next()?;
                }
            }
        }
        Ok(winner)
    }
}
