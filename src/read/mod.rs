//! Read Engine
//!
//! Fills caller buffers with the cells of a subarray, in global order.
//!
//! ## Overflow / Resume
//! Every session attribute has its own cursor into the merged cell stream:
//!
//! ```text
//! merged stream : c0 c1 c2 c3 c4 c5 c6 ...
//! queue         :       [c2 c3 c4 c5]          retained cells
//! cursor "a"    :          ^ position 3
//! cursor "b"    :       ^ position 2           (smaller buffer)
//! ```
//!
//! A read copies whole cells until the attribute's buffer is full, then sets
//! the attribute's overflow flag; the next read resumes at the exact next
//! cell. Queue entries are dropped once every cursor has moved past them.

mod merge;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{AttributeLayout, ReadBuffer};
use crate::error::{AtlasError, Result};
use crate::fragment::{FragmentReader, Tile};
use crate::schema::{ArraySchema, CellOrdering, CellValNum, DenseLayout, Domain, KeyBox};
use crate::storage::ArrayStorage;

use merge::{MergeScan, ResultCell, FILL_SOURCE};

/// Per-attribute progress through the merged stream
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    /// Absolute index of the next cell to emit
    position: u64,
    overflow: bool,
    done: bool,
}

/// The tile of one fragment kept in memory for one session attribute.
///
/// A fragment emits its cells tile by tile, so its slot is replaced only
/// when its scan moves on to the next tile.
struct CachedTile {
    tile: usize,
    data: Tile,
}

/// Cached tiles of one session attribute, indexed by fragment position
type TileCache = Vec<Option<CachedTile>>;

/// A read session on one array
pub struct ReadSession {
    schema: Arc<ArraySchema>,
    /// Every published fragment at open time, oldest → newest
    fragments: Vec<Arc<FragmentReader>>,
    ordering: CellOrdering,
    subarray: KeyBox,
    /// Positions in `fragments` whose bounding box meets the subarray
    overlapping: Vec<usize>,
    dense_fill: bool,
    attributes: Vec<usize>,
    merge: MergeScan,
    merge_done: bool,
    queue: VecDeque<ResultCell>,
    /// Absolute index of `queue[0]`
    queue_start: u64,
    cursors: Vec<Cursor>,
    tile_cache: Vec<TileCache>,
}

impl ReadSession {
    /// Open a read session over the published fragments of `storage`
    pub(crate) fn open(
        schema: Arc<ArraySchema>,
        storage: &ArrayStorage,
        subarray: Option<&Domain>,
        attributes: Option<&[&str]>,
    ) -> Result<Self> {
        let subarray = match subarray {
            Some(s) => schema.subarray_box(s)?,
            None => schema.domain_box(),
        };
        let attributes = schema.session_attributes(attributes, true)?;
        let fragments = storage.open_fragments(&schema)?;
        Self::new(schema, fragments, subarray, attributes, true)
    }

    /// Session over a fixed fragment list.
    ///
    /// `dense_fill` reports unwritten cells of dense arrays with empty values.
    pub(crate) fn new(
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<FragmentReader>>,
        subarray: KeyBox,
        attributes: Vec<usize>,
        dense_fill: bool,
    ) -> Result<Self> {
        let ordering = CellOrdering::new(&schema);
        let overlapping = overlapping(&fragments, &subarray);
        let merge = build_merge(&schema, &ordering, &fragments, &overlapping, &subarray, dense_fill)?;
        let n = attributes.len();
        let fragments_len = fragments.len();

        tracing::debug!(
            array = schema.name(),
            fragments = fragments.len(),
            overlapping = overlapping.len(),
            "read session opened"
        );

        Ok(Self {
            schema,
            fragments,
            ordering,
            subarray,
            overlapping,
            dense_fill,
            attributes,
            merge,
            merge_done: false,
            queue: VecDeque::new(),
            queue_start: 0,
            cursors: vec![Cursor::default(); n],
            tile_cache: empty_caches(n, fragments_len),
        })
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    /// Names of the session attributes, in buffer order
    pub fn attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .map(|a| self.schema.attribute_name(*a))
            .collect()
    }

    /// Fill one buffer per session attribute
    pub fn read(&mut self, buffers: &mut [ReadBuffer<'_>]) -> Result<()> {
        if buffers.len() != self.attributes.len() {
            return Err(AtlasError::SchemaMismatch(format!(
                "expected {} buffers, got {}",
                self.attributes.len(),
                buffers.len()
            )));
        }
        for (i, buffer) in buffers.iter().enumerate() {
            self.check_buffer(i, buffer)?;
        }
        for (i, buffer) in buffers.iter_mut().enumerate() {
            self.fill_attribute(i, buffer)?;
        }
        Ok(())
    }

    /// True if the last read of session attribute `i` stopped on a full buffer
    pub fn overflow(&self, i: usize) -> bool {
        self.cursors.get(i).map_or(false, |c| c.overflow)
    }

    /// True once every attribute has consumed the whole stream
    pub fn is_complete(&self) -> bool {
        self.cursors.iter().all(|c| c.done)
    }

    /// Restrict the session to a new subarray and restart the scan
    pub fn reset_subarray(&mut self, subarray: &Domain) -> Result<()> {
        let bx = self.schema.subarray_box(subarray)?;
        self.reset_subarray_box(bx)
    }

    pub(crate) fn reset_subarray_box(&mut self, bx: KeyBox) -> Result<()> {
        if bx != self.subarray {
            self.overlapping = overlapping(&self.fragments, &bx);
            self.subarray = bx;
        }
        self.restart()
    }

    /// Switch to a new attribute list and restart the scan
    pub fn reset_attributes(&mut self, attributes: Option<&[&str]>) -> Result<()> {
        self.attributes = self.schema.session_attributes(attributes, true)?;
        self.restart()
    }

    pub(crate) fn set_attributes(&mut self, attributes: Vec<usize>) -> Result<()> {
        self.attributes = attributes;
        self.restart()
    }

    pub fn finalize(self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn attribute_layouts(&self) -> Vec<AttributeLayout> {
        self.attributes
            .iter()
            .map(|a| self.schema.attribute_layout(*a))
            .collect()
    }

    pub(crate) fn is_done(&self, i: usize) -> bool {
        self.cursors.get(i).map_or(true, |c| c.done)
    }

    /// Copy the next cells of session attribute `i` into `buffer`.
    ///
    /// Returns the number of cells written.
    pub(crate) fn fill_attribute(&mut self, i: usize, buffer: &mut ReadBuffer<'_>) -> Result<usize> {
        self.check_buffer(i, buffer)?;
        buffer.reset();

        let attr = self.attributes[i];
        let Self {
            schema,
            fragments,
            merge,
            merge_done,
            queue,
            queue_start,
            cursors,
            tile_cache,
            ..
        } = self;
        let cursor = &mut cursors[i];
        cursor.overflow = false;
        if cursor.done {
            return Ok(0);
        }

        let mut scratch = Vec::new();
        let mut written = 0;
        loop {
            let idx = (cursor.position - *queue_start) as usize;
            if idx >= queue.len() {
                if !*merge_done {
                    if let Some(cell) = merge.next()? {
                        queue.push_back(cell);
                        continue;
                    }
                    *merge_done = true;
                }
                cursor.done = true;
                break;
            }

            let value = cell_bytes(
                &**schema,
                fragments.as_slice(),
                &mut tile_cache[i],
                attr,
                &queue[idx],
                &mut scratch,
            )?;
            if !buffer.try_push(value) {
                cursor.overflow = true;
                break;
            }
            cursor.position += 1;
            written += 1;
        }

        self.trim_queue();
        Ok(written)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_buffer(&self, i: usize, buffer: &ReadBuffer<'_>) -> Result<()> {
        let attr = *self.attributes.get(i).ok_or_else(|| {
            AtlasError::InvalidInput(format!("session has no attribute number {}", i))
        })?;
        let layout = self.schema.attribute_layout(attr);
        if layout.is_var() != buffer.is_var() {
            return Err(AtlasError::SchemaMismatch(format!(
                "attribute '{}' needs a {} buffer",
                self.schema.attribute_name(attr),
                if layout.is_var() { "variable-length" } else { "fixed-size" }
            )));
        }
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.merge = build_merge(
            &self.schema,
            &self.ordering,
            &self.fragments,
            &self.overlapping,
            &self.subarray,
            self.dense_fill,
        )?;
        self.merge_done = false;
        self.queue.clear();
        self.queue_start = 0;
        self.cursors = vec![Cursor::default(); self.attributes.len()];
        self.tile_cache = empty_caches(self.attributes.len(), self.fragments.len());
        Ok(())
    }

    /// Drop queue entries every cursor has passed
    fn trim_queue(&mut self) {
        let min = self
            .cursors
            .iter()
            .map(|c| c.position)
            .min()
            .unwrap_or(self.queue_start);
        while self.queue_start < min && self.queue.pop_front().is_some() {
            self.queue_start += 1;
        }
    }
}

fn empty_caches(attributes: usize, fragments: usize) -> Vec<TileCache> {
    (0..attributes)
        .map(|_| (0..fragments).map(|_| None).collect())
        .collect()
}

fn overlapping(fragments: &[Arc<FragmentReader>], subarray: &[(u64, u64)]) -> Vec<usize> {
    fragments
        .iter()
        .enumerate()
        .filter(|(_, f)| f.overlaps(subarray))
        .map(|(i, _)| i)
        .collect()
}

fn build_merge(
    schema: &ArraySchema,
    ordering: &CellOrdering,
    fragments: &[Arc<FragmentReader>],
    overlapping: &[usize],
    subarray: &KeyBox,
    dense_fill: bool,
) -> Result<MergeScan> {
    let sources = overlapping
        .iter()
        .map(|i| (i + 1, Arc::clone(&fragments[*i])))
        .collect();
    let fill = if dense_fill && schema.is_dense() {
        Some(DenseLayout::new(schema, subarray)?)
    } else {
        None
    };
    Ok(MergeScan::new(ordering.clone(), sources, subarray, fill))
}

/// Bytes of attribute `attr` of one merged cell
fn cell_bytes<'c>(
    schema: &ArraySchema,
    fragments: &[Arc<FragmentReader>],
    cache: &'c mut TileCache,
    attr: usize,
    cell: &ResultCell,
    scratch: &'c mut Vec<u8>,
) -> Result<&'c [u8]> {
    if attr == schema.attribute_num() {
        scratch.clear();
        schema.encode_coords(&cell.key, scratch);
        return Ok(scratch.as_slice());
    }

    if cell.source == FILL_SOURCE {
        let attribute = &schema.attributes()[attr];
        let empty = attribute.datatype.empty_value();
        let repeat = match attribute.cell_val_num {
            CellValNum::Fixed(n) => n as usize,
            CellValNum::Var => 1,
        };
        scratch.clear();
        for _ in 0..repeat {
            scratch.extend_from_slice(&empty);
        }
        return Ok(scratch.as_slice());
    }

    let position = cell.source - 1;
    let (fragment, slot) = match (fragments.get(position), cache.get_mut(position)) {
        (Some(fragment), Some(slot)) => (fragment, slot),
        _ => {
            return Err(AtlasError::Corruption(format!(
                "merged cell names unknown fragment {}",
                cell.source
            )))
        }
    };
    let hit = matches!(slot, Some(c) if c.tile == cell.tile);
    if !hit {
        *slot = Some(CachedTile {
            tile: cell.tile,
            data: fragment.load_tile(attr, cell.tile)?,
        });
    }
    match slot {
        Some(c) if cell.cell < c.data.len() => Ok(c.data.cell(cell.cell)),
        _ => Err(AtlasError::Corruption(format!(
            "cell {} missing from tile {} of '{}'",
            cell.cell,
            cell.tile,
            schema.attribute_name(attr)
        ))),
    }
}
