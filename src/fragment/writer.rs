//! Fragment Writer
//!
//! Streams cells into the tile-group files of a hidden fragment directory.
//! Each attribute fills its own tiles at its own pace; tile boundaries come
//! from a shared `TileSchedule`, so every attribute ends up with the same
//! tiling once all cells are in.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AtlasError, Result};
use crate::schema::{ArraySchema, Compression, DenseLayout, KeyBox};

use super::book::{FragmentBook, TileExtent, TileGroupBook};
use super::compression::compress;
use super::{tile_file, var_tile_file};

/// Where tiles close
#[derive(Debug, Clone)]
pub(crate) enum TileSchedule {
    /// Sparse tiles of at most `capacity` cells
    Capacity(u64),
    /// Space tiles of a dense subarray
    Dense(DenseLayout),
}

impl TileSchedule {
    /// Cells of tile `idx`
    fn tile_size(&self, idx: u64) -> u64 {
        match self {
            TileSchedule::Capacity(capacity) => *capacity,
            TileSchedule::Dense(layout) => layout.tile_cell_count(idx).max(1),
        }
    }
}

/// Writer for one new fragment
pub(crate) struct FragmentWriter {
    schema: Arc<ArraySchema>,
    dir: PathBuf,
    sequence: u64,
    schedule: TileSchedule,
    sync: bool,
    /// One per attribute, the coordinates last
    groups: Vec<TileGroupWriter>,
    /// Bounding box of the open coordinates tile
    tile_mbr: Option<KeyBox>,
    mbrs: Vec<KeyBox>,
    bounding_box: Option<KeyBox>,
}

impl FragmentWriter {
    /// Create the (hidden) fragment directory and its tile-group files
    pub(crate) fn create(
        schema: Arc<ArraySchema>,
        dir: PathBuf,
        sequence: u64,
        schedule: TileSchedule,
        sync: bool,
    ) -> Result<Self> {
        fs::create_dir(&dir)?;

        let mut groups = Vec::with_capacity(schema.attribute_num() + 1);
        for idx in 0..=schema.attribute_num() {
            let name = schema.attribute_name(idx);
            let var = schema.attribute_layout(idx).is_var();
            groups.push(TileGroupWriter::create(
                &dir,
                name,
                var,
                schema.compression_of(idx),
            )?);
        }

        Ok(Self {
            schema,
            dir,
            sequence,
            schedule,
            sync,
            groups,
            tile_mbr: None,
            mbrs: Vec::new(),
            bounding_box: None,
        })
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Cells appended so far to attribute `attr`
    pub(crate) fn cell_count(&self, attr: usize) -> u64 {
        self.groups[attr].cells
    }

    /// Append one cell value to attribute `attr`
    pub(crate) fn append(&mut self, attr: usize, cell: &[u8]) -> Result<()> {
        let group = &mut self.groups[attr];
        group.push(cell);
        let tile_idx = group.book.tiles.len() as u64;
        let full = group.tile_cells >= self.schedule.tile_size(tile_idx);
        if full {
            group.flush_tile()?;
        }
        Ok(())
    }

    /// Append the coordinates of one cell
    pub(crate) fn append_coords(&mut self, key: &[u64]) -> Result<()> {
        let mut cell = Vec::with_capacity(self.schema.coords_size());
        self.schema.encode_coords(key, &mut cell);

        extend_box(&mut self.tile_mbr, key);
        extend_box(&mut self.bounding_box, key);

        let coords = self.schema.attribute_num();
        let before = self.groups[coords].book.tiles.len();
        self.append(coords, &cell)?;
        if self.groups[coords].book.tiles.len() > before {
            if let Some(mbr) = self.tile_mbr.take() {
                self.mbrs.push(mbr);
            }
        }
        Ok(())
    }

    /// Close the last tiles and write the book.
    ///
    /// Returns `None` (and removes the directory) if no cell was written.
    pub(crate) fn finish(mut self) -> Result<Option<FragmentBook>> {
        let cell_num = self.groups[0].cells;
        if let Some((idx, group)) = self
            .groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.cells != cell_num)
        {
            return Err(AtlasError::SchemaMismatch(format!(
                "attribute '{}' received {} cells, '{}' received {}",
                self.schema.attribute_name(idx),
                group.cells,
                self.schema.attribute_name(0),
                cell_num
            )));
        }

        if cell_num == 0 {
            self.abort()?;
            return Ok(None);
        }

        for group in self.groups.iter_mut() {
            if group.tile_cells > 0 {
                group.flush_tile()?;
            }
        }
        if let Some(mbr) = self.tile_mbr.take() {
            self.mbrs.push(mbr);
        }

        let coords = self.schema.attribute_num();
        let mut attributes = Vec::with_capacity(self.groups.len());
        for group in self.groups.iter_mut() {
            attributes.push(group.close(self.sync)?);
        }

        let book = FragmentBook {
            sequence: self.sequence,
            dense: matches!(self.schedule, TileSchedule::Dense(_)),
            cell_num,
            tile_cell_counts: std::mem::take(&mut self.groups[coords].tile_sizes),
            mbrs: std::mem::take(&mut self.mbrs),
            bounding_box: self.bounding_box.take().unwrap_or_default(),
            attributes,
        };
        book.write(&self.dir, self.sync)?;

        tracing::debug!(
            sequence = book.sequence,
            cells = book.cell_num,
            tiles = book.tile_num(),
            "fragment written"
        );
        Ok(Some(book))
    }

    /// Remove the fragment directory
    pub(crate) fn abort(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn extend_box(bx: &mut Option<KeyBox>, key: &[u64]) {
    match bx {
        Some(b) => {
            for (range, k) in b.iter_mut().zip(key.iter()) {
                range.0 = range.0.min(*k);
                range.1 = range.1.max(*k);
            }
        }
        None => *bx = Some(key.iter().map(|k| (*k, *k)).collect()),
    }
}

// =============================================================================
// Tile Group Writer
// =============================================================================

/// Writes the tiles of one attribute
struct TileGroupWriter {
    compression: Compression,
    file: BufWriter<File>,
    var_file: Option<BufWriter<File>>,
    offset: u64,
    var_offset: u64,
    /// Open tile: fixed values, or u64 offsets for var attributes
    tile: Vec<u8>,
    /// Open tile's value bytes (var attributes)
    var_tile: Vec<u8>,
    tile_cells: u64,
    cells: u64,
    tile_sizes: Vec<u64>,
    book: TileGroupBook,
}

impl TileGroupWriter {
    fn create(dir: &Path, name: &str, var: bool, compression: Compression) -> Result<Self> {
        let file = BufWriter::new(open_new(&dir.join(tile_file(name)))?);
        let var_file = if var {
            Some(BufWriter::new(open_new(&dir.join(var_tile_file(name)))?))
        } else {
            None
        };
        Ok(Self {
            compression,
            file,
            var_file,
            offset: 0,
            var_offset: 0,
            tile: Vec::new(),
            var_tile: Vec::new(),
            tile_cells: 0,
            cells: 0,
            tile_sizes: Vec::new(),
            book: TileGroupBook {
                tiles: Vec::new(),
                var_tiles: if var { Some(Vec::new()) } else { None },
            },
        })
    }

    fn push(&mut self, cell: &[u8]) {
        if self.var_file.is_some() {
            self.tile
                .extend_from_slice(&(self.var_tile.len() as u64).to_le_bytes());
            self.var_tile.extend_from_slice(cell);
        } else {
            self.tile.extend_from_slice(cell);
        }
        self.tile_cells += 1;
        self.cells += 1;
    }

    fn flush_tile(&mut self) -> Result<()> {
        let extent = write_tile(&mut self.file, &mut self.offset, self.compression, &self.tile)?;
        self.book.tiles.push(extent);

        if let (Some(var_file), Some(var_tiles)) = (self.var_file.as_mut(), self.book.var_tiles.as_mut()) {
            let extent = write_tile(var_file, &mut self.var_offset, self.compression, &self.var_tile)?;
            var_tiles.push(extent);
        }

        self.tile_sizes.push(self.tile_cells);
        self.tile.clear();
        self.var_tile.clear();
        self.tile_cells = 0;
        Ok(())
    }

    fn close(&mut self, sync: bool) -> Result<TileGroupBook> {
        self.file.flush()?;
        if sync {
            self.file.get_ref().sync_all()?;
        }
        if let Some(var_file) = self.var_file.as_mut() {
            var_file.flush()?;
            if sync {
                var_file.get_ref().sync_all()?;
            }
        }
        Ok(std::mem::take(&mut self.book))
    }
}

fn open_new(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create_new(true).write(true).open(path)?)
}

fn write_tile(
    file: &mut BufWriter<File>,
    offset: &mut u64,
    codec: Compression,
    raw: &[u8],
) -> Result<TileExtent> {
    let stored = compress(codec, raw)?;
    file.write_all(&stored)?;
    let extent = TileExtent {
        offset: *offset,
        stored_size: stored.len() as u64,
        raw_size: raw.len() as u64,
    };
    *offset += stored.len() as u64;
    Ok(extent)
}
