//! Fragment Reader
//!
//! Opens a published fragment and loads individual tiles on demand. Only
//! the book stays in memory.
//!
//! Every tile-group file is opened once, up front. A session keeps reading
//! its fragments through these handles even after consolidation has removed
//! the fragment directory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AtlasError, Result};
use crate::schema::{boxes_intersect, ArraySchema};

use super::book::{FragmentBook, TileExtent};
use super::compression::decompress;
use super::{tile_file, var_tile_file};

/// A decoded tile of one attribute
#[derive(Debug)]
pub(crate) enum Tile {
    Fixed { data: Vec<u8>, cell_size: usize },
    Var { offsets: Vec<u64>, values: Vec<u8> },
}

impl Tile {
    pub(crate) fn len(&self) -> usize {
        match self {
            Tile::Fixed { data, cell_size } => data.len() / cell_size,
            Tile::Var { offsets, .. } => offsets.len(),
        }
    }

    /// Bytes of cell `i`
    pub(crate) fn cell(&self, i: usize) -> &[u8] {
        match self {
            Tile::Fixed { data, cell_size } => &data[i * cell_size..(i + 1) * cell_size],
            Tile::Var { offsets, values } => {
                let start = offsets[i] as usize;
                let end = offsets
                    .get(i + 1)
                    .map(|o| *o as usize)
                    .unwrap_or(values.len());
                &values[start..end]
            }
        }
    }
}

/// Open handles of one attribute's tile-group files
struct TileFiles {
    tiles: Mutex<File>,
    values: Option<Mutex<File>>,
}

/// Read access to one published fragment
pub(crate) struct FragmentReader {
    schema: Arc<ArraySchema>,
    book: FragmentBook,
    /// One per attribute, the coordinates last
    files: Vec<TileFiles>,
}

impl FragmentReader {
    pub(crate) fn open(schema: Arc<ArraySchema>, dir: &Path) -> Result<Self> {
        let book = FragmentBook::read(dir)?;
        let expected = schema.attribute_num() + 1;
        if book.attributes.len() != expected
            || book.mbrs.len() != book.tile_num()
            || book.attributes.iter().any(|g| g.tiles.len() != book.tile_num())
        {
            return Err(AtlasError::Corruption(format!(
                "book of {} does not match the array schema",
                dir.display()
            )));
        }

        let mut files = Vec::with_capacity(expected);
        for (idx, group) in book.attributes.iter().enumerate() {
            let name = schema.attribute_name(idx);
            let values = match group.var_tiles {
                Some(_) => Some(Mutex::new(File::open(dir.join(var_tile_file(name)))?)),
                None => None,
            };
            files.push(TileFiles {
                tiles: Mutex::new(File::open(dir.join(tile_file(name)))?),
                values,
            });
        }

        Ok(Self {
            schema,
            book,
            files,
        })
    }

    /// True if some cell of this fragment may lie inside `bx`
    pub(crate) fn overlaps(&self, bx: &[(u64, u64)]) -> bool {
        !self.book.bounding_box.is_empty() && boxes_intersect(&self.book.bounding_box, bx)
    }

    /// Tiles whose bounding box intersects `bx`, in order
    pub(crate) fn tiles_in(&self, bx: &[(u64, u64)]) -> Vec<usize> {
        self.book
            .mbrs
            .iter()
            .enumerate()
            .filter(|(_, mbr)| boxes_intersect(mbr, bx))
            .map(|(i, _)| i)
            .collect()
    }

    /// Load tile `tile` of attribute `attr` (the coordinates for `attribute_num()`)
    pub(crate) fn load_tile(&self, attr: usize, tile: usize) -> Result<Tile> {
        let name = self.schema.attribute_name(attr);
        let codec = self.schema.compression_of(attr);
        let group = &self.book.attributes[attr];
        let extent = group.tiles.get(tile).ok_or_else(|| {
            AtlasError::Corruption(format!("tile {} missing from '{}'", tile, name))
        })?;
        let files = &self.files[attr];
        let raw = read_extent(&files.tiles, extent)?;
        let raw = decompress(codec, raw, extent.raw_size as usize)?;

        let layout = self.schema.attribute_layout(attr);
        match (layout.cell_size(), &group.var_tiles) {
            (Some(cell_size), None) => {
                if raw.len() % cell_size != 0 {
                    return Err(AtlasError::Corruption(format!(
                        "tile {} of '{}' is not a whole number of cells",
                        tile, name
                    )));
                }
                Ok(Tile::Fixed {
                    data: raw,
                    cell_size,
                })
            }
            (None, Some(var_tiles)) => {
                let file = files.values.as_ref().ok_or_else(|| {
                    AtlasError::Corruption(format!("value file of '{}' is not open", name))
                })?;
                let var_extent = var_tiles.get(tile).ok_or_else(|| {
                    AtlasError::Corruption(format!("value tile {} missing from '{}'", tile, name))
                })?;
                let values = read_extent(file, var_extent)?;
                let values = decompress(codec, values, var_extent.raw_size as usize)?;
                let offsets: Vec<u64> = raw
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        u64::from_le_bytes(b)
                    })
                    .collect();
                let monotonic = offsets.windows(2).all(|w| w[0] <= w[1])
                    && offsets.last().map_or(true, |o| *o as usize <= values.len());
                if raw.len() % 8 != 0 || !monotonic {
                    return Err(AtlasError::Corruption(format!(
                        "offsets of tile {} of '{}' are invalid",
                        tile, name
                    )));
                }
                Ok(Tile::Var { offsets, values })
            }
            _ => Err(AtlasError::Corruption(format!(
                "tile group of '{}' does not match its cell layout",
                name
            ))),
        }
    }

    /// Coordinate keys of tile `tile`, flattened (`dim_num` keys per cell)
    pub(crate) fn load_keys(&self, tile: usize) -> Result<Vec<u64>> {
        let coords = self.load_tile(self.schema.attribute_num(), tile)?;
        let datatype = self.schema.coords_type();
        let size = datatype.size();
        let mut keys = Vec::with_capacity(coords.len() * self.schema.dim_num());
        for i in 0..coords.len() {
            for v in coords.cell(i).chunks_exact(size) {
                keys.push(datatype.sort_key(v));
            }
        }
        Ok(keys)
    }
}

fn read_extent(file: &Mutex<File>, extent: &TileExtent) -> Result<Vec<u8>> {
    let mut file = file.lock();
    file.seek(SeekFrom::Start(extent.offset))?;
    let mut buf = vec![0u8; extent.stored_size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
