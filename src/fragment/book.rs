//! Fragment Book
//!
//! The footer of a fragment: everything a reader needs to locate tiles and
//! skip the ones outside a query. Kept in memory while a fragment is open.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::schema::KeyBox;

use super::BOOK_FILE;

const BOOK_MAGIC: &[u8; 4] = b"ATFB";

/// Location of one tile inside its tile-group file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TileExtent {
    pub offset: u64,
    pub stored_size: u64,
    pub raw_size: u64,
}

/// Tiles of one attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TileGroupBook {
    pub tiles: Vec<TileExtent>,
    /// Value tiles of a variable-length attribute
    pub var_tiles: Option<Vec<TileExtent>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FragmentBook {
    pub sequence: u64,
    /// Written by a dense append session
    pub dense: bool,
    pub cell_num: u64,
    pub tile_cell_counts: Vec<u64>,
    /// Bounding box of every tile (coordinate sort keys)
    pub mbrs: Vec<KeyBox>,
    pub bounding_box: KeyBox,
    /// One entry per attribute, the coordinates last
    pub attributes: Vec<TileGroupBook>,
}

impl FragmentBook {
    /// Write the book into a fragment directory
    pub(crate) fn write(&self, dir: &Path, sync: bool) -> Result<()> {
        let bytes = codec::encode_framed(BOOK_MAGIC, self)?;
        let mut file = File::create(dir.join(BOOK_FILE))?;
        file.write_all(&bytes)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Read the book of a fragment directory
    pub(crate) fn read(dir: &Path) -> Result<Self> {
        let bytes = fs::read(dir.join(BOOK_FILE))?;
        codec::decode_framed(BOOK_MAGIC, &bytes)
    }

    pub(crate) fn tile_num(&self) -> usize {
        self.tile_cell_counts.len()
    }
}
