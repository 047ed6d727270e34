//! Array Storage
//!
//! Manages the fragment set of one array directory.
//!
//! Fragments are discovered from directory names on every listing; nothing
//! about the fragment set is cached, so every session sees what is on disk
//! at the time it opens.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AtlasError, Result};
use crate::fragment::{fragment_dir_name, parse_fragment_dir, FragmentBook, FragmentReader, HIDDEN_PREFIX};
use crate::schema::{ArraySchema, MetadataSchema};

/// Schema file of an array directory
pub(crate) const ARRAY_SCHEMA_FILE: &str = "__array_schema.atl";

/// Schema file of a metadata directory
pub(crate) const METADATA_SCHEMA_FILE: &str = "__metadata_schema.atl";

/// Kind of object stored at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Array,
    Metadata,
}

/// Summary of one published fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    pub sequence: u64,
    pub cell_num: u64,
    pub tile_num: usize,
    pub tile_cell_counts: Vec<u64>,
    /// Written by a dense append session
    pub dense: bool,
}

/// What kind of object lives at `path`, if any
pub(crate) fn object_kind(path: &Path) -> Option<ObjectKind> {
    if path.join(ARRAY_SCHEMA_FILE).is_file() {
        Some(ObjectKind::Array)
    } else if path.join(METADATA_SCHEMA_FILE).is_file() {
        Some(ObjectKind::Metadata)
    } else {
        None
    }
}

/// Handle on an existing array or metadata directory
///
/// ## Concurrency:
/// - Listing and reading need no lock; hidden directories are skipped
/// - Sequence allocation, publish and retire assume the caller holds the
///   engine's advisory lock for this directory
#[derive(Debug, Clone)]
pub(crate) struct ArrayStorage {
    dir: PathBuf,
    sync: bool,
}

impl ArrayStorage {
    /// Create a new object directory holding only its schema file
    pub(crate) fn create(dir: &Path, schema_file: &str, schema_bytes: &[u8]) -> Result<()> {
        if let Some(kind) = object_kind(dir) {
            return Err(AtlasError::InvalidOperation(format!(
                "{:?} already exists at {}",
                kind,
                dir.display()
            )));
        }
        fs::create_dir_all(dir)?;

        // Write under a temporary name so a crash never leaves a torn schema
        let tmp = dir.join(format!("{}{}.tmp", HIDDEN_PREFIX, schema_file));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(schema_bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(schema_file))?;
        Ok(())
    }

    /// Open an existing object directory
    pub(crate) fn open(dir: &Path, sync: bool) -> Result<Self> {
        if object_kind(dir).is_none() {
            return Err(AtlasError::NotFound(format!(
                "no array or metadata at {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            sync,
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    pub(crate) fn load_array_schema(dir: &Path) -> Result<ArraySchema> {
        ArraySchema::from_bytes(&read_schema_file(dir, ARRAY_SCHEMA_FILE)?)
    }

    pub(crate) fn load_metadata_schema(dir: &Path) -> Result<MetadataSchema> {
        MetadataSchema::from_bytes(&read_schema_file(dir, METADATA_SCHEMA_FILE)?)
    }

    /// The array schema behind any object (the backing array for metadata)
    pub(crate) fn load_schema(&self) -> Result<Arc<ArraySchema>> {
        match object_kind(&self.dir) {
            Some(ObjectKind::Array) => Ok(Arc::new(Self::load_array_schema(&self.dir)?)),
            Some(ObjectKind::Metadata) => Ok(Arc::new(
                Self::load_metadata_schema(&self.dir)?.array_schema().clone(),
            )),
            None => Err(AtlasError::NotFound(format!(
                "no array or metadata at {}",
                self.dir.display()
            ))),
        }
    }

    // =========================================================================
    // Fragment Set
    // =========================================================================

    /// Published fragments, oldest → newest
    pub(crate) fn fragments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut found: Vec<(u64, PathBuf)> = self
            .scan()?
            .into_iter()
            .filter(|(_, hidden, _)| !hidden)
            .map(|(seq, _, path)| (seq, path))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found)
    }

    /// Open readers for every published fragment, oldest → newest
    pub(crate) fn open_fragments(
        &self,
        schema: &Arc<ArraySchema>,
    ) -> Result<Vec<Arc<FragmentReader>>> {
        self.fragments()?
            .iter()
            .map(|(_, path)| FragmentReader::open(Arc::clone(schema), path).map(Arc::new))
            .collect()
    }

    /// Book summaries of every published fragment, oldest → newest
    pub(crate) fn fragment_infos(&self) -> Result<Vec<FragmentInfo>> {
        self.fragments()?
            .iter()
            .map(|(_, path)| {
                let book = FragmentBook::read(path)?;
                Ok(FragmentInfo {
                    sequence: book.sequence,
                    cell_num: book.cell_num,
                    tile_num: book.tile_num(),
                    tile_cell_counts: book.tile_cell_counts,
                    dense: book.dense,
                })
            })
            .collect()
    }

    /// Next sequence number: one past every fragment, hidden ones included
    pub(crate) fn next_sequence(&self) -> Result<u64> {
        Ok(self
            .scan()?
            .iter()
            .map(|(seq, _, _)| *seq)
            .max()
            .map_or(1, |max| max + 1))
    }

    /// Directory a fragment is written into before it is published
    pub(crate) fn hidden_dir(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{}{}", HIDDEN_PREFIX, fragment_dir_name(sequence)))
    }

    pub(crate) fn fragment_dir(&self, sequence: u64) -> PathBuf {
        self.dir.join(fragment_dir_name(sequence))
    }

    /// Make a fully written fragment visible
    pub(crate) fn publish(&self, sequence: u64) -> Result<()> {
        fs::rename(self.hidden_dir(sequence), self.fragment_dir(sequence))?;
        if self.sync {
            sync_dir(&self.dir)?;
        }
        tracing::info!(dir = %self.dir.display(), sequence, "fragment published");
        Ok(())
    }

    /// Delete a published fragment
    pub(crate) fn retire(&self, sequence: u64) -> Result<()> {
        fs::remove_dir_all(self.fragment_dir(sequence))?;
        Ok(())
    }

    /// Delete an unpublished fragment, if it exists
    pub(crate) fn discard(&self, sequence: u64) -> Result<()> {
        let hidden = self.hidden_dir(sequence);
        if hidden.exists() {
            fs::remove_dir_all(&hidden)?;
            tracing::debug!(sequence, "unpublished fragment discarded");
        }
        Ok(())
    }

    /// Delete every hidden fragment directory; returns how many were removed
    pub(crate) fn remove_stale_hidden(&self) -> Result<usize> {
        let mut removed = 0;
        for (_, hidden, path) in self.scan()? {
            if hidden {
                fs::remove_dir_all(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Every fragment directory: `(sequence, hidden, path)`
    fn scan(&self) -> Result<Vec<(u64, bool, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some((seq, hidden)) = parse_fragment_dir(&name.to_string_lossy()) {
                out.push((seq, hidden, path));
            }
        }
        Ok(out)
    }
}

fn read_schema_file(dir: &Path, file: &str) -> Result<Vec<u8>> {
    fs::read(dir.join(file)).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            AtlasError::NotFound(format!("{} in {}", file, dir.display()))
        }
        _ => AtlasError::Io(e),
    })
}

/// Persist a rename inside `dir`
fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    fs::File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
