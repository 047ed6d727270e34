//! Metadata Objects
//!
//! Key-value storage on top of a sparse array. Each key is hashed onto a
//! 2-D coordinate, and the key itself is kept in the hidden `__key` attribute:
//!
//! ```text
//!   key "alpha" ──xxh3_128──► (hi, lo) ──► cell of the backing array
//!                                          ├─ user attributes
//!                                          └─ __key = "alpha"
//! ```
//!
//! Every `write` call becomes one unsorted write, so a key written again in a
//! later call shadows the older value, and the last duplicate inside one call
//! wins. A point read restricts the backing read session to the key's cell.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::{self, ReadBuffer, WriteBuffer};
use crate::consolidate::ConsolidationSummary;
use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::iterator::ArrayIterator;
use crate::read::ReadSession;
use crate::schema::{
    key_coords, Datatype, KeyBox, MetadataSchema, COORDS_ATTRIBUTE, KEY_ATTRIBUTE,
};
use crate::storage::ArrayStorage;
use crate::write::{WriteMode, WriteSession};

/// Mode a metadata object is opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMode {
    Write,
    Read,
}

enum Session {
    Write(WriteSession),
    Read {
        session: ReadSession,
        /// Key whose cell the session is restricted to
        key: Option<Vec<u8>>,
    },
}

/// An open metadata session
pub struct Metadata {
    engine: Engine,
    path: PathBuf,
    schema: MetadataSchema,
    session: Session,
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata")
            .field("path", &self.path)
            .field("name", &self.schema.name())
            .finish()
    }
}

impl Metadata {
    pub(crate) fn open(
        engine: &Engine,
        path: &Path,
        mode: MetadataMode,
        attributes: Option<&[&str]>,
    ) -> Result<Self> {
        let sync = engine.config().sync_on_finalize;
        let storage = ArrayStorage::open(path, sync)?;
        let schema = ArrayStorage::load_metadata_schema(path)?;
        let array = Arc::new(schema.array_schema().clone());

        let session = match mode {
            MetadataMode::Write => {
                let attrs = metadata_attributes(&schema, attributes, false)?;
                if attrs.contains(&schema.key_index()) {
                    return Err(AtlasError::InvalidInput(format!(
                        "keys are passed to write separately, not as '{}'",
                        KEY_ATTRIBUTE
                    )));
                }
                let mut names: Vec<&str> = attrs.iter().map(|a| array.attribute_name(*a)).collect();
                names.push(KEY_ATTRIBUTE);
                names.push(COORDS_ATTRIBUTE);

                let lock = engine.lock(path)?;
                Session::Write(WriteSession::open(
                    Arc::clone(&array),
                    storage,
                    lock,
                    sync,
                    WriteMode::Unsorted,
                    None,
                    Some(&names),
                )?)
            }
            MetadataMode::Read => {
                let attrs = metadata_attributes(&schema, attributes, true)?;
                let fragments = storage.open_fragments(&array)?;
                let full = array.domain_box();
                Session::Read {
                    session: ReadSession::new(array, fragments, full, attrs, false)?,
                    key: None,
                }
            }
        };

        Ok(Self {
            engine: engine.clone(),
            path: path.to_path_buf(),
            schema,
            session,
        })
    }

    pub fn schema(&self) -> &MetadataSchema {
        &self.schema
    }

    /// Session attribute names, in buffer order
    pub fn attributes(&self) -> Vec<&str> {
        let mut names = match &self.session {
            Session::Write(s) => s.attributes(),
            Session::Read { session, .. } => session.attributes(),
        };
        // The write session's key and coordinates are internal
        if matches!(self.session, Session::Write(_)) {
            names.truncate(names.len().saturating_sub(2));
        }
        names
    }

    /// Write one value per key for every session attribute.
    ///
    /// `buffers` hold `keys.len()` cells each, in session attribute order.
    pub fn write(&mut self, keys: &[&str], buffers: &[WriteBuffer<'_>]) -> Result<()> {
        let Session::Write(session) = &mut self.session else {
            return Err(AtlasError::InvalidOperation(
                "metadata is open for reading".to_string(),
            ));
        };
        if buffers.len() + 2 != session.attributes().len() {
            return Err(AtlasError::SchemaMismatch(format!(
                "expected {} buffers, got {}",
                session.attributes().len() - 2,
                buffers.len()
            )));
        }

        let (key_offsets, key_values) = buffer::var_from_strs(keys);
        let coords: Vec<i64> = keys
            .iter()
            .flat_map(|k| key_coords(k.as_bytes()))
            .collect();
        let coords = buffer::encode(&coords);

        let mut all: Vec<WriteBuffer<'_>> = buffers.iter().copied().collect();
        all.push(WriteBuffer::Var {
            offsets: &key_offsets,
            values: &key_values,
        });
        all.push(WriteBuffer::Fixed(&coords));
        session.write(&all)
    }

    /// Read the values of one key.
    ///
    /// Reading the same key again after an overflow resumes where the last
    /// read stopped; a different key starts over.
    pub fn read(&mut self, key: &str, buffers: &mut [ReadBuffer<'_>]) -> Result<()> {
        let Session::Read { session, key: current } = &mut self.session else {
            return Err(AtlasError::InvalidOperation(
                "metadata is open for writing".to_string(),
            ));
        };
        if current.as_deref() != Some(key.as_bytes()) {
            session.reset_subarray_box(key_box(key.as_bytes()))?;
            *current = Some(key.as_bytes().to_vec());
        }
        session.read(buffers)
    }

    /// Overflow flag of session attribute `i` after the last read
    pub fn overflow(&self, i: usize) -> bool {
        match &self.session {
            Session::Read { session, .. } => session.overflow(i),
            Session::Write(_) => false,
        }
    }

    pub fn reset_attributes(&mut self, attributes: Option<&[&str]>) -> Result<()> {
        let Session::Read { session, key } = &mut self.session else {
            return Err(AtlasError::InvalidOperation(
                "attributes of a metadata write session are fixed".to_string(),
            ));
        };
        let attrs = metadata_attributes(&self.schema, attributes, true)?;
        session.set_attributes(attrs)?;
        *key = None;
        Ok(())
    }

    /// Finalize the session, then merge every fragment of the object
    pub fn consolidate(self) -> Result<ConsolidationSummary> {
        let engine = self.engine.clone();
        let path = self.path.clone();
        self.finalize()?;
        engine.consolidate(path)
    }

    pub fn finalize(self) -> Result<()> {
        match self.session {
            Session::Write(s) => s.finalize().map(|_| ()),
            Session::Read { session, .. } => session.finalize(),
        }
    }
}

/// Iterates every key of a metadata object, in storage order
#[derive(Debug)]
pub struct MetadataIterator {
    inner: ArrayIterator,
}

impl MetadataIterator {
    pub(crate) fn new(
        engine: &Engine,
        path: &Path,
        attributes: Option<&[&str]>,
        buffer_sizes: &[usize],
    ) -> Result<Self> {
        let metadata = Metadata::open(engine, path, MetadataMode::Read, attributes)?;
        let Session::Read { session, .. } = metadata.session else {
            return Err(AtlasError::InvalidOperation(
                "metadata iterator needs a read session".to_string(),
            ));
        };
        let inner = ArrayIterator::new(session, buffer_sizes, engine.config().prefetch_mode)?;
        Ok(Self { inner })
    }

    /// Attribute names, in value order
    pub fn attributes(&self) -> Vec<&str> {
        self.inner.attributes()
    }

    pub fn get_value(&self, i: usize) -> Result<&[u8]> {
        self.inner.get_value(i)
    }

    pub fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    pub fn end(&self) -> bool {
        self.inner.end()
    }

    pub fn finalize(self) -> Result<()> {
        self.inner.finalize()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolve metadata attribute names; the default list is every user
/// attribute, plus the key when `with_key`
fn metadata_attributes(
    schema: &MetadataSchema,
    names: Option<&[&str]>,
    with_key: bool,
) -> Result<Vec<usize>> {
    let Some(names) = names else {
        let mut all: Vec<usize> = (0..schema.attribute_num()).collect();
        if with_key {
            all.push(schema.key_index());
        }
        return Ok(all);
    };
    if names.is_empty() {
        return Err(AtlasError::InvalidInput("attribute list is empty".to_string()));
    }
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| {
            let idx = schema.attribute_index(name)?;
            if !seen.insert(idx) {
                return Err(AtlasError::InvalidInput(format!(
                    "attribute '{}' listed twice",
                    name
                )));
            }
            Ok(idx)
        })
        .collect()
}

/// Single-cell box of a key in the backing array
fn key_box(key: &[u8]) -> KeyBox {
    key_coords(key)
        .iter()
        .map(|c| {
            let k = Datatype::Int64.key_from_i64(*c);
            (k, k)
        })
        .collect()
}
