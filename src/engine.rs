//! Engine Module
//!
//! The context object every session is opened through.
//!
//! ## Responsibilities
//! - Hold the configuration shared by all sessions
//! - Own the advisory lock table (one writer or consolidator per array)
//! - Create and load array / metadata schemas
//! - Open array and metadata sessions and iterators
//! - Run consolidation and report fragment sets

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::array::{Array, ArrayMode};
use crate::config::Config;
use crate::consolidate::{self, ConsolidationSummary};
use crate::error::{AtlasError, Result};
use crate::iterator::ArrayIterator;
use crate::metadata::{Metadata, MetadataIterator, MetadataMode};
use crate::schema::{ArraySchema, Domain, MetadataSchema};
use crate::storage::{
    self, ArrayStorage, FragmentInfo, ObjectKind, ARRAY_SCHEMA_FILE, METADATA_SCHEMA_FILE,
};

/// The storage engine context
///
/// ## Concurrency Model: one writer / many readers per array
///
/// - **Writes** (write sessions, consolidation): hold the array's entry in
///   `locks` for their lifetime; a second one fails fast with
///   `ConcurrencyViolation` instead of waiting
/// - **Reads**: take no lock; they only ever see published fragments
///
/// Cloning is cheap; clones share the lock table.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: Config,

    /// Canonical paths of arrays with an active writer or consolidator
    locks: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with the given config
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                locks: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    /// Create an empty array at `path`
    pub fn create_array(&self, path: impl AsRef<Path>, schema: &ArraySchema) -> Result<()> {
        let path = path.as_ref();
        ArrayStorage::create(path, ARRAY_SCHEMA_FILE, &schema.to_bytes()?)?;
        tracing::info!(path = %path.display(), array = schema.name(), "array created");
        Ok(())
    }

    pub fn load_array_schema(&self, path: impl AsRef<Path>) -> Result<ArraySchema> {
        ArrayStorage::load_array_schema(path.as_ref())
    }

    /// Create an empty metadata object at `path`
    pub fn create_metadata(&self, path: impl AsRef<Path>, schema: &MetadataSchema) -> Result<()> {
        let path = path.as_ref();
        ArrayStorage::create(path, METADATA_SCHEMA_FILE, &schema.to_bytes()?)?;
        tracing::info!(path = %path.display(), metadata = schema.name(), "metadata created");
        Ok(())
    }

    pub fn load_metadata_schema(&self, path: impl AsRef<Path>) -> Result<MetadataSchema> {
        ArrayStorage::load_metadata_schema(path.as_ref())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open an array session.
    ///
    /// `subarray` defaults to the full domain. `attributes` defaults to every
    /// attribute, followed by the coordinates where the mode takes them.
    pub fn open_array(
        &self,
        path: impl AsRef<Path>,
        mode: ArrayMode,
        subarray: Option<&Domain>,
        attributes: Option<&[&str]>,
    ) -> Result<Array> {
        let path = path.as_ref();
        expect_kind(path, ObjectKind::Array)?;
        Array::open(self, path, mode, subarray, attributes)
    }

    /// Open a prefetching iterator over an array.
    ///
    /// `buffer_sizes` holds one byte size per buffer: one for a fixed-size
    /// attribute, two (offsets, values) for a variable-length one.
    pub fn array_iterator(
        &self,
        path: impl AsRef<Path>,
        subarray: Option<&Domain>,
        attributes: Option<&[&str]>,
        buffer_sizes: &[usize],
    ) -> Result<ArrayIterator> {
        let path = path.as_ref();
        expect_kind(path, ObjectKind::Array)?;
        let array = Array::open(self, path, ArrayMode::Read, subarray, attributes)?;
        ArrayIterator::new(array.into_read_session()?, buffer_sizes, self.config().prefetch_mode)
    }

    /// Open a metadata session
    pub fn open_metadata(
        &self,
        path: impl AsRef<Path>,
        mode: MetadataMode,
        attributes: Option<&[&str]>,
    ) -> Result<Metadata> {
        let path = path.as_ref();
        expect_kind(path, ObjectKind::Metadata)?;
        Metadata::open(self, path, mode, attributes)
    }

    /// Open a prefetching iterator over every key of a metadata object
    pub fn metadata_iterator(
        &self,
        path: impl AsRef<Path>,
        attributes: Option<&[&str]>,
        buffer_sizes: &[usize],
    ) -> Result<MetadataIterator> {
        let path = path.as_ref();
        expect_kind(path, ObjectKind::Metadata)?;
        MetadataIterator::new(self, path, attributes, buffer_sizes)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Merge every fragment of an array or metadata object into one
    pub fn consolidate(&self, path: impl AsRef<Path>) -> Result<ConsolidationSummary> {
        let path = path.as_ref();
        let storage = ArrayStorage::open(path, self.config().sync_on_finalize)?;
        let schema = storage.load_schema()?;
        let lock = self.lock(path)?;
        consolidate::consolidate(schema, storage, lock, self.config())
    }

    /// Published fragments, oldest → newest
    pub fn fragments(&self, path: impl AsRef<Path>) -> Result<Vec<FragmentInfo>> {
        ArrayStorage::open(path.as_ref(), false)?.fragment_infos()
    }

    /// What kind of object lives at `path`
    pub fn object_kind(&self, path: impl AsRef<Path>) -> Option<ObjectKind> {
        storage::object_kind(path.as_ref())
    }

    // =========================================================================
    // Advisory Locks
    // =========================================================================

    /// Take the exclusive advisory lock of the object at `path`
    pub(crate) fn lock(&self, path: &Path) -> Result<ArrayLock> {
        let key = fs::canonicalize(path)?;
        let mut locks = self.inner.locks.lock();
        if !locks.insert(key.clone()) {
            return Err(AtlasError::ConcurrencyViolation(format!(
                "{} already has an active writer or consolidation",
                path.display()
            )));
        }
        Ok(ArrayLock {
            engine: Arc::clone(&self.inner),
            path: key,
        })
    }
}

fn expect_kind(path: &Path, kind: ObjectKind) -> Result<()> {
    match storage::object_kind(path) {
        Some(k) if k == kind => Ok(()),
        Some(other) => Err(AtlasError::InvalidOperation(format!(
            "{} is {:?}, not {:?}",
            path.display(),
            other,
            kind
        ))),
        None => Err(AtlasError::NotFound(format!(
            "no {:?} at {}",
            kind,
            path.display()
        ))),
    }
}

/// Held advisory lock; released on drop
pub(crate) struct ArrayLock {
    engine: Arc<EngineInner>,
    path: PathBuf,
}

impl Drop for ArrayLock {
    fn drop(&mut self) {
        self.engine.locks.lock().remove(&self.path);
    }
}
