//! Array Sessions
//!
//! `Array` is the handle returned by `Engine::open_array`. It dispatches on
//! the mode it was opened with:
//!
//! ```text
//!               ┌── Write ─────────► WriteSession (append)   ┐
//!  open_array ──┼── WriteUnsorted ─► WriteSession (unsorted) ├─ hold the array lock
//!               └── Read ──────────► ReadSession             ─ no lock
//! ```
//!
//! Calls that do not fit the mode fail with `InvalidOperation`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::consolidate::ConsolidationSummary;
use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::read::ReadSession;
use crate::schema::{ArraySchema, Domain};
use crate::storage::ArrayStorage;
use crate::write::{WriteMode, WriteSession};

/// Mode an array is opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMode {
    /// Cells in global order; dense sessions take no coordinates
    Write,
    /// Cells in any order, coordinates required; one fragment per call
    WriteUnsorted,
    Read,
}

enum Session {
    Write(WriteSession),
    Read(ReadSession),
}

/// An open array session
pub struct Array {
    engine: Engine,
    path: PathBuf,
    mode: ArrayMode,
    session: Session,
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Array {
    pub(crate) fn open(
        engine: &Engine,
        path: &Path,
        mode: ArrayMode,
        subarray: Option<&Domain>,
        attributes: Option<&[&str]>,
    ) -> Result<Self> {
        let sync = engine.config().sync_on_finalize;
        let storage = ArrayStorage::open(path, sync)?;
        let schema = Arc::new(ArrayStorage::load_array_schema(path)?);

        let session = match mode {
            ArrayMode::Read => {
                Session::Read(ReadSession::open(schema, &storage, subarray, attributes)?)
            }
            ArrayMode::Write | ArrayMode::WriteUnsorted => {
                let write_mode = if mode == ArrayMode::Write {
                    WriteMode::Append
                } else {
                    WriteMode::Unsorted
                };
                let lock = engine.lock(path)?;
                Session::Write(WriteSession::open(
                    schema, storage, lock, sync, write_mode, subarray, attributes,
                )?)
            }
        };

        Ok(Self {
            engine: engine.clone(),
            path: path.to_path_buf(),
            mode,
            session,
        })
    }

    pub fn mode(&self) -> ArrayMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &ArraySchema {
        match &self.session {
            Session::Write(s) => s.schema(),
            Session::Read(s) => s.schema(),
        }
    }

    /// Session attribute names, in buffer order
    pub fn attributes(&self) -> Vec<&str> {
        match &self.session {
            Session::Write(s) => s.attributes(),
            Session::Read(s) => s.attributes(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn read(&mut self, buffers: &mut [ReadBuffer<'_>]) -> Result<()> {
        self.reader()?.read(buffers)
    }

    /// Overflow flag of session attribute `i` after the last read
    pub fn overflow(&self, i: usize) -> bool {
        match &self.session {
            Session::Read(s) => s.overflow(i),
            Session::Write(_) => false,
        }
    }

    /// True once a read session has returned every cell
    pub fn is_complete(&self) -> bool {
        match &self.session {
            Session::Read(s) => s.is_complete(),
            Session::Write(_) => false,
        }
    }

    pub fn reset_subarray(&mut self, subarray: &Domain) -> Result<()> {
        self.reader()?.reset_subarray(subarray)
    }

    pub fn reset_attributes(&mut self, attributes: Option<&[&str]>) -> Result<()> {
        self.reader()?.reset_attributes(attributes)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn write(&mut self, buffers: &[WriteBuffer<'_>]) -> Result<()> {
        match &mut self.session {
            Session::Write(s) => s.write(buffers),
            Session::Read(_) => Err(AtlasError::InvalidOperation(
                "array is open for reading".to_string(),
            )),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Finalize the session, then merge every fragment of the array
    pub fn consolidate(self) -> Result<ConsolidationSummary> {
        let engine = self.engine.clone();
        let path = self.path.clone();
        self.finalize()?;
        engine.consolidate(path)
    }

    /// Publish pending writes (write modes) and release the session
    pub fn finalize(self) -> Result<()> {
        match self.session {
            Session::Write(s) => s.finalize().map(|_| ()),
            Session::Read(s) => s.finalize(),
        }
    }

    /// Give up the facade and keep the write session (e.g. for a sink)
    pub fn into_write_session(self) -> Result<WriteSession> {
        match self.session {
            Session::Write(s) => Ok(s),
            Session::Read(_) => Err(AtlasError::InvalidOperation(
                "array is open for reading".to_string(),
            )),
        }
    }

    pub(crate) fn into_read_session(self) -> Result<ReadSession> {
        match self.session {
            Session::Read(s) => Ok(s),
            Session::Write(_) => Err(AtlasError::InvalidOperation(
                "array is open for writing".to_string(),
            )),
        }
    }

    fn reader(&mut self) -> Result<&mut ReadSession> {
        match &mut self.session {
            Session::Read(s) => Ok(s),
            Session::Write(_) => Err(AtlasError::InvalidOperation(
                "array is open for writing".to_string(),
            )),
        }
    }
}
