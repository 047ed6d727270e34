//! Write Engine
//!
//! Turns caller buffers into fragments.
//!
//! ## Modes
//! - **Append**: cells arrive already in global order. Every attribute
//!   streams into the same fragment at its own pace; one fragment per
//!   session. Dense sessions generate coordinates from their subarray.
//! - **Unsorted**: every call carries complete cells with coordinates. The
//!   call is sorted into global order and written as its own fragment.
//!
//! Fragments stay hidden until `finalize`. A session dropped before
//! `finalize`, or poisoned by an I/O failure, leaves no visible trace.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::buffer::WriteBuffer;
use crate::engine::ArrayLock;
use crate::error::{AtlasError, Result};
use crate::fragment::{FragmentWriter, TileSchedule};
use crate::schema::{ArraySchema, CellOrdering, DenseLayout, Domain};
use crate::sink::CellRecord;
use crate::storage::ArrayStorage;

/// How a write session expects its cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Cells in global order, one fragment per session
    Append,
    /// Cells in any order, one fragment per write call
    Unsorted,
}

/// A write session on one array
///
/// Holds the array's advisory lock for its whole lifetime.
pub struct WriteSession {
    schema: Arc<ArraySchema>,
    storage: ArrayStorage,
    mode: WriteMode,
    /// Session attribute order (indexes into the schema; coordinates last index)
    attributes: Vec<usize>,
    ordering: CellOrdering,
    sync: bool,
    /// Fragment of an append session
    current: Option<FragmentWriter>,
    /// Coordinate generator of a dense append session
    dense_coords: Option<DenseCoords>,
    /// Last coordinates appended by a sparse append session
    last_key: Option<Vec<u64>>,
    /// Written, not yet published
    pending: Vec<u64>,
    poisoned: bool,
    finalized: bool,
    _lock: ArrayLock,
}

impl std::fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSession")
            .field("mode", &self.mode)
            .field("pending", &self.pending)
            .field("poisoned", &self.poisoned)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl WriteSession {
    pub(crate) fn open(
        schema: Arc<ArraySchema>,
        storage: ArrayStorage,
        lock: ArrayLock,
        sync: bool,
        mode: WriteMode,
        subarray: Option<&Domain>,
        attributes: Option<&[&str]>,
    ) -> Result<Self> {
        let dense_append = mode == WriteMode::Append && schema.is_dense();
        let attributes = schema.session_attributes(attributes, !dense_append)?;

        let coords = schema.attribute_num();
        if let Some(missing) = (0..schema.attribute_num()).find(|a| !attributes.contains(a)) {
            return Err(AtlasError::InvalidInput(format!(
                "write sessions must cover every attribute; '{}' is missing",
                schema.attribute_name(missing)
            )));
        }
        match (dense_append, attributes.contains(&coords)) {
            (true, true) => {
                return Err(AtlasError::InvalidInput(
                    "dense append sessions generate coordinates and do not take them".to_string(),
                ))
            }
            (false, false) => {
                return Err(AtlasError::InvalidInput(
                    "sparse and unsorted writes need the coordinates attribute".to_string(),
                ))
            }
            _ => {}
        }

        let subarray = match subarray {
            Some(s) => schema.subarray_box(s)?,
            None => schema.domain_box(),
        };
        let ordering = CellOrdering::new(&schema);

        let mut session = Self {
            schema,
            storage,
            mode,
            attributes,
            ordering,
            sync,
            current: None,
            dense_coords: None,
            last_key: None,
            pending: Vec::new(),
            poisoned: false,
            finalized: false,
            _lock: lock,
        };

        if mode == WriteMode::Append {
            let schedule = if dense_append {
                let layout = DenseLayout::new(&session.schema, &subarray)?;
                session.dense_coords =
                    Some(DenseCoords::new(layout.clone(), session.ordering.clone()));
                TileSchedule::Dense(layout)
            } else {
                TileSchedule::Capacity(session.schema.capacity())
            };
            let writer = session.new_fragment(schedule)?;
            session.current = Some(writer);
        }

        tracing::debug!(
            array = session.schema.name(),
            mode = ?session.mode,
            "write session opened"
        );
        Ok(session)
    }

    /// Append session that takes explicit coordinates for every array kind.
    ///
    /// Used by consolidation, which rewrites only cells that were written.
    pub(crate) fn open_merged(
        schema: Arc<ArraySchema>,
        storage: ArrayStorage,
        lock: ArrayLock,
        sync: bool,
    ) -> Result<Self> {
        let attributes = (0..=schema.attribute_num()).collect();
        let ordering = CellOrdering::new(&schema);
        let mut session = Self {
            schema,
            storage,
            mode: WriteMode::Append,
            attributes,
            ordering,
            sync,
            current: None,
            dense_coords: None,
            last_key: None,
            pending: Vec::new(),
            poisoned: false,
            finalized: false,
            _lock: lock,
        };
        let writer = session.new_fragment(TileSchedule::Capacity(session.schema.capacity()))?;
        session.current = Some(writer);
        Ok(session)
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Names of the session attributes, in buffer order
    pub fn attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .map(|a| self.schema.attribute_name(*a))
            .collect()
    }

    /// Write one buffer per session attribute
    pub fn write(&mut self, buffers: &[WriteBuffer<'_>]) -> Result<()> {
        if self.poisoned {
            return Err(AtlasError::InvalidOperation(
                "write session failed earlier and can no longer be used".to_string(),
            ));
        }
        if buffers.len() != self.attributes.len() {
            return Err(AtlasError::SchemaMismatch(format!(
                "expected {} buffers, got {}",
                self.attributes.len(),
                buffers.len()
            )));
        }

        let mut cells = Vec::with_capacity(buffers.len());
        for (attr, buffer) in self.attributes.iter().zip(buffers.iter()) {
            let layout = self.schema.attribute_layout(*attr);
            cells.push(buffer.cells(&layout, self.schema.attribute_name(*attr))?);
        }

        let result = match self.mode {
            WriteMode::Append => self.append(&cells),
            WriteMode::Unsorted => self.write_unsorted(&cells),
        };
        if let Err(AtlasError::Io(e)) = &result {
            tracing::warn!(array = self.schema.name(), error = %e, "write failed; session poisoned");
            self.poisoned = true;
        }
        result
    }

    /// Write whole records (one value per session attribute each)
    pub(crate) fn write_records(&mut self, records: &[CellRecord]) -> Result<()> {
        let mut fixed: Vec<Vec<u8>> = vec![Vec::new(); self.attributes.len()];
        let mut offsets: Vec<Vec<u64>> = vec![Vec::new(); self.attributes.len()];
        for record in records {
            if record.len() != self.attributes.len() {
                return Err(AtlasError::SchemaMismatch(format!(
                    "record has {} values for {} attributes",
                    record.len(),
                    self.attributes.len()
                )));
            }
            for (i, value) in record.iter().enumerate() {
                if self.schema.attribute_layout(self.attributes[i]).is_var() {
                    offsets[i].push(fixed[i].len() as u64);
                }
                fixed[i].extend_from_slice(value);
            }
        }

        let buffers: Vec<WriteBuffer<'_>> = self
            .attributes
            .iter()
            .enumerate()
            .map(|(i, attr)| {
                if self.schema.attribute_layout(*attr).is_var() {
                    WriteBuffer::Var {
                        offsets: &offsets[i],
                        values: &fixed[i],
                    }
                } else {
                    WriteBuffer::Fixed(&fixed[i])
                }
            })
            .collect();
        self.write(&buffers)
    }

    /// Close the open fragment and publish every fragment of the session.
    ///
    /// Returns the published sequence numbers.
    pub fn finalize(mut self) -> Result<Vec<u64>> {
        if self.poisoned {
            return Err(AtlasError::InvalidOperation(
                "write session failed earlier; nothing was published".to_string(),
            ));
        }

        if let Some(writer) = self.current.take() {
            let sequence = writer.sequence();
            match writer.finish() {
                Ok(Some(_)) => self.pending.push(sequence),
                Ok(None) => {}
                Err(e) => {
                    self.poisoned = true;
                    if let Err(cleanup) = self.storage.discard(sequence) {
                        tracing::warn!(sequence, error = %cleanup, "failed to discard fragment");
                    }
                    return Err(e);
                }
            }
        }

        let pending = std::mem::take(&mut self.pending);
        for (i, sequence) in pending.iter().enumerate() {
            if let Err(e) = self.storage.publish(*sequence) {
                self.pending = pending[i..].to_vec();
                return Err(e);
            }
        }
        self.finalized = true;

        tracing::debug!(
            array = self.schema.name(),
            fragments = pending.len(),
            "write session finalized"
        );
        Ok(pending)
    }

    // =========================================================================
    // Append Mode
    // =========================================================================

    fn append(&mut self, cells: &[Vec<&[u8]>]) -> Result<()> {
        let coords = self.schema.attribute_num();
        let coords_pos = self.attributes.iter().position(|a| *a == coords);

        // Validate everything before touching the fragment
        let keys = match coords_pos {
            Some(pos) => {
                let bytes: Vec<u8> = cells[pos].concat();
                let keys = self.schema.decode_coords(&bytes)?;
                let mut prev = self.last_key.as_deref();
                for key in &keys {
                    if let Some(p) = prev {
                        if self.ordering.compare(p, key) != Ordering::Less {
                            return Err(AtlasError::InvalidInput(
                                "append writes need strictly increasing coordinates in global order"
                                    .to_string(),
                            ));
                        }
                    }
                    prev = Some(key.as_slice());
                }
                keys
            }
            None => Vec::new(),
        };

        let Some(writer) = self.current.as_mut() else {
            return Err(AtlasError::InvalidOperation(
                "append session has no open fragment".to_string(),
            ));
        };

        if let Some(generator) = &self.dense_coords {
            let limit = generator.total;
            for (attr, attr_cells) in self.attributes.iter().zip(cells.iter()) {
                if writer.cell_count(*attr) + attr_cells.len() as u64 > limit {
                    return Err(AtlasError::InvalidInput(format!(
                        "attribute '{}' would exceed the {} cells of the write subarray",
                        self.schema.attribute_name(*attr),
                        limit
                    )));
                }
            }
        }

        for (attr, attr_cells) in self.attributes.iter().zip(cells.iter()) {
            if *attr == coords {
                continue;
            }
            for cell in attr_cells {
                writer.append(*attr, cell)?;
            }
        }
        for key in &keys {
            writer.append_coords(key)?;
        }
        if let Some(last) = keys.into_iter().last() {
            self.last_key = Some(last);
        }

        if let Some(generator) = self.dense_coords.as_mut() {
            let written = (0..coords)
                .map(|a| writer.cell_count(a))
                .max()
                .unwrap_or(0);
            while writer.cell_count(coords) < written {
                match generator.next() {
                    Some(key) => writer.append_coords(&key)?,
                    None => break,
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Unsorted Mode
    // =========================================================================

    fn write_unsorted(&mut self, cells: &[Vec<&[u8]>]) -> Result<()> {
        let n = cells[0].len();
        if let Some(pos) = cells.iter().position(|c| c.len() != n) {
            return Err(AtlasError::SchemaMismatch(format!(
                "unsorted writes need equal cell counts; '{}' has {}, '{}' has {}",
                self.schema.attribute_name(self.attributes[0]),
                n,
                self.schema.attribute_name(self.attributes[pos]),
                cells[pos].len()
            )));
        }
        if n == 0 {
            return Ok(());
        }

        let coords = self.schema.attribute_num();
        let coords_pos = self
            .attributes
            .iter()
            .position(|a| *a == coords)
            .ok_or_else(|| AtlasError::InvalidInput("coordinates are required".to_string()))?;
        let keys = self.schema.decode_coords(&cells[coords_pos].concat())?;

        // Stable sort keeps buffer order among equal coordinates; the last
        // occurrence of each run wins.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| self.ordering.compare(&keys[*a], &keys[*b]));
        let mut survivors: Vec<usize> = Vec::with_capacity(n);
        for idx in order {
            match survivors.last() {
                Some(prev) if keys[*prev] == keys[idx] => {
                    if let Some(last) = survivors.last_mut() {
                        *last = idx;
                    }
                }
                _ => survivors.push(idx),
            }
        }
        if survivors.len() < n {
            tracing::debug!(
                duplicates = n - survivors.len(),
                "duplicate coordinates in one write; last occurrence kept"
            );
        }

        let mut writer = self.new_fragment(TileSchedule::Capacity(self.schema.capacity()))?;
        let sequence = writer.sequence();
        let written = self
            .append_sorted(&mut writer, cells, &keys, &survivors)
            .and_then(|_| writer.finish());

        match written {
            Ok(Some(_)) => {
                self.pending.push(sequence);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if let Err(cleanup) = self.storage.discard(sequence) {
                    tracing::warn!(sequence, error = %cleanup, "failed to discard fragment");
                }
                Err(e)
            }
        }
    }

    fn append_sorted(
        &self,
        writer: &mut FragmentWriter,
        cells: &[Vec<&[u8]>],
        keys: &[Vec<u64>],
        survivors: &[usize],
    ) -> Result<()> {
        let coords = self.schema.attribute_num();
        for idx in survivors {
            for (pos, attr) in self.attributes.iter().enumerate() {
                if *attr == coords {
                    writer.append_coords(&keys[*idx])?;
                } else {
                    writer.append(*attr, cells[pos][*idx])?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn new_fragment(&self, schedule: TileSchedule) -> Result<FragmentWriter> {
        let sequence = self.storage.next_sequence()?;
        FragmentWriter::create(
            Arc::clone(&self.schema),
            self.storage.hidden_dir(sequence),
            sequence,
            schedule,
            self.sync,
        )
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        let mut sequences = std::mem::take(&mut self.pending);
        if let Some(writer) = self.current.take() {
            sequences.push(writer.sequence());
        }
        for sequence in &sequences {
            if let Err(e) = self.storage.discard(*sequence) {
                tracing::warn!(sequence, error = %e, "failed to discard unpublished fragment");
            }
        }
        if !sequences.is_empty() {
            tracing::info!(
                array = self.schema.name(),
                fragments = sequences.len(),
                "write session aborted"
            );
        }
    }
}

// =============================================================================
// Dense Coordinates
// =============================================================================

/// Coordinates of a dense subarray in global order, one tile at a time
struct DenseCoords {
    layout: DenseLayout,
    ordering: CellOrdering,
    total: u64,
    tile: u64,
    cells: std::vec::IntoIter<Vec<u64>>,
}

impl DenseCoords {
    fn new(layout: DenseLayout, ordering: CellOrdering) -> Self {
        Self {
            total: layout.total_cells(),
            layout,
            ordering,
            tile: 0,
            cells: Vec::new().into_iter(),
        }
    }
}

impl Iterator for DenseCoords {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Vec<u64>> {
        loop {
            if let Some(key) = self.cells.next() {
                return Some(key);
            }
            if self.tile >= self.layout.tile_count() {
                return None;
            }
            self.cells = self.layout.tile_cells(self.tile, &self.ordering).into_iter();
            self.tile += 1;
        }
    }
}

