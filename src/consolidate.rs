//! Consolidation
//!
//! Merges every published fragment of an array into a single fragment.
//!
//! ```text
//!  __fragment_01 ─┐
//!  __fragment_02 ─┼─► read (newest wins) ─► append ─► .__fragment_04 ─► publish
//!  __fragment_03 ─┘                                                      │
//!        ▲                                                               │
//!        └──────────────────────── retire ◄──────────────────────────────┘
//! ```
//!
//! The merged fragment is published before the old ones are deleted, so a
//! reader never sees the array without its data. A failure before publishing
//! leaves the old fragment set untouched.

use crate::buffer::{AttributeLayout, ReadBuffer, WriteBuffer};
use crate::config::Config;
use crate::engine::ArrayLock;
use crate::error::Result;
use crate::read::ReadSession;
use crate::schema::ArraySchema;
use crate::storage::ArrayStorage;
use crate::write::WriteSession;

use std::sync::Arc;

/// Outcome of one consolidation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationSummary {
    /// Sequence numbers of the fragments that were merged and deleted
    pub retired: Vec<u64>,
    /// Sequence number of the merged fragment
    pub created: Option<u64>,
}

/// Merge every fragment of `storage` into one. Needs the array's lock.
pub(crate) fn consolidate(
    schema: Arc<ArraySchema>,
    storage: ArrayStorage,
    lock: ArrayLock,
    config: &Config,
) -> Result<ConsolidationSummary> {
    let fragments = storage.fragments()?;
    if fragments.len() < 2 {
        tracing::debug!(
            dir = %storage.dir().display(),
            fragments = fragments.len(),
            "nothing to consolidate"
        );
        return Ok(ConsolidationSummary::default());
    }
    let retired: Vec<u64> = fragments.iter().map(|(seq, _)| *seq).collect();

    let readers = storage.open_fragments(&schema)?;
    let attributes: Vec<usize> = (0..=schema.attribute_num()).collect();
    let mut reader = ReadSession::new(
        Arc::clone(&schema),
        readers,
        schema.domain_box(),
        attributes,
        false,
    )?;
    let mut writer = WriteSession::open_merged(
        Arc::clone(&schema),
        storage.clone(),
        lock,
        config.sync_on_finalize,
    )?;

    let mut staging: Vec<Staging> = reader
        .attribute_layouts()
        .iter()
        .map(|layout| Staging::new(layout, config.consolidation_buffer_size))
        .collect();

    while !reader.is_complete() {
        for (i, stage) in staging.iter_mut().enumerate() {
            stage.fill(&mut reader, i)?;
        }
        let buffers: Vec<WriteBuffer<'_>> = staging.iter().map(Staging::as_write).collect();
        writer.write(&buffers)?;
    }
    reader.finalize()?;

    let created = writer.finalize()?.into_iter().next();
    for sequence in &retired {
        storage.retire(*sequence)?;
    }
    let stale = storage.remove_stale_hidden()?;

    tracing::info!(
        dir = %storage.dir().display(),
        retired = retired.len(),
        created = ?created,
        stale,
        "consolidation complete"
    );
    Ok(ConsolidationSummary { retired, created })
}

/// Transfer buffer for one attribute
struct Staging {
    data: Vec<u8>,
    offsets: Option<Vec<u64>>,
    cells: usize,
    used: usize,
}

impl Staging {
    fn new(layout: &AttributeLayout, size: usize) -> Self {
        Self {
            data: vec![0; size],
            offsets: layout
                .is_var()
                .then(|| vec![0; (size / std::mem::size_of::<u64>()).max(1)]),
            cells: 0,
            used: 0,
        }
    }

    /// Next batch of attribute `i`; grows until at least one cell fits
    fn fill(&mut self, reader: &mut ReadSession, i: usize) -> Result<()> {
        loop {
            let (cells, used) = {
                let mut target = match self.offsets.as_mut() {
                    Some(offsets) => ReadBuffer::var(offsets, &mut self.data),
                    None => ReadBuffer::fixed(&mut self.data),
                };
                let cells = reader.fill_attribute(i, &mut target)?;
                (cells, target.values_size())
            };
            self.cells = cells;
            self.used = used;
            if cells > 0 || !reader.overflow(i) {
                return Ok(());
            }
            self.grow();
        }
    }

    fn grow(&mut self) {
        let size = self.data.len().max(1) * 2;
        self.data.resize(size, 0);
        if let Some(offsets) = self.offsets.as_mut() {
            let len = offsets.len() * 2;
            offsets.resize(len, 0);
        }
        tracing::debug!(size, "consolidation buffer grown to fit a cell");
    }

    fn as_write(&self) -> WriteBuffer<'_> {
        match &self.offsets {
            Some(offsets) => WriteBuffer::Var {
                offsets: &offsets[..self.cells],
                values: &self.data[..self.used],
            },
            None => WriteBuffer::Fixed(&self.data[..self.used]),
        }
    }
}
