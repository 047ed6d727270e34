//! Cell Iterators
//!
//! Cell-at-a-time access over a read session, backed by two buffers per
//! attribute so the next batch can be read while the current one is consumed.
//!
//! ```text
//!            consumer                       prefetch
//!   ┌──────────────────────────┐     ┌──────────────────────┐
//!   │ current buffer (exposed) │     │ in-flight buffer     │
//!   │   cell 0 .. cells-1      │     │   filling next batch │
//!   └────────────┬─────────────┘     └──────────┬───────────┘
//!                │      exhausted → swap        │
//!                └──────────────◄───────────────┘
//! ```
//!
//! Each attribute advances through its own buffers; a swap only waits for the
//! attribute whose current batch ran out.

mod prefetch;

use crate::buffer::AttributeLayout;
use crate::config::PrefetchMode;
use crate::error::{AtlasError, Result};
use crate::read::ReadSession;

use prefetch::{BackgroundPrefetch, Filled, InlinePrefetch, OwnedBuffer, Prefetch};

/// Buffers of one iterator attribute
struct Batch {
    current: OwnedBuffer,
    position: usize,
    /// The current buffer holds the last batch
    last: bool,
    done: bool,
}

/// Iterates the cells of a read session one at a time
pub struct ArrayIterator {
    names: Vec<String>,
    prefetch: Box<dyn Prefetch>,
    batches: Vec<Batch>,
}

impl std::fmt::Debug for ArrayIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayIterator")
            .field("attributes", &self.names)
            .field("end", &self.end())
            .finish()
    }
}

impl ArrayIterator {
    /// Wrap `session`, using `buffer_sizes` bytes per buffer
    pub(crate) fn new(
        session: ReadSession,
        buffer_sizes: &[usize],
        mode: PrefetchMode,
    ) -> Result<Self> {
        let layouts = session.attribute_layouts();
        let sizes = split_sizes(&layouts, buffer_sizes)?;
        let names = session.attributes().iter().map(|s| s.to_string()).collect();

        let mut prefetch: Box<dyn Prefetch> = match mode {
            PrefetchMode::Synchronous => Box::new(InlinePrefetch::new(session, layouts.len())),
            PrefetchMode::Background => Box::new(BackgroundPrefetch::spawn(session, layouts.len())?),
        };

        for (attr, (layout, (offsets, values))) in layouts.iter().zip(&sizes).enumerate() {
            prefetch.request(attr, OwnedBuffer::new(layout, *offsets, *values))?;
        }

        let mut batches = Vec::with_capacity(layouts.len());
        for (attr, (layout, (offsets, values))) in layouts.iter().zip(&sizes).enumerate() {
            let filled = checked(attr, prefetch.wait(attr)?)?;
            // A single batch needs no second buffer
            if !filled.complete {
                prefetch.request(attr, OwnedBuffer::new(layout, *offsets, *values))?;
            }
            let done = filled.buffer.cells() == 0;
            batches.push(Batch {
                current: filled.buffer,
                position: 0,
                last: filled.complete,
                done,
            });
        }

        Ok(Self {
            names,
            prefetch,
            batches,
        })
    }

    /// Attribute names, in value order
    pub fn attributes(&self) -> Vec<&str> {
        self.names.iter().map(|s| s.as_str()).collect()
    }

    /// Bytes of attribute `i` of the current cell
    pub fn get_value(&self, i: usize) -> Result<&[u8]> {
        let batch = self.batches.get(i).ok_or_else(|| {
            AtlasError::InvalidInput(format!("iterator has no attribute number {}", i))
        })?;
        if batch.done {
            return Err(AtlasError::InvalidOperation(
                "iterator is past the last cell".to_string(),
            ));
        }
        Ok(batch.current.cell(batch.position))
    }

    /// Advance every attribute by one cell
    pub fn next(&mut self) -> Result<()> {
        for attr in 0..self.batches.len() {
            let batch = &mut self.batches[attr];
            if batch.done {
                continue;
            }
            batch.position += 1;
            if batch.position < batch.current.cells() {
                continue;
            }
            if batch.last {
                batch.done = true;
                continue;
            }

            let filled = checked(attr, self.prefetch.wait(attr)?)?;
            let batch = &mut self.batches[attr];
            let exhausted = std::mem::replace(&mut batch.current, filled.buffer);
            batch.position = 0;
            batch.last = filled.complete;
            batch.done = batch.current.cells() == 0;
            if !filled.complete {
                self.prefetch.request(attr, exhausted)?;
            }
        }
        Ok(())
    }

    /// True once every cell has been visited
    pub fn end(&self) -> bool {
        self.batches.iter().all(|b| b.done)
    }

    /// Stop prefetching and release the read session
    pub fn finalize(self) -> Result<()> {
        self.prefetch.finish()
    }
}

/// A buffer that overflowed while empty can never make progress
fn checked(attr: usize, filled: Filled) -> Result<Filled> {
    if filled.buffer.cells() == 0 && filled.overflow {
        return Err(AtlasError::InvalidInput(format!(
            "iterator buffer for attribute {} cannot hold a single cell",
            attr
        )));
    }
    Ok(filled)
}

/// Pair buffer sizes with attributes: (offsets bytes, value bytes)
fn split_sizes(layouts: &[AttributeLayout], sizes: &[usize]) -> Result<Vec<(usize, usize)>> {
    let expected: usize = layouts.iter().map(|l| if l.is_var() { 2 } else { 1 }).sum();
    if sizes.len() != expected {
        return Err(AtlasError::InvalidInput(format!(
            "expected {} buffer sizes, got {}",
            expected,
            sizes.len()
        )));
    }
    let mut rest = sizes;
    let mut out = Vec::with_capacity(layouts.len());
    for layout in layouts {
        if layout.is_var() {
            out.push((rest[0], rest[1]));
            rest = &rest[2..];
        } else {
            out.push((0, rest[0]));
            rest = &rest[1..];
        }
    }
    Ok(out)
}
