//! Prefetch strategies
//!
//! A fill request carries the buffer it fills by value, and the response
//! hands it back. The consumer therefore never holds a buffer that a fill is
//! writing into.

use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::buffer::{AttributeLayout, ReadBuffer};
use crate::error::{AtlasError, Result};
use crate::read::ReadSession;

// =============================================================================
// Owned Buffers
// =============================================================================

/// An attribute buffer owned by the iterator
#[derive(Debug)]
pub(crate) struct OwnedBuffer {
    /// Fixed values, or the value bytes of a var attribute
    data: Vec<u8>,
    offsets: Option<Vec<u64>>,
    cell_size: usize,
    used: usize,
    cells: usize,
}

impl OwnedBuffer {
    /// `size` bytes of data; var attributes also get `offsets_size` bytes of offsets
    pub(crate) fn new(layout: &AttributeLayout, offsets_size: usize, size: usize) -> Self {
        Self {
            data: vec![0; size],
            offsets: layout
                .is_var()
                .then(|| vec![0; offsets_size / std::mem::size_of::<u64>()]),
            cell_size: layout.cell_size().unwrap_or(0),
            used: 0,
            cells: 0,
        }
    }

    pub(crate) fn cells(&self) -> usize {
        self.cells
    }

    /// Bytes of cell `i` of the last fill
    pub(crate) fn cell(&self, i: usize) -> &[u8] {
        match &self.offsets {
            Some(offsets) => {
                let start = offsets[i] as usize;
                let end = if i + 1 < self.cells {
                    offsets[i + 1] as usize
                } else {
                    self.used
                };
                &self.data[start..end]
            }
            None => &self.data[i * self.cell_size..(i + 1) * self.cell_size],
        }
    }

    fn fill(mut self, session: &mut ReadSession, attr: usize) -> Result<Filled> {
        let (cells, used) = {
            let mut target = match self.offsets.as_mut() {
                Some(offsets) => ReadBuffer::var(offsets, &mut self.data),
                None => ReadBuffer::fixed(&mut self.data),
            };
            let cells = session.fill_attribute(attr, &mut target)?;
            (cells, target.values_size())
        };
        self.cells = cells;
        self.used = used;
        Ok(Filled {
            overflow: session.overflow(attr),
            complete: session.is_done(attr),
            buffer: self,
        })
    }
}

/// Result of one fill
#[derive(Debug)]
pub(crate) struct Filled {
    pub buffer: OwnedBuffer,
    /// The buffer could not take the next cell
    pub overflow: bool,
    /// The attribute has consumed the whole stream
    pub complete: bool,
}

// =============================================================================
// Strategies
// =============================================================================

/// Fills attribute buffers for an iterator
pub(crate) trait Prefetch: Send {
    /// Start filling `buffer` with the next cells of attribute `attr`
    fn request(&mut self, attr: usize, buffer: OwnedBuffer) -> Result<()>;

    /// Wait for the outstanding fill of attribute `attr`
    fn wait(&mut self, attr: usize) -> Result<Filled>;

    /// Release the read session
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Fills right away, on the caller's thread
pub(crate) struct InlinePrefetch {
    session: ReadSession,
    ready: Vec<Option<Filled>>,
}

impl InlinePrefetch {
    pub(crate) fn new(session: ReadSession, attributes: usize) -> Self {
        Self {
            session,
            ready: (0..attributes).map(|_| None).collect(),
        }
    }
}

impl Prefetch for InlinePrefetch {
    fn request(&mut self, attr: usize, buffer: OwnedBuffer) -> Result<()> {
        let filled = buffer.fill(&mut self.session, attr)?;
        self.ready[attr] = Some(filled);
        Ok(())
    }

    fn wait(&mut self, attr: usize) -> Result<Filled> {
        self.ready[attr].take().ok_or_else(|| {
            AtlasError::InvalidOperation(format!("no fill outstanding for attribute {}", attr))
        })
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.session.finalize()
    }
}

struct FillRequest {
    attr: usize,
    buffer: OwnedBuffer,
}

struct FillResponse {
    attr: usize,
    result: Result<Filled>,
}

/// Fills on a worker thread that owns the read session
pub(crate) struct BackgroundPrefetch {
    requests: Option<Sender<FillRequest>>,
    responses: Receiver<FillResponse>,
    /// Responses that arrived while waiting for another attribute
    stash: Vec<Option<Filled>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl BackgroundPrefetch {
    pub(crate) fn spawn(mut session: ReadSession, attributes: usize) -> Result<Self> {
        let (request_tx, request_rx) = channel::unbounded::<FillRequest>();
        let (response_tx, response_rx) = channel::unbounded::<FillResponse>();

        let handle = std::thread::Builder::new()
            .name("atlasarray-prefetch".to_string())
            .spawn(move || {
                for FillRequest { attr, buffer } in request_rx {
                    let result = buffer.fill(&mut session, attr);
                    let failed = result.is_err();
                    if response_tx.send(FillResponse { attr, result }).is_err() || failed {
                        break;
                    }
                }
                session.finalize()
            })?;

        Ok(Self {
            requests: Some(request_tx),
            responses: response_rx,
            stash: (0..attributes).map(|_| None).collect(),
            handle: Some(handle),
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.requests.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AtlasError::Worker("prefetch worker panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Prefetch for BackgroundPrefetch {
    fn request(&mut self, attr: usize, buffer: OwnedBuffer) -> Result<()> {
        let requests = self.requests.as_ref().ok_or_else(|| {
            AtlasError::InvalidOperation("prefetch worker already stopped".to_string())
        })?;
        requests
            .send(FillRequest { attr, buffer })
            .map_err(|_| AtlasError::Worker("prefetch worker is gone".to_string()))
    }

    fn wait(&mut self, attr: usize) -> Result<Filled> {
        if let Some(filled) = self.stash[attr].take() {
            return Ok(filled);
        }
        loop {
            let response = self.responses.recv().map_err(|_| {
                AtlasError::Worker("prefetch worker stopped before answering".to_string())
            })?;
            match response.result {
                Ok(filled) if response.attr == attr => return Ok(filled),
                Ok(filled) => self.stash[response.attr] = Some(filled),
                Err(e) => {
                    tracing::warn!(attribute = response.attr, error = %e, "prefetch fill failed");
                    return Err(e);
                }
            }
        }
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.stop()
    }
}

impl Drop for BackgroundPrefetch {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "prefetch worker did not shut down cleanly");
        }
    }
}
