//! Output Sinks
//!
//! A `CellSink` takes whole cells, one at a time, from record-at-a-time
//! producers and decides where they go.
//!
//! ## Variants
//! - **DirectSink**: batches records and writes them to a borrowed session
//! - **DoubleBufferedSink**: a background thread owns the session and writes
//!   one batch while the producer fills the next
//! - **SerializedSink**: encodes records into a bounded byte buffer
//!
//! ## Record Encoding (SerializedSink)
//! ```text
//! ┌──────────────┬──────────────┬─────────┬──────────────┬─────────┬─────
//! │ Values (4)   │ Len 0 (4)    │ Value 0 │ Len 1 (4)    │ Value 1 │ ...
//! └──────────────┴──────────────┴─────────┴──────────────┴─────────┴─────
//! ```
//! All integers little-endian.

use std::thread::JoinHandle;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam::channel::{self, Sender};

use crate::error::{AtlasError, Result};
use crate::write::WriteSession;

/// One cell: a byte value per session attribute, in session order
pub type CellRecord = Vec<Vec<u8>>;

/// Destination for whole cells
pub trait CellSink {
    /// Take one record. A full batch is flushed first.
    fn accept(&mut self, record: CellRecord) -> Result<()>;

    /// True when the sink holds as much as it will take before a flush
    fn is_full(&self) -> bool;

    /// Push buffered records to their destination
    fn flush(&mut self) -> Result<()>;
}

// =============================================================================
// Direct Sink
// =============================================================================

/// Batches records into a borrowed write session
pub struct DirectSink<'s> {
    session: &'s mut WriteSession,
    batch: Vec<CellRecord>,
    batch_size: usize,
}

impl std::fmt::Debug for DirectSink<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectSink")
            .field("session", &self.session)
            .field("batch_len", &self.batch.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl<'s> DirectSink<'s> {
    /// `batch_size` records are buffered before each write
    pub fn new(session: &'s mut WriteSession, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(AtlasError::InvalidInput(
                "sink batch size must be positive".to_string(),
            ));
        }
        Ok(Self {
            session,
            batch: Vec::with_capacity(batch_size),
            batch_size,
        })
    }
}

impl CellSink for DirectSink<'_> {
    fn accept(&mut self, record: CellRecord) -> Result<()> {
        if self.is_full() {
            self.flush()?;
        }
        self.batch.push(record);
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.batch.len() >= self.batch_size
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.session.write_records(&batch)
    }
}

// =============================================================================
// Double-Buffered Sink
// =============================================================================

/// Writes batches on a background thread that owns the write session
///
/// The batch channel has no capacity: handing over a batch waits until the
/// worker has finished the previous one, so at most one batch is in flight
/// while the producer fills the next.
pub struct DoubleBufferedSink {
    batches: Option<Sender<Vec<CellRecord>>>,
    handle: Option<JoinHandle<Result<Vec<u64>>>>,
    batch: Vec<CellRecord>,
    batch_size: usize,
}

impl DoubleBufferedSink {
    /// Move `session` onto a writer thread
    pub fn new(mut session: WriteSession, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(AtlasError::InvalidInput(
                "sink batch size must be positive".to_string(),
            ));
        }
        let (tx, rx) = channel::bounded::<Vec<CellRecord>>(0);
        let handle = std::thread::Builder::new()
            .name("atlasarray-sink".to_string())
            .spawn(move || {
                for batch in rx {
                    if let Err(e) = session.write_records(&batch) {
                        tracing::warn!(error = %e, "sink writer failed; session dropped");
                        return Err(e);
                    }
                }
                session.finalize()
            })?;

        Ok(Self {
            batches: Some(tx),
            handle: Some(handle),
            batch: Vec::with_capacity(batch_size),
            batch_size,
        })
    }

    /// Flush, stop the writer and finalize its session.
    ///
    /// Returns the published fragment sequence numbers.
    pub fn finish(mut self) -> Result<Vec<u64>> {
        let flushed = self.flush();
        let joined = self.join();
        match (flushed, joined) {
            // The worker's own error explains a failed hand-over
            (_, Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), Ok(sequences)) => Ok(sequences),
        }
    }

    fn join(&mut self) -> Result<Vec<u64>> {
        self.batches.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AtlasError::Worker("sink writer panicked".to_string()))?,
            None => Err(AtlasError::InvalidOperation(
                "sink writer already stopped".to_string(),
            )),
        }
    }
}

impl CellSink for DoubleBufferedSink {
    fn accept(&mut self, record: CellRecord) -> Result<()> {
        if self.is_full() {
            self.flush()?;
        }
        self.batch.push(record);
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.batch.len() >= self.batch_size
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batches = self.batches.as_ref().ok_or_else(|| {
            AtlasError::InvalidOperation("sink writer already stopped".to_string())
        })?;
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        batches
            .send(batch)
            .map_err(|_| AtlasError::Worker("sink writer stopped".to_string()))
    }
}

impl Drop for DoubleBufferedSink {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        // Dropping without finish abandons the unsent batch; the worker still
        // finalizes what it already wrote.
        if let Err(e) = self.join() {
            tracing::warn!(error = %e, "sink writer did not shut down cleanly");
        }
    }
}

// =============================================================================
// Serialized Sink
// =============================================================================

/// Encodes records into a byte buffer of bounded size
///
/// A record that does not fit turns on the overflow flag and is dropped,
/// along with every record after it.
#[derive(Debug)]
pub struct SerializedSink {
    buffer: BytesMut,
    limit: usize,
    records: usize,
    overflow: bool,
}

impl SerializedSink {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(limit.min(64 * 1024)),
            limit,
            records: 0,
            overflow: false,
        }
    }

    /// True once a record has been dropped for lack of space
    pub fn overflow(&self) -> bool {
        self.overflow
    }

    /// Records held in the buffer
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Take the encoded records and start over with an empty buffer
    pub fn take(&mut self) -> Bytes {
        self.records = 0;
        self.overflow = false;
        self.buffer.split().freeze()
    }
}

impl CellSink for SerializedSink {
    fn accept(&mut self, record: CellRecord) -> Result<()> {
        if self.overflow {
            return Ok(());
        }
        let size = 4 + record.iter().map(|v| 4 + v.len()).sum::<usize>();
        if self.buffer.len() + size > self.limit {
            tracing::debug!(records = self.records, limit = self.limit, "serialized sink full");
            self.overflow = true;
            return Ok(());
        }
        self.buffer.put_u32_le(record.len() as u32);
        for value in &record {
            self.buffer.put_u32_le(value.len() as u32);
            self.buffer.put_slice(value);
        }
        self.records += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.overflow
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Decode the records of a `SerializedSink` buffer
pub fn decode_records(mut bytes: &[u8]) -> Result<Vec<CellRecord>> {
    let mut records = Vec::new();
    while bytes.has_remaining() {
        let values = read_len(&mut bytes, "value count")?;
        let mut record = Vec::with_capacity(values.min(1024));
        for _ in 0..values {
            let len = read_len(&mut bytes, "value length")?;
            if bytes.remaining() < len {
                return Err(AtlasError::Corruption(format!(
                    "record value of {} bytes truncated to {}",
                    len,
                    bytes.remaining()
                )));
            }
            record.push(bytes[..len].to_vec());
            bytes.advance(len);
        }
        records.push(record);
    }
    Ok(records)
}

fn read_len(bytes: &mut &[u8], what: &str) -> Result<usize> {
    if bytes.remaining() < 4 {
        return Err(AtlasError::Corruption(format!("truncated {}", what)));
    }
    Ok(bytes.get_u32_le() as usize)
}
