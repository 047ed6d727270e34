//! # AtlasArray
//!
//! An embeddable storage engine for dense and sparse multi-dimensional arrays:
//! - Immutable, tiled, per-attribute compressed fragments
//! - Append and unsorted writes; subarray reads merged across fragments
//! - Caller-owned buffers with overflow / resume
//! - Prefetching cell iterators
//! - Fragment consolidation
//! - Key-value metadata objects on top of sparse arrays
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │          (Config + advisory lock table per array)            │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!   ┌─────────┐   ┌──────────┐   ┌───────────┐  ┌─────────────┐
//!   │  Array  │   │ Metadata │   │ Iterators │  │ Consolidate │
//!   └────┬────┘   └────┬─────┘   └─────┬─────┘  └──────┬──────┘
//!        │             │               │               │
//!        ▼             ▼               ▼               ▼
//!   ┌──────────────────────┐     ┌──────────────────────────┐
//!   │     Write Engine     │     │       Read Engine        │
//!   │  (append / unsorted) │     │ (merge scan + cursors)   │
//!   └──────────┬───────────┘     └────────────┬─────────────┘
//!              │                              │
//!              ▼                              ▼
//!   ┌────────────────────────────────────────────────────────┐
//!   │       Storage: schema file + fragment directories       │
//!   │      (tile-group files, book, publish by rename)        │
//!   └────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod schema;
pub mod buffer;
mod codec;
pub(crate) mod fragment;
pub mod storage;

pub mod write;
mod read;
pub mod iterator;
pub mod consolidate;
pub mod sink;

pub mod array;
pub mod metadata;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, ErrorKind, Result};
pub use config::{Config, PrefetchMode};
pub use engine::Engine;

pub use schema::{
    ArraySchema, Attribute, CellOrder, CellValNum, Compression, Datatype, Domain, MetadataSchema,
    RawArraySchema, RawMetadataSchema, TileExtents, TileOrder,
};
pub use buffer::{ReadBuffer, WriteBuffer};
pub use storage::{FragmentInfo, ObjectKind};

pub use array::{Array, ArrayMode};
pub use metadata::{Metadata, MetadataIterator, MetadataMode};
pub use iterator::ArrayIterator;
pub use consolidate::ConsolidationSummary;
pub use write::WriteSession;
pub use sink::{CellRecord, CellSink, DirectSink, DoubleBufferedSink, SerializedSink};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasArray
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
