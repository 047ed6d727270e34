//! Storage Module
//!
//! Owns the on-disk layout of one array (or metadata) directory.
//!
//! ## Responsibilities
//! - Create array and metadata directories with their schema file
//! - Discover published fragments, oldest → newest
//! - Allocate fragment sequence numbers
//! - Publish (atomic rename), retire and discard fragments
//!
//! ## Directory Layout
//! ```text
//! <array>/
//! ├── __array_schema.atl          (or __metadata_schema.atl)
//! ├── __fragment_0000000001/      published fragments
//! ├── __fragment_0000000002/
//! └── .__fragment_0000000003/     being written, never read
//! ```

mod manager;

pub use manager::{FragmentInfo, ObjectKind};

pub(crate) use manager::{object_kind, ArrayStorage, ARRAY_SCHEMA_FILE, METADATA_SCHEMA_FILE};
