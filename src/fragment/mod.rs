//! Fragment Module
//!
//! A fragment is the immutable result of one write session (or one unsorted
//! write call): its cells in global order, split into tiles, one tile-group
//! file per attribute.
//!
//! ## Directory Layout
//! ```text
//! <array>/__fragment_0000000007/
//! ├── <attr>.tile        fixed values, or u64 offsets for var attributes
//! ├── <attr>_var.tile    value bytes of var attributes
//! ├── __coords.tile      coordinate tuples
//! └── __book.atl         the fragment book (footer)
//! ```
//!
//! ## Tile Group File
//! ```text
//! ┌──────────────┬──────────────┬─────┐
//! │ tile 0       │ tile 1       │ ... │   each tile compressed on its own
//! └──────────────┴──────────────┴─────┘
//! ```
//! Offsets, stored sizes and raw sizes of every tile live in the book, so
//! tile files carry no headers. Var offsets are relative to the first value
//! byte of their tile.
//!
//! While being written the directory is hidden (`.__fragment_...`); it only
//! becomes visible through an atomic rename.

mod book;
mod compression;
mod reader;
mod writer;

pub(crate) use book::FragmentBook;
pub(crate) use reader::{FragmentReader, Tile};
pub(crate) use writer::{FragmentWriter, TileSchedule};

/// Prefix of a visible fragment directory
pub(crate) const FRAGMENT_PREFIX: &str = "__fragment_";

/// Prefix added to a fragment directory while it is being written
pub(crate) const HIDDEN_PREFIX: &str = ".";

/// File name of the fragment book
pub(crate) const BOOK_FILE: &str = "__book.atl";

/// Tile-group file name of attribute `name`
pub(crate) fn tile_file(name: &str) -> String {
    format!("{}.tile", name)
}

/// Value file name of variable-length attribute `name`
pub(crate) fn var_tile_file(name: &str) -> String {
    format!("{}_var.tile", name)
}

/// Directory name of fragment `sequence`
/// 7 → "__fragment_0000000007"
pub(crate) fn fragment_dir_name(sequence: u64) -> String {
    format!("{}{:010}", FRAGMENT_PREFIX, sequence)
}

/// Parse a fragment directory name; hidden names parse too.
/// Returns `(sequence, hidden)`.
pub(crate) fn parse_fragment_dir(name: &str) -> Option<(u64, bool)> {
    let (name, hidden) = match name.strip_prefix(HIDDEN_PREFIX) {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    let seq = name.strip_prefix(FRAGMENT_PREFIX)?;
    seq.parse().ok().map(|s| (s, hidden))
}
