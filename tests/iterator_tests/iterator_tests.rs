//! Tests for cell iterators
//!
//! These tests verify:
//! - Iterators visit the same cells as a full read, in both prefetch modes
//! - Buffer swaps with buffers much smaller than the result
//! - Variable-length attributes
//! - Argument errors (buffer sizes, too-small buffers, reads past the end)

use std::path::{Path, PathBuf};

use atlasarray::buffer::{decode, encode, var_from_strs};
use atlasarray::{
    ArrayMode, ArraySchema, AtlasError, CellValNum, Config, Datatype, Domain, Engine,
    PrefetchMode, RawArraySchema, ReadBuffer, WriteBuffer,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine(mode: PrefetchMode) -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .sync_on_finalize(false)
        .prefetch_mode(mode)
        .build();
    (temp_dir, Engine::new(config).unwrap())
}

/// Sparse 1-D array with an `Int32` and a var `Char` attribute
fn create_array(engine: &Engine, temp: &TempDir, capacity: u64) -> PathBuf {
    let path = temp.path().join("cells");
    let mut raw = RawArraySchema::sparse(
        "cells",
        &["num", "name"],
        &["i"],
        Domain::Int64(vec![[0, 9999]]),
        &[Datatype::Int32, Datatype::Char, Datatype::Int64],
    );
    raw.cell_val_num = Some(vec![CellValNum::Fixed(1), CellValNum::Var]);
    raw.capacity = Some(capacity);
    engine
        .create_array(&path, &ArraySchema::new(raw).unwrap())
        .unwrap();
    path
}

fn fill(engine: &Engine, path: &Path, count: i64) {
    let names: Vec<String> = (0..count).map(|i| "x".repeat((i % 7) as usize)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let (offsets, values) = var_from_strs(&name_refs);
    let nums: Vec<i32> = (0..count as i32).map(|i| i * 3).collect();
    let coords: Vec<i64> = (0..count).map(|i| i * 2).collect();

    let mut array = engine.open_array(path, ArrayMode::Write, None, None).unwrap();
    array
        .write(&[
            WriteBuffer::Fixed(&encode(&nums)),
            WriteBuffer::Var {
                offsets: &offsets,
                values: &values,
            },
            WriteBuffer::Fixed(&encode(&coords)),
        ])
        .unwrap();
    array.finalize().unwrap();
}

/// `(coord, num, name)` of every cell through one big read
fn read_all(engine: &Engine, path: &Path) -> Vec<(i64, i32, Vec<u8>)> {
    let mut array = engine.open_array(path, ArrayMode::Read, None, None).unwrap();
    let mut nums = vec![0u8; 1 << 16];
    let mut offsets = vec![0u64; 1 << 14];
    let mut values = vec![0u8; 1 << 16];
    let mut coords = vec![0u8; 1 << 17];
    let mut buffers = [
        ReadBuffer::fixed(&mut nums),
        ReadBuffer::var(&mut offsets, &mut values),
        ReadBuffer::fixed(&mut coords),
    ];
    array.read(&mut buffers).unwrap();
    assert!(array.is_complete());

    let nums = decode::<i32>(buffers[0].data()).unwrap();
    let names: Vec<Vec<u8>> = buffers[1].var_cells().iter().map(|c| c.to_vec()).collect();
    let coords = decode::<i64>(buffers[2].data()).unwrap();
    coords
        .into_iter()
        .zip(nums)
        .zip(names)
        .map(|((c, n), s)| (c, n, s))
        .collect()
}

/// Same tuples through an iterator
fn iterate_all(engine: &Engine, path: &Path, sizes: &[usize]) -> Vec<(i64, i32, Vec<u8>)> {
    let mut it = engine.array_iterator(path, None, None, sizes).unwrap();
    let mut out = Vec::new();
    while !it.end() {
        let num = decode::<i32>(it.get_value(0).unwrap()).unwrap()[0];
        let name = it.get_value(1).unwrap().to_vec();
        let coord = decode::<i64>(it.get_value(2).unwrap()).unwrap()[0];
        out.push((coord, num, name));
        it.next().unwrap();
    }
    it.finalize().unwrap();
    out
}

// =============================================================================
// Equivalence Tests
// =============================================================================

#[test]
fn test_background_iterator_matches_read() {
    let (temp, engine) = setup_engine(PrefetchMode::Background);
    let path = create_array(&engine, &temp, 64);
    fill(&engine, &path, 500);

    // num: 5 cells, name: 4 offsets / 12 bytes, coords: 3 cells
    let iterated = iterate_all(&engine, &path, &[20, 32, 12, 24]);
    assert_eq!(iterated.len(), 500);
    assert_eq!(iterated, read_all(&engine, &path));
}

#[test]
fn test_synchronous_iterator_matches_read() {
    let (temp, engine) = setup_engine(PrefetchMode::Synchronous);
    let path = create_array(&engine, &temp, 64);
    fill(&engine, &path, 300);

    let iterated = iterate_all(&engine, &path, &[4, 8, 6, 8]);
    assert_eq!(iterated, read_all(&engine, &path));
}

#[test]
fn test_large_buffers_single_batch() {
    let (temp, engine) = setup_engine(PrefetchMode::Background);
    let path = create_array(&engine, &temp, 64);
    fill(&engine, &path, 50);

    let iterated = iterate_all(&engine, &path, &[4096, 4096, 4096, 4096]);
    assert_eq!(iterated, read_all(&engine, &path));
}

#[test]
fn test_iterator_over_subarray_and_attribute_subset() {
    let (temp, engine) = setup_engine(PrefetchMode::Background);
    let path = create_array(&engine, &temp, 16);
    fill(&engine, &path, 100);

    let subarray = Domain::Int64(vec![[10, 19]]);
    let mut it = engine
        .array_iterator(&path, Some(&subarray), Some(&["num"]), &[8])
        .unwrap();
    assert_eq!(it.attributes(), vec!["num"]);

    let mut nums = Vec::new();
    while !it.end() {
        nums.extend(decode::<i32>(it.get_value(0).unwrap()).unwrap());
        it.next().unwrap();
    }
    it.finalize().unwrap();

    // Coordinates 10, 12, .. 18 hold cells 5..=9
    assert_eq!(nums, vec![15, 18, 21, 24, 27]);
}

#[test]
fn test_empty_array_iterator_ends_immediately() {
    for mode in [PrefetchMode::Synchronous, PrefetchMode::Background] {
        let (temp, engine) = setup_engine(mode);
        let path = create_array(&engine, &temp, 16);

        let it = engine
            .array_iterator(&path, None, Some(&["num"]), &[64])
            .unwrap();
        assert!(it.end());
        let err = it.get_value(0).unwrap_err();
        assert!(matches!(err, AtlasError::InvalidOperation(_)));
        it.finalize().unwrap();
    }
}

// =============================================================================
// Argument Error Tests
// =============================================================================

#[test]
fn test_wrong_number_of_buffer_sizes() {
    let (temp, engine) = setup_engine(PrefetchMode::Background);
    let path = create_array(&engine, &temp, 16);
    fill(&engine, &path, 10);

    // The var attribute needs two sizes
    let err = engine
        .array_iterator(&path, None, None, &[64, 64, 64])
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));
}

#[test]
fn test_buffer_too_small_for_a_cell() {
    for mode in [PrefetchMode::Synchronous, PrefetchMode::Background] {
        let (temp, engine) = setup_engine(mode);
        let path = create_array(&engine, &temp, 16);
        fill(&engine, &path, 10);

        let err = engine
            .array_iterator(&path, None, Some(&["num"]), &[3])
            .unwrap_err();
        assert!(matches!(err, AtlasError::InvalidInput(_)));
    }
}

#[test]
fn test_attribute_index_out_of_range() {
    let (temp, engine) = setup_engine(PrefetchMode::Synchronous);
    let path = create_array(&engine, &temp, 16);
    fill(&engine, &path, 3);

    let it = engine
        .array_iterator(&path, None, Some(&["num"]), &[64])
        .unwrap();
    let err = it.get_value(5).unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));
    it.finalize().unwrap();
}

#[test]
fn test_dropping_iterator_mid_stream() {
    let (temp, engine) = setup_engine(PrefetchMode::Background);
    let path = create_array(&engine, &temp, 16);
    fill(&engine, &path, 200);

    let mut it = engine
        .array_iterator(&path, None, Some(&["num"]), &[8])
        .unwrap();
    it.next().unwrap();
    it.next().unwrap();
    drop(it);

    // The array is still readable afterwards
    assert_eq!(read_all(&engine, &path).len(), 200);
}
