//! Tests for the read engine
//!
//! These tests verify:
//! - Subarray restriction and global cell order (row-, column-major, Hilbert)
//! - Newest fragment wins on equal coordinates
//! - Overflow / resume with undersized buffers
//! - Dense reads with empty values for unwritten cells
//! - Session resets

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use atlasarray::buffer::{decode, encode, var_from_strs};
use atlasarray::{
    ArrayMode, ArraySchema, AtlasError, CellOrder, CellValNum, Config, Datatype, Domain, Engine,
    RawArraySchema, ReadBuffer, TileExtents, WriteBuffer,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::new(Config::builder().sync_on_finalize(false).build()).unwrap();
    (temp_dir, engine)
}

fn create_sparse(engine: &Engine, temp: &TempDir, order: CellOrder, capacity: u64) -> PathBuf {
    let path = temp.path().join("sparse");
    let mut raw = RawArraySchema::sparse(
        "sparse",
        &["a1"],
        &["rows", "cols"],
        Domain::Int64(vec![[0, 15], [0, 15]]),
        &[Datatype::Int32, Datatype::Int64],
    );
    raw.cell_order = order;
    raw.capacity = Some(capacity);
    engine
        .create_array(&path, &ArraySchema::new(raw).unwrap())
        .unwrap();
    path
}

fn write_unsorted(engine: &Engine, path: &Path, cells: &[(i64, i64, i32)]) {
    let mut array = engine
        .open_array(path, ArrayMode::WriteUnsorted, None, None)
        .unwrap();
    let values: Vec<i32> = cells.iter().map(|c| c.2).collect();
    let coords: Vec<i64> = cells.iter().flat_map(|c| [c.0, c.1]).collect();
    array
        .write(&[
            WriteBuffer::Fixed(&encode(&values)),
            WriteBuffer::Fixed(&encode(&coords)),
        ])
        .unwrap();
    array.finalize().unwrap();
}

/// Read `(row, col, value)` cells with the given buffer sizes (bytes)
fn read_with(
    engine: &Engine,
    path: &Path,
    subarray: Option<&Domain>,
    value_bytes: usize,
    coord_bytes: usize,
) -> Vec<(i64, i64, i32)> {
    let mut array = engine
        .open_array(path, ArrayMode::Read, subarray, None)
        .unwrap();
    let mut values = Vec::new();
    let mut coords = Vec::new();
    let mut value_data = vec![0u8; value_bytes];
    let mut coord_data = vec![0u8; coord_bytes];
    for _ in 0..10_000 {
        let mut buffers = [
            ReadBuffer::fixed(&mut value_data),
            ReadBuffer::fixed(&mut coord_data),
        ];
        array.read(&mut buffers).unwrap();
        values.extend(decode::<i32>(buffers[0].data()).unwrap());
        coords.extend(decode::<i64>(buffers[1].data()).unwrap());
        if array.is_complete() {
            break;
        }
    }
    assert!(array.is_complete());
    coords
        .chunks(2)
        .zip(values)
        .map(|(c, v)| (c[0], c[1], v))
        .collect()
}

fn read_all(engine: &Engine, path: &Path, subarray: Option<&Domain>) -> Vec<(i64, i64, i32)> {
    read_with(engine, path, subarray, 64 * 1024, 64 * 1024)
}

fn sample_cells() -> Vec<(i64, i64, i32)> {
    let mut cells = Vec::new();
    for r in 0..16i64 {
        for c in (0..16i64).step_by(3) {
            cells.push((r, c, (r * 100 + c) as i32));
        }
    }
    cells
}

// =============================================================================
// Ordering and Subarray Tests
// =============================================================================

#[test]
fn test_full_read_is_row_major() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 7);
    let mut cells = sample_cells();
    cells.reverse();

    write_unsorted(&engine, &path, &cells);

    let mut expected = sample_cells();
    expected.sort_by_key(|c| (c.0, c.1));
    assert_eq!(read_all(&engine, &path, None), expected);
}

#[test]
fn test_col_major_order() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::ColMajor, 100);

    write_unsorted(&engine, &path, &[(0, 1, 1), (1, 0, 2), (0, 0, 3)]);

    assert_eq!(
        read_all(&engine, &path, None),
        vec![(0, 0, 3), (1, 0, 2), (0, 1, 1)]
    );
}

#[test]
fn test_hilbert_order_returns_every_cell_once() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::Hilbert, 5);
    let cells = sample_cells();

    write_unsorted(&engine, &path, &cells);

    let read = read_all(&engine, &path, None);
    assert_eq!(read.len(), cells.len());
    let read_set: BTreeSet<_> = read.iter().copied().collect();
    let expected: BTreeSet<_> = cells.iter().copied().collect();
    assert_eq!(read_set, expected);

    // Same order on every read
    assert_eq!(read_all(&engine, &path, None), read);
}

#[test]
fn test_subarray_restricts_cells() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 4);
    write_unsorted(&engine, &path, &sample_cells());

    let subarray = Domain::Int64(vec![[2, 3], [3, 9]]);
    let read = read_all(&engine, &path, Some(&subarray));

    assert_eq!(
        read,
        vec![
            (2, 3, 203),
            (2, 6, 206),
            (2, 9, 209),
            (3, 3, 303),
            (3, 6, 306),
            (3, 9, 309)
        ]
    );
}

#[test]
fn test_subarray_outside_domain_is_rejected() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 4);

    let outside = Domain::Int64(vec![[0, 16], [0, 1]]);
    let err = engine
        .open_array(&path, ArrayMode::Read, Some(&outside), None)
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));

    let wrong_type = Domain::Int32(vec![[0, 1], [0, 1]]);
    let err = engine
        .open_array(&path, ArrayMode::Read, Some(&wrong_type), None)
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));
}

#[test]
fn test_float_coordinates_sort_numerically() {
    let (temp, engine) = setup_engine();
    let path = temp.path().join("floats");
    let raw = RawArraySchema::sparse(
        "floats",
        &["a1"],
        &["x"],
        Domain::Float64(vec![[-10.0, 10.0]]),
        &[Datatype::Int32, Datatype::Float64],
    );
    engine
        .create_array(&path, &ArraySchema::new(raw).unwrap())
        .unwrap();

    let mut array = engine
        .open_array(&path, ArrayMode::WriteUnsorted, None, None)
        .unwrap();
    array
        .write(&[
            WriteBuffer::Fixed(&encode(&[1i32, 2, 3])),
            WriteBuffer::Fixed(&encode(&[2.25f64, -1.5, 0.0])),
        ])
        .unwrap();
    array.finalize().unwrap();

    let mut array = engine.open_array(&path, ArrayMode::Read, None, None).unwrap();
    let mut values = vec![0u8; 64];
    let mut coords = vec![0u8; 64];
    let mut buffers = [ReadBuffer::fixed(&mut values), ReadBuffer::fixed(&mut coords)];
    array.read(&mut buffers).unwrap();

    assert_eq!(decode::<i32>(buffers[0].data()).unwrap(), vec![2, 3, 1]);
    assert_eq!(
        decode::<f64>(buffers[1].data()).unwrap(),
        vec![-1.5, 0.0, 2.25]
    );
}

// =============================================================================
// Fragment Merge Tests
// =============================================================================

#[test]
fn test_newest_fragment_wins() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 100);

    write_unsorted(&engine, &path, &[(1, 1, 1), (2, 2, 2), (3, 3, 3)]);
    write_unsorted(&engine, &path, &[(2, 2, 20), (4, 4, 40)]);
    write_unsorted(&engine, &path, &[(1, 1, 100)]);

    assert_eq!(
        read_all(&engine, &path, None),
        vec![(1, 1, 100), (2, 2, 20), (3, 3, 3), (4, 4, 40)]
    );
}

#[test]
fn test_reader_sees_fragments_published_before_open() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 100);
    write_unsorted(&engine, &path, &[(1, 1, 1)]);

    let mut reader = engine.open_array(&path, ArrayMode::Read, None, None).unwrap();
    write_unsorted(&engine, &path, &[(2, 2, 2)]);

    let mut values = vec![0u8; 64];
    let mut coords = vec![0u8; 64];
    let mut buffers = [ReadBuffer::fixed(&mut values), ReadBuffer::fixed(&mut coords)];
    reader.read(&mut buffers).unwrap();
    assert_eq!(decode::<i32>(buffers[0].data()).unwrap(), vec![1]);

    assert_eq!(read_all(&engine, &path, None).len(), 2);
}

#[test]
fn test_interleaved_fragments_merge() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 4);

    // Even and odd columns in separate fragments alternate cell by cell
    let cell = |r: i64, c: i64| (r, c, (r * 100 + c) as i32);
    let even: Vec<_> = (0..16i64)
        .flat_map(|r| (0..16i64).step_by(2).map(move |c| (r, c)))
        .map(|(r, c)| cell(r, c))
        .collect();
    let odd: Vec<_> = (0..16i64)
        .flat_map(|r| (1..16i64).step_by(2).map(move |c| (r, c)))
        .map(|(r, c)| cell(r, c))
        .collect();
    write_unsorted(&engine, &path, &even);
    write_unsorted(&engine, &path, &odd);

    let expected: Vec<_> = (0..16i64)
        .flat_map(|r| (0..16i64).map(move |c| (r, c)))
        .map(|(r, c)| cell(r, c))
        .collect();
    assert_eq!(read_all(&engine, &path, None), expected);
    assert_eq!(read_with(&engine, &path, None, 12, 32), expected);

    let subarray = Domain::Int64(vec![[3, 5], [7, 10]]);
    let expected_sub: Vec<_> = expected
        .iter()
        .copied()
        .filter(|(r, c, _)| (3..=5).contains(r) && (7..=10).contains(c))
        .collect();
    assert_eq!(read_all(&engine, &path, Some(&subarray)), expected_sub);
}

#[test]
fn test_open_reader_survives_consolidation() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 2);
    write_unsorted(&engine, &path, &[(1, 1, 1), (3, 3, 3), (5, 5, 5)]);
    write_unsorted(&engine, &path, &[(2, 2, 2), (3, 3, 30)]);

    let mut reader = engine.open_array(&path, ArrayMode::Read, None, None).unwrap();
    let mut value_data = vec![0u8; 8];
    let mut coord_data = vec![0u8; 32];
    let mut values = Vec::new();
    {
        let mut buffers = [
            ReadBuffer::fixed(&mut value_data),
            ReadBuffer::fixed(&mut coord_data),
        ];
        reader.read(&mut buffers).unwrap();
        values.extend(decode::<i32>(buffers[0].data()).unwrap());
    }

    let summary = engine.consolidate(&path).unwrap();
    assert_eq!(summary.retired.len(), 2);
    assert_eq!(engine.fragments(&path).unwrap().len(), 1);

    // The session keeps reading the fragments it opened with
    while !reader.is_complete() {
        let mut buffers = [
            ReadBuffer::fixed(&mut value_data),
            ReadBuffer::fixed(&mut coord_data),
        ];
        reader.read(&mut buffers).unwrap();
        values.extend(decode::<i32>(buffers[0].data()).unwrap());
    }
    reader.finalize().unwrap();

    assert_eq!(values, vec![1, 2, 30, 5]);
    assert_eq!(
        read_all(&engine, &path, None),
        vec![(1, 1, 1), (2, 2, 2), (3, 3, 30), (5, 5, 5)]
    );
}

// =============================================================================
// Overflow Tests
// =============================================================================

#[test]
fn test_small_buffers_match_full_read() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 5);
    write_unsorted(&engine, &path, &sample_cells());
    write_unsorted(&engine, &path, &[(0, 0, -1), (15, 15, -2)]);

    let full = read_all(&engine, &path, None);
    // 3 values but a single coordinate pair per read
    let chunked = read_with(&engine, &path, None, 12, 16);
    assert_eq!(chunked, full);

    // Coordinates larger than values
    let chunked = read_with(&engine, &path, None, 4, 48);
    assert_eq!(chunked, full);
}

#[test]
fn test_overflow_flags() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 100);
    write_unsorted(&engine, &path, &[(1, 1, 1), (2, 2, 2), (3, 3, 3)]);

    let mut array = engine.open_array(&path, ArrayMode::Read, None, None).unwrap();
    let mut values = vec![0u8; 8];
    let mut coords = vec![0u8; 64];
    {
        let mut buffers = [ReadBuffer::fixed(&mut values), ReadBuffer::fixed(&mut coords)];
        array.read(&mut buffers).unwrap();
        assert_eq!(decode::<i32>(buffers[0].data()).unwrap(), vec![1, 2]);
        assert_eq!(buffers[1].size(), 48);
    }
    assert!(array.overflow(0));
    assert!(!array.overflow(1));
    assert!(!array.is_complete());

    let mut buffers = [ReadBuffer::fixed(&mut values), ReadBuffer::fixed(&mut coords)];
    array.read(&mut buffers).unwrap();
    assert_eq!(decode::<i32>(buffers[0].data()).unwrap(), vec![3]);
    assert_eq!(buffers[1].size(), 0);
    assert!(!array.overflow(0));
    assert!(array.is_complete());
}

#[test]
fn test_buffer_smaller_than_a_cell_overflows_without_progress() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 100);
    write_unsorted(&engine, &path, &[(1, 1, 1)]);

    let mut array = engine
        .open_array(&path, ArrayMode::Read, None, Some(&["a1"]))
        .unwrap();
    let mut tiny = vec![0u8; 2];
    let mut buffers = [ReadBuffer::fixed(&mut tiny)];
    array.read(&mut buffers).unwrap();

    assert_eq!(buffers[0].size(), 0);
    assert!(array.overflow(0));
}

#[test]
fn test_var_attribute_overflow_resumes() {
    let (temp, engine) = setup_engine();
    let path = temp.path().join("names");
    let mut raw = RawArraySchema::sparse(
        "names",
        &["name"],
        &["i"],
        Domain::Int32(vec![[0, 99]]),
        &[Datatype::Char, Datatype::Int32],
    );
    raw.cell_val_num = Some(vec![CellValNum::Var]);
    engine
        .create_array(&path, &ArraySchema::new(raw).unwrap())
        .unwrap();

    let words = ["alpha", "", "gamma-ray", "d", "epsilon"];
    let (offsets, values) = var_from_strs(&words);
    let coords: Vec<i32> = (0..words.len() as i32).collect();
    let mut array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    array
        .write(&[
            WriteBuffer::Var {
                offsets: &offsets,
                values: &values,
            },
            WriteBuffer::Fixed(&encode(&coords)),
        ])
        .unwrap();
    array.finalize().unwrap();

    let mut array = engine
        .open_array(&path, ArrayMode::Read, None, Some(&["name"]))
        .unwrap();
    let mut read_offsets = vec![0u64; 4];
    let mut read_values = vec![0u8; 10];
    let mut out: Vec<String> = Vec::new();
    while !array.is_complete() {
        let mut buffers = [ReadBuffer::var(&mut read_offsets, &mut read_values)];
        array.read(&mut buffers).unwrap();
        for cell in buffers[0].var_cells() {
            out.push(String::from_utf8(cell.to_vec()).unwrap());
        }
    }

    assert_eq!(out, words);
}

// =============================================================================
// Dense Tests
// =============================================================================

fn create_dense_2d(engine: &Engine, temp: &TempDir) -> PathBuf {
    let path = temp.path().join("dense");
    let raw = RawArraySchema::dense(
        "dense",
        &["v"],
        &["x", "y"],
        Domain::Int64(vec![[0, 3], [0, 3]]),
        TileExtents::Int64(vec![2, 2]),
        &[Datatype::Int32, Datatype::Int64],
    );
    engine
        .create_array(&path, &ArraySchema::new(raw).unwrap())
        .unwrap();
    path
}

#[test]
fn test_dense_global_order_is_tile_by_tile() {
    let (temp, engine) = setup_engine();
    let path = create_dense_2d(&engine, &temp);

    let mut array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    array
        .write(&[WriteBuffer::Fixed(&encode(&(0..16).collect::<Vec<i32>>()))])
        .unwrap();
    array.finalize().unwrap();

    let read = read_all(&engine, &path, None);
    let coords: Vec<(i64, i64)> = read.iter().map(|c| (c.0, c.1)).collect();
    assert_eq!(&coords[..4], &[(0, 0), (0, 1), (1, 0), (1, 1)]);
    assert_eq!(&coords[4..8], &[(0, 2), (0, 3), (1, 2), (1, 3)]);
    assert_eq!(read.iter().map(|c| c.2).collect::<Vec<_>>(), (0..16).collect::<Vec<_>>());
}

#[test]
fn test_dense_read_fills_unwritten_cells() {
    let (temp, engine) = setup_engine();
    let path = create_dense_2d(&engine, &temp);

    let mut array = engine
        .open_array(&path, ArrayMode::WriteUnsorted, None, None)
        .unwrap();
    array
        .write(&[
            WriteBuffer::Fixed(&encode(&[7i32])),
            WriteBuffer::Fixed(&encode(&[3i64, 3])),
        ])
        .unwrap();
    array.finalize().unwrap();

    let subarray = Domain::Int64(vec![[2, 3], [2, 3]]);
    let read = read_all(&engine, &path, Some(&subarray));
    assert_eq!(
        read,
        vec![
            (2, 2, i32::MAX),
            (2, 3, i32::MAX),
            (3, 2, i32::MAX),
            (3, 3, 7)
        ]
    );
}

#[test]
fn test_empty_dense_array_reads_empty_values() {
    let (temp, engine) = setup_engine();
    let path = create_dense_2d(&engine, &temp);

    let read = read_all(&engine, &path, None);
    assert_eq!(read.len(), 16);
    assert!(read.iter().all(|c| c.2 == i32::MAX));
}

// =============================================================================
// Reset Tests
// =============================================================================

#[test]
fn test_reset_subarray_restarts_scan() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 100);
    write_unsorted(&engine, &path, &[(1, 1, 1), (5, 5, 5), (9, 9, 9)]);

    let mut array = engine
        .open_array(&path, ArrayMode::Read, None, Some(&["a1"]))
        .unwrap();
    let mut values = vec![0u8; 4];
    {
        let mut buffers = [ReadBuffer::fixed(&mut values)];
        array.read(&mut buffers).unwrap();
        assert_eq!(decode::<i32>(buffers[0].data()).unwrap(), vec![1]);
    }

    array
        .reset_subarray(&Domain::Int64(vec![[4, 15], [0, 15]]))
        .unwrap();
    let mut values = vec![0u8; 64];
    let mut buffers = [ReadBuffer::fixed(&mut values)];
    array.read(&mut buffers).unwrap();
    assert_eq!(decode::<i32>(buffers[0].data()).unwrap(), vec![5, 9]);
}

#[test]
fn test_reset_attributes() {
    let (temp, engine) = setup_engine();
    let path = create_sparse(&engine, &temp, CellOrder::RowMajor, 100);
    write_unsorted(&engine, &path, &[(1, 2, 12)]);

    let mut array = engine.open_array(&path, ArrayMode::Read, None, None).unwrap();
    assert_eq!(array.attributes(), vec!["a1", "__coords"]);

    array.reset_attributes(Some(&["__coords"])).unwrap();
    assert_eq!(array.attributes(), vec!["__coords"]);
    let mut coords = vec![0u8; 64];
    let mut buffers = [ReadBuffer::fixed(&mut coords)];
    array.read(&mut buffers).unwrap();
    assert_eq!(decode::<i64>(buffers[0].data()).unwrap(), vec![1, 2]);

    let err = array.reset_attributes(Some(&["nope"])).unwrap_err();
    assert!(matches!(err, AtlasError::NotFound(_)));
    let err = array.reset_attributes(Some(&[])).unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));
}
