//! Tests for output sinks
//!
//! These tests verify:
//! - DirectSink batches records into a borrowed write session
//! - DoubleBufferedSink writes on its own thread and publishes on finish
//! - SerializedSink encoding, overflow and decoding

use std::path::{Path, PathBuf};

use atlasarray::buffer::{decode, encode};
use atlasarray::{
    ArrayMode, ArraySchema, AtlasError, CellRecord, CellSink, CellValNum, Config, Datatype,
    DirectSink, Domain, DoubleBufferedSink, Engine, RawArraySchema, ReadBuffer, SerializedSink,
};
use atlasarray::sink::decode_records;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().sync_on_finalize(false).build();
    (temp_dir, Engine::new(config).unwrap())
}

fn create_array(engine: &Engine, temp: &TempDir) -> PathBuf {
    let path = temp.path().join("sink");
    let mut raw = RawArraySchema::sparse(
        "sink",
        &["value", "note"],
        &["i"],
        Domain::Int64(vec![[0, 1_000_000]]),
        &[Datatype::Float64, Datatype::Char, Datatype::Int64],
    );
    raw.cell_val_num = Some(vec![CellValNum::Fixed(1), CellValNum::Var]);
    raw.capacity = Some(10);
    engine
        .create_array(&path, &ArraySchema::new(raw).unwrap())
        .unwrap();
    path
}

fn record(i: i64) -> CellRecord {
    vec![
        encode(&[i as f64 * 0.5]),
        format!("note {}", i).into_bytes(),
        encode(&[i]),
    ]
}

/// `(coord, value, note)` of every cell
fn read_all(engine: &Engine, path: &Path) -> Vec<(i64, f64, String)> {
    let mut array = engine.open_array(path, ArrayMode::Read, None, None).unwrap();
    let mut values = vec![0u8; 1 << 14];
    let mut offsets = vec![0u64; 1 << 11];
    let mut notes = vec![0u8; 1 << 15];
    let mut coords = vec![0u8; 1 << 14];
    let mut buffers = [
        ReadBuffer::fixed(&mut values),
        ReadBuffer::var(&mut offsets, &mut notes),
        ReadBuffer::fixed(&mut coords),
    ];
    array.read(&mut buffers).unwrap();
    assert!(array.is_complete());

    let values = decode::<f64>(buffers[0].data()).unwrap();
    let notes: Vec<String> = buffers[1]
        .var_cells()
        .iter()
        .map(|n| String::from_utf8(n.to_vec()).unwrap())
        .collect();
    let coords = decode::<i64>(buffers[2].data()).unwrap();
    coords
        .into_iter()
        .zip(values)
        .zip(notes)
        .map(|((c, v), n)| (c, v, n))
        .collect()
}

fn expected(range: std::ops::Range<i64>) -> Vec<(i64, f64, String)> {
    range
        .map(|i| (i, i as f64 * 0.5, format!("note {}", i)))
        .collect()
}

// =============================================================================
// Direct Sink Tests
// =============================================================================

#[test]
fn test_direct_sink_appends_in_batches() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    let mut session = array.into_write_session().unwrap();
    {
        let mut sink = DirectSink::new(&mut session, 7).unwrap();
        for i in 0..50 {
            sink.accept(record(i)).unwrap();
        }
        sink.flush().unwrap();
    }
    let published = session.finalize().unwrap();

    // Append sessions publish a single fragment
    assert_eq!(published.len(), 1);
    assert_eq!(read_all(&engine, &path), expected(0..50));
}

#[test]
fn test_direct_sink_unsorted_batches() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine
        .open_array(&path, ArrayMode::WriteUnsorted, None, None)
        .unwrap();
    let mut session = array.into_write_session().unwrap();
    {
        let mut sink = DirectSink::new(&mut session, 10).unwrap();
        for i in (0..25).rev() {
            sink.accept(record(i)).unwrap();
            if i == 20 {
                assert!(!sink.is_full());
            }
        }
        sink.flush().unwrap();
    }
    let published = session.finalize().unwrap();

    // One fragment per flushed batch
    assert_eq!(published.len(), 3);
    assert_eq!(read_all(&engine, &path), expected(0..25));
}

#[test]
fn test_direct_sink_rejects_bad_records() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    let mut session = array.into_write_session().unwrap();

    let err = DirectSink::new(&mut session, 0).unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));

    let mut sink = DirectSink::new(&mut session, 4).unwrap();
    sink.accept(vec![encode(&[1.0f64])]).unwrap();
    let err = sink.flush().unwrap_err();
    assert!(matches!(err, AtlasError::SchemaMismatch(_)));
}

#[test]
fn test_into_write_session_needs_write_mode() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine.open_array(&path, ArrayMode::Read, None, None).unwrap();
    let err = array.into_write_session().unwrap_err();
    assert!(matches!(err, AtlasError::InvalidOperation(_)));
}

// =============================================================================
// Double-Buffered Sink Tests
// =============================================================================

#[test]
fn test_double_buffered_sink_writes_everything() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    let mut sink = DoubleBufferedSink::new(array.into_write_session().unwrap(), 16).unwrap();
    for i in 0..500 {
        sink.accept(record(i)).unwrap();
    }
    let published = sink.finish().unwrap();

    assert_eq!(published.len(), 1);
    assert_eq!(read_all(&engine, &path), expected(0..500));
}

#[test]
fn test_double_buffered_sink_reports_worker_error() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    let mut sink = DoubleBufferedSink::new(array.into_write_session().unwrap(), 2).unwrap();
    sink.accept(record(5)).unwrap();
    // Coordinates go backwards, which an append session refuses
    sink.accept(record(1)).unwrap();
    let err = sink.finish().unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));

    // The failed session published nothing and released its lock
    assert!(engine.fragments(&path).unwrap().is_empty());
    let writer = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    writer.finalize().unwrap();
}

#[test]
fn test_dropped_double_buffered_sink_releases_lock() {
    let (temp, engine) = setup_engine();
    let path = create_array(&engine, &temp);

    let array = engine.open_array(&path, ArrayMode::Write, None, None).unwrap();
    let mut sink = DoubleBufferedSink::new(array.into_write_session().unwrap(), 4).unwrap();
    for i in 0..9 {
        sink.accept(record(i)).unwrap();
    }
    drop(sink);

    // Batches handed over before the drop are published
    let cells = read_all(&engine, &path);
    assert_eq!(cells, expected(0..8));
    engine
        .open_array(&path, ArrayMode::Write, None, None)
        .unwrap()
        .finalize()
        .unwrap();
}

// =============================================================================
// Serialized Sink Tests
// =============================================================================

#[test]
fn test_serialized_sink_round_trip() {
    let mut sink = SerializedSink::new(1024);
    assert!(sink.is_empty());
    let records = vec![
        vec![b"abc".to_vec(), Vec::new()],
        vec![vec![0xff; 5]],
        Vec::new(),
    ];
    for r in &records {
        sink.accept(r.clone()).unwrap();
    }
    sink.flush().unwrap();
    assert_eq!(sink.len(), 3);
    assert!(!sink.overflow());

    let bytes = sink.take();
    // 4 + (4 + 3) + (4 + 0), 4 + (4 + 5), 4
    assert_eq!(bytes.len(), 15 + 13 + 4);
    assert_eq!(&bytes[..4], &2u32.to_le_bytes());
    assert_eq!(decode_records(&bytes).unwrap(), records);
    assert!(sink.is_empty());
}

#[test]
fn test_serialized_sink_overflow() {
    let mut sink = SerializedSink::new(30);
    sink.accept(vec![vec![1; 10]]).unwrap();
    assert!(!sink.is_full());
    sink.accept(vec![vec![2; 10]]).unwrap();
    assert!(sink.overflow());
    assert!(sink.is_full());
    // Once full, later records are dropped even if they would fit
    sink.accept(Vec::new()).unwrap();
    assert_eq!(sink.len(), 1);

    let bytes = sink.take();
    assert_eq!(decode_records(&bytes).unwrap(), vec![vec![vec![1; 10]]]);
    assert!(!sink.overflow());
    sink.accept(vec![vec![3; 10]]).unwrap();
    assert_eq!(sink.len(), 1);
}

#[test]
fn test_decode_truncated_records() {
    let mut sink = SerializedSink::new(256);
    sink.accept(vec![b"hello".to_vec()]).unwrap();
    let bytes = sink.take();

    for cut in [2, 6, bytes.len() - 1] {
        let err = decode_records(&bytes[..cut]).unwrap_err();
        assert!(matches!(err, AtlasError::Corruption(_)));
    }
    assert!(decode_records(&[]).unwrap().is_empty());
}
