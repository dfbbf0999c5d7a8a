//! End-to-end scenarios against the public `E57File` API.

use std::io::Cursor;

use e57::binding::{BufferBinding, MemoryRepresentation};
use e57::node::Precision;
use e57::{E57Error, E57File, NodeData};

fn new_file() -> E57File<Cursor<Vec<u8>>> {
    E57File::create(Cursor::new(Vec::new()), 1024).unwrap()
}

fn build_points(file: &mut E57File<Cursor<Vec<u8>>>) -> e57::NodeId {
    let proto = file.arena_mut().new_structure();
    let intensity = file.arena_mut().new_integer(0, 0, 65535).unwrap();
    file.arena_mut().adopt(proto, "intensity".into(), intensity).unwrap();
    let codecs = file.arena_mut().new_vector(true);
    let cv = file.arena_mut().new_compressed_vector(proto, codecs).unwrap();
    let root = file.root();
    file.arena_mut().adopt(root, "points".into(), cv).unwrap();
    cv
}

#[test]
fn write_100k_records_reopen_and_read_all_of_them() {
    let mut file = new_file();
    let cv = build_points(&mut file);

    let values: Vec<i64> = (0..100_000).map(|i| (i % 65536) as i64).collect();
    {
        let mut data = values.clone();
        let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut data), 1).unwrap();
        let mut writer = file.open_writer(cv, vec![binding]).unwrap();
        let written = writer.write(values.len()).unwrap();
        assert_eq!(written, values.len());
        let record_count = writer.close().unwrap();
        let node = writer.node();
        drop(writer);
        file.finish_write(node, record_count);
    }

    let inner = file.close().unwrap();
    let mut reopened = E57File::open(inner).unwrap();
    let cv = reopened.get("/points").unwrap();

    let mut out = vec![0i64; values.len()];
    let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut out), 1).unwrap();
    let mut reader = reopened.open_reader(cv, vec![binding]).unwrap();
    let n = reader.read(values.len()).unwrap();
    assert_eq!(n, values.len());
    assert_eq!(out, values);
}

#[test]
fn seek_to_an_arbitrary_record_then_reads_the_following_records() {
    let mut file = new_file();
    let cv = build_points(&mut file);

    let values: Vec<i64> = (0..100_000).map(|i| (i % 65536) as i64).collect();
    {
        let mut data = values.clone();
        let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut data), 1).unwrap();
        let mut writer = file.open_writer(cv, vec![binding]).unwrap();
        writer.write(values.len()).unwrap();
        let record_count = writer.close().unwrap();
        let node = writer.node();
        drop(writer);
        file.finish_write(node, record_count);
    }

    let mut out = [0i64; 10];
    let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut out), 1).unwrap();
    let mut reader = file.open_reader(cv, vec![binding]).unwrap();
    reader.seek(49_999).unwrap();
    let n = reader.read(10).unwrap();
    assert_eq!(n, 10);
    assert_eq!(out.to_vec(), values[49_999..50_009].to_vec());
}

#[test]
fn setting_the_same_path_twice_is_rejected() {
    let mut file = new_file();
    file.set("/x", NodeData::Integer(e57::node::IntegerData { value: 1, min: 0, max: 10 }), false)
        .unwrap();
    let err = file
        .set("/x", NodeData::Integer(e57::node::IntegerData { value: 2, min: 0, max: 10 }), false)
        .unwrap_err();
    assert!(matches!(err, E57Error::AlreadyDefined(_)));
}

#[test]
fn corrupted_binary_section_offset_past_eof_fails_to_open_a_reader() {
    let mut file = new_file();
    let proto = file.arena_mut().new_structure();
    let field = file.arena_mut().new_float(0.0, Precision::Double, -1.0, 1.0).unwrap();
    file.arena_mut().adopt(proto, "v".into(), field).unwrap();
    let codecs = file.arena_mut().new_vector(true);
    let cv = file.arena_mut().new_compressed_vector(proto, codecs).unwrap();
    let root = file.root();
    file.arena_mut().adopt(root, "points".into(), cv).unwrap();

    // Claim records exist at a binary section that was never written;
    // `binary_section_logical_start` points far past anything allocated.
    if let NodeData::CompressedVector(c) = file.arena_mut().data_mut(cv) {
        c.record_count = 10;
        c.binary_section_logical_start = 10_000_000;
    }

    let mut out = [0f64; 10];
    let binding = BufferBinding::new("v", MemoryRepresentation::Double(&mut out), 1).unwrap();
    let err = file.open_reader(cv, vec![binding]).unwrap_err();
    assert!(matches!(err, E57Error::FileRead(_)));
}
