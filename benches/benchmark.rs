use std::io::Cursor;

use criterion::{criterion_group, criterion_main, Criterion, SamplingMode};

use e57::binding::{BufferBinding, MemoryRepresentation};
use e57::bitpack::{IntegerDecoder, IntegerEncoder};
use e57::node::{Arena, NodeId, Precision};
use e57::packet_cache::PacketCache;
use e57::paged_file::{ReadChecksumPolicy, StdPagedFile};
use e57::{CompressedVectorReader, CompressedVectorWriter, NodeData};

const RECORD_COUNT: usize = 200_000;

fn build_tree(arena: &mut Arena) -> NodeId {
    let proto = arena.new_structure();
    let x = arena.new_float(0.0, Precision::Double, -1.0e6, 1.0e6).unwrap();
    let y = arena.new_float(0.0, Precision::Double, -1.0e6, 1.0e6).unwrap();
    let intensity = arena.new_integer(0, 0, 65535).unwrap();
    arena.adopt(proto, "x".into(), x).unwrap();
    arena.adopt(proto, "y".into(), y).unwrap();
    arena.adopt(proto, "intensity".into(), intensity).unwrap();
    let codecs = arena.new_vector(true);
    let cv = arena.new_compressed_vector(proto, codecs).unwrap();
    let root = arena.root();
    arena.adopt(root, "points".into(), cv).unwrap();
    cv
}

fn write_points() -> (Arena, NodeId, StdPagedFile<Cursor<Vec<u8>>>) {
    let mut arena = Arena::new();
    let cv = build_tree(&mut arena);
    let mut paged_file = StdPagedFile::new(Cursor::new(Vec::new()), 1024, ReadChecksumPolicy::Sparse).unwrap();

    let mut xs: Vec<f64> = (0..RECORD_COUNT).map(|i| i as f64 * 0.001).collect();
    let mut ys: Vec<f64> = (0..RECORD_COUNT).map(|i| (i as f64 * 0.002).sin() * 1000.0).collect();
    let mut intensities: Vec<i64> = (0..RECORD_COUNT).map(|i| (i % 65536) as i64).collect();
    let bindings = vec![
        BufferBinding::new("x", MemoryRepresentation::Double(&mut xs), 1).unwrap(),
        BufferBinding::new("y", MemoryRepresentation::Double(&mut ys), 1).unwrap(),
        BufferBinding::new("intensity", MemoryRepresentation::I64(&mut intensities), 1).unwrap(),
    ];
    let mut writer = CompressedVectorWriter::new(&mut arena, cv, &mut paged_file, bindings).unwrap();
    writer.write(RECORD_COUNT).unwrap();
    let record_count = writer.close().unwrap();
    drop(writer);
    if let NodeData::CompressedVector(c) = arena.data_mut(cv) {
        c.record_count = record_count;
    }
    (arena, cv, paged_file)
}

fn bench_compressed_vector_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("compressed_vector_write");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);
    group.bench_function("200k_records_3_fields", |b| {
        b.iter(|| {
            std::hint::black_box(write_points());
        })
    });
    group.finish();
}

fn bench_compressed_vector_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("compressed_vector_read");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);

    let (arena, cv, mut paged_file) = write_points();

    group.bench_function("200k_records_3_fields", |b| {
        b.iter(|| {
            let mut xs = vec![0f64; RECORD_COUNT];
            let mut ys = vec![0f64; RECORD_COUNT];
            let mut intensities = vec![0i64; RECORD_COUNT];
            let bindings = vec![
                BufferBinding::new("x", MemoryRepresentation::Double(&mut xs), 1).unwrap(),
                BufferBinding::new("y", MemoryRepresentation::Double(&mut ys), 1).unwrap(),
                BufferBinding::new("intensity", MemoryRepresentation::I64(&mut intensities), 1).unwrap(),
            ];
            let cache = std::cell::RefCell::new(PacketCache::new(8));
            let mut reader = CompressedVectorReader::new(&arena, cv, &mut paged_file, &cache, bindings).unwrap();
            std::hint::black_box(reader.read(RECORD_COUNT).unwrap());
        })
    });
    group.finish();
}

fn bench_bitpack_integer_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitpack_integer");
    let values: Vec<i64> = (0..1_000_000).map(|i| i % 65536).collect();

    group.bench_function("encode_1m_values", |b| {
        b.iter(|| {
            let mut enc = IntegerEncoder::new(16, 0);
            for &v in &values {
                enc.push(v);
            }
            std::hint::black_box(enc.flush());
        })
    });

    let mut enc = IntegerEncoder::new(16, 0);
    for &v in &values {
        enc.push(v);
    }
    let encoded = enc.flush();
    group.bench_function("decode_1m_values", |b| {
        b.iter(|| {
            let mut dec = IntegerDecoder::new(16, 0);
            std::hint::black_box(dec.feed(&encoded, values.len()));
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_compressed_vector_write,
    bench_compressed_vector_read,
    bench_bitpack_integer_codec
);
criterion_main!(benches);
