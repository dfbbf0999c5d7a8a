//! `CompressedVectorReader` (§4.5): decodes bound record fields out of a
//! compressed vector's data packets, in lockstep across fields, using a
//! seek index to jump to an arbitrary record.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Seek, Write};

use deku::{DekuContainerRead, DekuContainerWrite};
use tracing::{debug, instrument};

use crate::binding::{raw_to_scale, BufferBinding};
use crate::error::E57Error;
use crate::header::SectionHeader;
use crate::node::{Arena, NodeId};
use crate::packet::{DataPacket, IndexEntry, IndexPacket};
use crate::packet_cache::{self, PacketCache};
use crate::paged_file::StdPagedFile;

use super::{leaf_kind_of, LeafKind, LeafValue};
use crate::bitpack::{FloatDecoder, IntegerDecoder, StringDecoder};

enum Decoder {
    Integer(IntegerDecoder),
    Float(FloatDecoder),
    String(StringDecoder),
}

fn new_decoder(kind: &LeafKind) -> Decoder {
    match *kind {
        LeafKind::Integer { bits, min } => Decoder::Integer(IntegerDecoder::new(bits, min)),
        LeafKind::ScaledInteger { bits, min, .. } => Decoder::Integer(IntegerDecoder::new(bits, min)),
        LeafKind::Float(precision) => Decoder::Float(FloatDecoder::new(precision)),
        LeafKind::String => Decoder::String(StringDecoder::new()),
    }
}

struct ReadChannel {
    kind: LeafKind,
    decoder: Decoder,
    ready: VecDeque<LeafValue>,
}

impl ReadChannel {
    fn new(kind: LeafKind) -> Self {
        let decoder = new_decoder(&kind);
        ReadChannel { kind, decoder, ready: VecDeque::new() }
    }

    fn reset(&mut self) {
        self.decoder = new_decoder(&self.kind);
        self.ready.clear();
    }

    /// Feed one packet's bytestream for this field, decoding exactly
    /// `target_count` records (known in advance from the seek index, which
    /// is what makes zero-width constant fields — which consume no bytes at
    /// all — decode correctly).
    fn feed_packet(&mut self, payload: &[u8], target_count: usize) -> Result<(), E57Error> {
        match &mut self.decoder {
            Decoder::Integer(d) => {
                let (values, _) = d.feed(payload, target_count);
                self.ready.extend(values.into_iter().map(LeafValue::Int));
            },
            Decoder::Float(d) => {
                let (values, _) = d.feed(payload, target_count);
                self.ready.extend(values.into_iter().map(LeafValue::Float));
            },
            Decoder::String(d) => {
                let (values, _) = d.feed(payload, target_count)?;
                self.ready.extend(values.into_iter().map(LeafValue::Str));
            },
        }
        Ok(())
    }
}

pub struct CompressedVectorReader<'a, F> {
    paged_file: &'a mut StdPagedFile<F>,
    cache: &'a RefCell<PacketCache>,
    channels: Vec<ReadChannel>,
    bindings: Vec<Option<BufferBinding<'a>>>,
    leaf_index: Vec<IndexEntry>,
    total_records: u64,
    next_packet_idx: usize,
    current_record: u64,
    pending_discard: u64,
    closed: bool,
}

impl<'a, F: Read + Write + Seek> CompressedVectorReader<'a, F> {
    /// Open a reader against `cv`. `bindings` may cover any subset of the
    /// prototype's leaves; unbound leaves are still decoded (to stay in
    /// lockstep with bound ones) but their values are discarded.
    #[instrument(skip(arena, paged_file, cache, bindings))]
    pub fn new(
        arena: &Arena,
        cv: NodeId,
        paged_file: &'a mut StdPagedFile<F>,
        cache: &'a RefCell<PacketCache>,
        mut bindings: Vec<BufferBinding<'a>>,
    ) -> Result<Self, E57Error> {
        let (prototype, section_start, total_records) = match arena.data(cv) {
            crate::node::NodeData::CompressedVector(c) => (c.prototype, c.binary_section_logical_start, c.record_count),
            other => return Err(E57Error::TypeMismatch(format!("expected compressedVector, found {}", other.kind_name()))),
        };

        let leaves = arena.prototype_leaves(prototype);
        let mut channels = Vec::with_capacity(leaves.len());
        let mut ordered_bindings: Vec<Option<BufferBinding<'a>>> = Vec::with_capacity(leaves.len());
        for (path, leaf_id) in &leaves {
            channels.push(ReadChannel::new(leaf_kind_of(arena.data(*leaf_id))?));
            let pos = bindings.iter().position(|b| &b.path == path);
            ordered_bindings.push(pos.map(|i| bindings.remove(i)));
        }
        if let Some(stray) = bindings.into_iter().next() {
            return Err(E57Error::BadBuffer(format!("buffer bound to path not in prototype: {}", stray.path)));
        }

        let leaf_index = if total_records == 0 {
            Vec::new()
        } else {
            let header_len = SectionHeader::new_compressed_vector(0).to_bytes()?.len();
            let mut header_bytes = vec![0u8; header_len];
            paged_file.read_at(section_start, &mut header_bytes)?;
            let (_, header) = SectionHeader::from_bytes((&header_bytes, 0))?;
            if header.index_physical_offset == 0 {
                Vec::new()
            } else {
                load_leaf_index(paged_file, header.index_physical_offset)?
            }
        };

        debug!(fields = channels.len(), total_records, "opened compressed vector reader");

        Ok(CompressedVectorReader {
            paged_file,
            cache,
            channels,
            bindings: ordered_bindings,
            leaf_index,
            total_records,
            next_packet_idx: 0,
            current_record: 0,
            pending_discard: 0,
            closed: false,
        })
    }

    /// Decode up to `max_records` into the bound buffers. Returns fewer
    /// once a bound buffer fills or the section is exhausted.
    pub fn read(&mut self, max_records: usize) -> Result<usize, E57Error> {
        if self.closed {
            return Err(E57Error::ReaderNotOpen);
        }
        if self.channels.is_empty() {
            return Ok(0);
        }
        let cap = self
            .bindings
            .iter()
            .flatten()
            .map(|b| b.remaining())
            .min()
            .unwrap_or(usize::MAX);
        let n = max_records.min(cap);
        let mut delivered = 0usize;
        while delivered < n {
            if self.channels[0].ready.is_empty() {
                if !self.fetch_next_packet()? {
                    break;
                }
                continue;
            }
            // Every channel decodes exactly `target_count` records per packet
            // (the writer byte-aligns each channel at every packet boundary),
            // so all `ready` queues empty on the same iteration regardless of
            // how many bits-per-record each field uses.
            let values: Vec<LeafValue> = self
                .channels
                .iter_mut()
                .map(|c| c.ready.pop_front().expect("channels decode in lockstep per packet"))
                .collect();
            if self.pending_discard > 0 {
                self.pending_discard -= 1;
            } else {
                self.write_values(&values)?;
                delivered += 1;
            }
            self.current_record += 1;
        }
        Ok(delivered)
    }

    fn write_values(&mut self, values: &[LeafValue]) -> Result<(), E57Error> {
        for ((channel, binding), value) in self.channels.iter().zip(self.bindings.iter_mut()).zip(values) {
            let Some(binding) = binding else { continue };
            match (&channel.kind, value) {
                (LeafKind::Integer { .. }, LeafValue::Int(v)) => {
                    binding.set_next_i64(*v)?;
                },
                (LeafKind::ScaledInteger { scale, offset, .. }, LeafValue::Int(raw)) => {
                    if binding.do_scaling {
                        binding.set_next_f64(raw_to_scale(*raw, *scale, *offset))?;
                    } else {
                        binding.set_next_i64(*raw)?;
                    }
                },
                (LeafKind::Float(_), LeafValue::Float(v)) => {
                    binding.set_next_f64(*v)?;
                },
                (LeafKind::String, LeafValue::Str(v)) => {
                    binding.set_next_string(v.clone())?;
                },
                _ => unreachable!("channel kind and decoded value always agree"),
            };
        }
        Ok(())
    }

    fn fetch_next_packet(&mut self) -> Result<bool, E57Error> {
        if self.next_packet_idx >= self.leaf_index.len() {
            return Ok(false);
        }
        let entry = self.leaf_index[self.next_packet_idx];
        let target_count = if self.next_packet_idx + 1 < self.leaf_index.len() {
            self.leaf_index[self.next_packet_idx + 1].chunk_record_number - entry.chunk_record_number
        } else {
            self.total_records - entry.chunk_record_number
        } as usize;

        let bytes = self.cache.borrow_mut().lock(self.paged_file, entry.chunk_physical_offset)?;
        let (_, packet) = DataPacket::from_bytes((&bytes, 0))?;
        for (channel, stream) in self.channels.iter_mut().zip(&packet.streams) {
            channel.feed_packet(&stream.payload, target_count)?;
        }
        self.next_packet_idx += 1;
        Ok(true)
    }

    /// Jump so the next `read()` call begins at `record_number`.
    pub fn seek(&mut self, record_number: u64) -> Result<(), E57Error> {
        if self.closed {
            return Err(E57Error::ReaderNotOpen);
        }
        if record_number >= self.total_records {
            return Err(E57Error::ValueOutOfBounds(format!(
                "record {record_number} is past the end ({} records)",
                self.total_records
            )));
        }
        let idx = self
            .leaf_index
            .partition_point(|e| e.chunk_record_number <= record_number)
            .saturating_sub(1);
        for channel in &mut self.channels {
            channel.reset();
        }
        self.next_packet_idx = idx;
        self.current_record = self.leaf_index[idx].chunk_record_number;
        self.pending_discard = record_number - self.current_record;
        Ok(())
    }

    /// No cached packet is held beyond a single `lock()` call, so closing a
    /// reader is bookkeeping only.
    pub fn close(&mut self) -> Result<(), E57Error> {
        self.closed = true;
        Ok(())
    }
}

/// Follow a (possibly multi-level) index tree down to its level-0 entries,
/// in ascending `chunk_record_number` order.
fn load_leaf_index<F: Read + Write + Seek>(paged_file: &mut StdPagedFile<F>, offset: u64) -> Result<Vec<IndexEntry>, E57Error> {
    let bytes = packet_cache::read_packet(paged_file, offset)?;
    let (_, packet) = IndexPacket::from_bytes((&bytes, 0))?;
    if packet.index_level == 0 {
        return Ok(packet.entries);
    }
    let mut out = Vec::new();
    for entry in &packet.entries {
        out.extend(load_leaf_index(paged_file, entry.chunk_physical_offset)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::MemoryRepresentation;
    use crate::compressed_vector::CompressedVectorWriter;
    use crate::node::Precision;
    use crate::paged_file::ReadChecksumPolicy;
    use std::io::Cursor;

    fn open_file() -> StdPagedFile<Cursor<Vec<u8>>> {
        StdPagedFile::new(Cursor::new(Vec::new()), 1024, ReadChecksumPolicy::Never).unwrap()
    }

    fn build_fixture(values: &[i64]) -> (Arena, NodeId, StdPagedFile<Cursor<Vec<u8>>>) {
        let mut arena = Arena::new();
        let root = arena.root();
        let proto = arena.new_structure();
        let field = arena.new_integer(0, 0, 1_000_000).unwrap();
        arena.adopt(proto, "intensity".into(), field).unwrap();
        let codecs = arena.new_vector(true);
        let cv = arena.new_compressed_vector(proto, codecs).unwrap();
        arena.adopt(root, "points".into(), cv).unwrap();

        let mut paged_file = open_file();
        let mut data = values.to_vec();
        let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut data), 1).unwrap();
        let mut writer = CompressedVectorWriter::new(&mut arena, cv, &mut paged_file, vec![binding]).unwrap();
        writer.write(values.len()).unwrap();
        let record_count = writer.close().unwrap();
        drop(writer);
        if let crate::node::NodeData::CompressedVector(c) = arena.data_mut(cv) {
            c.record_count = record_count;
        }
        (arena, cv, paged_file)
    }

    #[test]
    fn reads_back_every_record() {
        let values: Vec<i64> = (0..5000).collect();
        let (arena, cv, mut paged_file) = build_fixture(&values);
        let cache = RefCell::new(PacketCache::new(4));
        let mut out = vec![0i64; values.len()];
        let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut out), 1).unwrap();
        let mut reader = CompressedVectorReader::new(&arena, cv, &mut paged_file, &cache, vec![binding]).unwrap();
        let n = reader.read(values.len()).unwrap();
        assert_eq!(n, values.len());
        assert_eq!(out, values);
        reader.close().unwrap();
    }

    #[test]
    fn seek_lands_on_requested_record() {
        let values: Vec<i64> = (0..5000).collect();
        let (arena, cv, mut paged_file) = build_fixture(&values);
        let cache = RefCell::new(PacketCache::new(4));
        let mut out = [0i64; 10];
        let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut out), 1).unwrap();
        let mut reader = CompressedVectorReader::new(&arena, cv, &mut paged_file, &cache, vec![binding]).unwrap();
        reader.seek(4990).unwrap();
        let n = reader.read(10).unwrap();
        assert_eq!(n, 10);
        assert_eq!(out.to_vec(), (4990..5000).collect::<Vec<i64>>());
    }

    #[test]
    fn mixed_bit_widths_stay_in_lockstep_across_packets() {
        // A 1-bit field drains a tiny fraction of a byte per record while a
        // co-located Float32 field drains 4 whole bytes every record, so
        // without per-packet byte alignment their packet-to-packet record
        // counts drift apart within the first packet.
        let mut arena = Arena::new();
        let root = arena.root();
        let proto = arena.new_structure();
        let flag = arena.new_integer(0, 0, 1).unwrap();
        let x = arena.new_float(0.0, Precision::Single, -1.0e6, 1.0e6).unwrap();
        arena.adopt(proto, "flag".into(), flag).unwrap();
        arena.adopt(proto, "x".into(), x).unwrap();
        let codecs = arena.new_vector(true);
        let cv = arena.new_compressed_vector(proto, codecs).unwrap();
        arena.adopt(root, "points".into(), cv).unwrap();

        let mut paged_file = open_file();
        const N: usize = 50_000;
        let mut flags: Vec<i64> = (0..N).map(|i| (i % 2) as i64).collect();
        let mut xs: Vec<f64> = (0..N).map(|i| i as f64 * 0.25).collect();
        let flag_binding = BufferBinding::new("flag", MemoryRepresentation::I64(&mut flags), 1).unwrap();
        let x_binding = BufferBinding::new("x", MemoryRepresentation::Double(&mut xs), 1).unwrap();
        let mut writer = CompressedVectorWriter::new(&mut arena, cv, &mut paged_file, vec![flag_binding, x_binding]).unwrap();
        writer.write(N).unwrap();
        let record_count = writer.close().unwrap();
        drop(writer);
        if let crate::node::NodeData::CompressedVector(c) = arena.data_mut(cv) {
            c.record_count = record_count;
        }

        let cache = RefCell::new(PacketCache::new(4));
        let mut flags_out = vec![0i64; N];
        let mut xs_out = vec![0f64; N];
        let flag_out_binding = BufferBinding::new("flag", MemoryRepresentation::I64(&mut flags_out), 1).unwrap();
        let x_out_binding = BufferBinding::new("x", MemoryRepresentation::Double(&mut xs_out), 1).unwrap();
        let mut reader =
            CompressedVectorReader::new(&arena, cv, &mut paged_file, &cache, vec![flag_out_binding, x_out_binding]).unwrap();
        let n = reader.read(N).unwrap();
        assert_eq!(n, N);
        assert_eq!(flags_out, flags);
        for (got, want) in xs_out.iter().zip(xs.iter()) {
            assert_eq!(*got as f32, *want as f32);
        }
    }

    #[test]
    fn seek_past_a_packet_boundary_is_correct_for_a_sub_byte_field() {
        let mut arena = Arena::new();
        let root = arena.root();
        let proto = arena.new_structure();
        let flag = arena.new_integer(0, 0, 1).unwrap();
        arena.adopt(proto, "flag".into(), flag).unwrap();
        let codecs = arena.new_vector(true);
        let cv = arena.new_compressed_vector(proto, codecs).unwrap();
        arena.adopt(root, "points".into(), cv).unwrap();

        let mut paged_file = open_file();
        const N: usize = 50_000;
        let mut flags: Vec<i64> = (0..N).map(|i| (i % 2) as i64).collect();
        let binding = BufferBinding::new("flag", MemoryRepresentation::I64(&mut flags), 1).unwrap();
        let mut writer = CompressedVectorWriter::new(&mut arena, cv, &mut paged_file, vec![binding]).unwrap();
        writer.write(N).unwrap();
        let record_count = writer.close().unwrap();
        drop(writer);
        if let crate::node::NodeData::CompressedVector(c) = arena.data_mut(cv) {
            c.record_count = record_count;
        }

        let cache = RefCell::new(PacketCache::new(4));
        let mut out = [0i64; 10];
        let binding = BufferBinding::new("flag", MemoryRepresentation::I64(&mut out), 1).unwrap();
        let mut reader = CompressedVectorReader::new(&arena, cv, &mut paged_file, &cache, vec![binding]).unwrap();
        reader.seek(49_990).unwrap();
        let n = reader.read(10).unwrap();
        assert_eq!(n, 10);
        assert_eq!(out.to_vec(), flags[49_990..50_000].to_vec());
    }

    #[test]
    fn unbound_leaf_is_skipped_without_breaking_lockstep() {
        let mut arena = Arena::new();
        let proto = arena.new_structure();
        let a = arena.new_integer(0, 0, 255).unwrap();
        let b = arena.new_float(0.0, Precision::Double, -1.0, 1.0).unwrap();
        arena.adopt(proto, "a".into(), a).unwrap();
        arena.adopt(proto, "b".into(), b).unwrap();
        let codecs = arena.new_vector(true);
        let cv = arena.new_compressed_vector(proto, codecs).unwrap();
        arena.set_attached_recursive(cv);

        let mut paged_file = open_file();
        let mut a_data = [1i64, 2, 3];
        let mut b_data = [0.5f64, 1.5, 2.5];
        let a_binding = BufferBinding::new("a", MemoryRepresentation::I64(&mut a_data), 1).unwrap();
        let b_binding = BufferBinding::new("b", MemoryRepresentation::Double(&mut b_data), 1).unwrap();
        let mut writer = CompressedVectorWriter::new(&mut arena, cv, &mut paged_file, vec![a_binding, b_binding]).unwrap();
        writer.write(3).unwrap();
        let record_count = writer.close().unwrap();
        drop(writer);
        if let crate::node::NodeData::CompressedVector(c) = arena.data_mut(cv) {
            c.record_count = record_count;
        }

        let cache = RefCell::new(PacketCache::new(4));
        let mut a_out = [0i64; 3];
        let a_only = BufferBinding::new("a", MemoryRepresentation::I64(&mut a_out), 1).unwrap();
        let mut reader = CompressedVectorReader::new(&arena, cv, &mut paged_file, &cache, vec![a_only]).unwrap();
        let n = reader.read(3).unwrap();
        assert_eq!(n, 3);
        assert_eq!(a_out, [1, 2, 3]);
    }
}
