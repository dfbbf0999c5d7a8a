//! `CompressedVectorWriter` (§4.4): packs bound record fields into data
//! packets, sealing each one as it approaches the 64 KiB packet limit, and
//! builds a bottom-up seek index on close.

use std::io::{Read, Seek, Write};

use deku::DekuContainerWrite;
use tracing::{debug, instrument};

use crate::binding::{scale_to_raw, BufferBinding};
use crate::error::E57Error;
use crate::header::SectionHeader;
use crate::node::{Arena, NodeId};
use crate::packet::{DataPacket, IndexEntry, IndexPacket, MAX_INDEX_ENTRIES, MAX_PACKET_LEN};
use crate::paged_file::StdPagedFile;

use super::{leaf_kind_of, LeafKind};
use crate::bitpack::{FloatEncoder, IntegerEncoder, StringEncoder};

/// Headroom reserved below [`MAX_PACKET_LEN`] when deciding whether to seal
/// a packet after a record: a conservative upper bound on how much any one
/// more record could add, since the exact figure depends on how many whole
/// bytes the bit-packed fields happen to drain on the next push.
const SEAL_MARGIN: usize = 256;

enum Encoder {
    Integer(IntegerEncoder),
    Float(FloatEncoder),
    String(StringEncoder),
}

struct WriteChannel {
    kind: LeafKind,
    encoder: Encoder,
}

impl WriteChannel {
    fn new(kind: LeafKind) -> Self {
        let encoder = match kind {
            LeafKind::Integer { bits, min } => Encoder::Integer(IntegerEncoder::new(bits, min)),
            LeafKind::ScaledInteger { bits, min, .. } => Encoder::Integer(IntegerEncoder::new(bits, min)),
            LeafKind::Float(precision) => Encoder::Float(FloatEncoder::new(precision)),
            LeafKind::String => Encoder::String(StringEncoder::new()),
        };
        WriteChannel { kind, encoder }
    }

    fn push(&mut self, binding: &mut BufferBinding) -> Result<(), E57Error> {
        match (&self.kind, &mut self.encoder) {
            (LeafKind::Integer { .. }, Encoder::Integer(enc)) => {
                let value = binding
                    .get_next_i64()?
                    .ok_or_else(|| E57Error::BufferSizeMismatch { expected: 1, got: 0 })?;
                enc.push(value);
            },
            (LeafKind::ScaledInteger { min, max, scale, offset, .. }, Encoder::Integer(enc)) => {
                let raw = if binding.do_scaling {
                    let value = binding
                        .get_next_f64()?
                        .ok_or_else(|| E57Error::BufferSizeMismatch { expected: 1, got: 0 })?;
                    scale_to_raw(value, *min, *max, *scale, *offset)?
                } else {
                    binding
                        .get_next_i64()?
                        .ok_or_else(|| E57Error::BufferSizeMismatch { expected: 1, got: 0 })?
                };
                enc.push(raw);
            },
            (LeafKind::Float(_), Encoder::Float(enc)) => {
                let value = binding
                    .get_next_f64()?
                    .ok_or_else(|| E57Error::BufferSizeMismatch { expected: 1, got: 0 })?;
                enc.push(value);
            },
            (LeafKind::String, Encoder::String(enc)) => {
                let value = binding
                    .get_next_string()?
                    .ok_or_else(|| E57Error::BufferSizeMismatch { expected: 1, got: 0 })?;
                enc.push(&value);
            },
            _ => unreachable!("kind and encoder are constructed together"),
        }
        Ok(())
    }

    fn staged_len(&self) -> usize {
        match &self.encoder {
            Encoder::Integer(enc) => enc.staged_len(),
            Encoder::Float(enc) => enc.staged_len(),
            Encoder::String(enc) => enc.staged_len(),
        }
    }

    /// Byte-align and drain whatever is staged. Every packet boundary pads
    /// out a trailing partial byte (not just the final one on close) so a
    /// packet never splits a record's bits across two channels' packets at
    /// different rates — each packet is independently decodable for the
    /// record span the seek index says it covers.
    fn drain(&mut self) -> Vec<u8> {
        match &mut self.encoder {
            Encoder::Integer(enc) => enc.flush(),
            Encoder::Float(enc) => enc.flush(),
            Encoder::String(enc) => enc.flush(),
        }
    }
}

pub struct CompressedVectorWriter<'a, F> {
    paged_file: &'a mut StdPagedFile<F>,
    cv: NodeId,
    channels: Vec<WriteChannel>,
    bindings: Vec<BufferBinding<'a>>,
    index_entries: Vec<IndexEntry>,
    section_start: u64,
    data_start: u64,
    records_written: u64,
    records_at_packet_start: u64,
    closed: bool,
}

impl<'a, F: Read + Write + Seek> CompressedVectorWriter<'a, F> {
    /// Open a writer against `cv` (a `CompressedVector` node not yet holding
    /// any records), allocating a fresh binary section. `bindings` must
    /// cover every leaf of the prototype exactly once, in any order.
    #[instrument(skip(arena, paged_file, bindings))]
    pub fn new(
        arena: &mut Arena,
        cv: NodeId,
        paged_file: &'a mut StdPagedFile<F>,
        mut bindings: Vec<BufferBinding<'a>>,
    ) -> Result<Self, E57Error> {
        let (prototype, codecs) = match arena.data(cv) {
            crate::node::NodeData::CompressedVector(c) => (c.prototype, c.codecs),
            other => return Err(E57Error::TypeMismatch(format!("expected compressedVector, found {}", other.kind_name()))),
        };
        let _ = codecs; // reserved for a future pluggable-codec scheme; uncompressed bit-packing only today.

        let leaves = arena.prototype_leaves(prototype);
        if bindings.len() != leaves.len() {
            return Err(E57Error::BadBuffer(format!(
                "expected {} bound fields, got {}",
                leaves.len(),
                bindings.len()
            )));
        }
        let mut channels = Vec::with_capacity(leaves.len());
        let mut ordered_bindings = Vec::with_capacity(leaves.len());
        for (path, leaf_id) in &leaves {
            let pos = bindings
                .iter()
                .position(|b| &b.path == path)
                .ok_or_else(|| E57Error::BadBuffer(format!("no buffer bound for prototype field {path}")))?;
            let binding = bindings.remove(pos);
            channels.push(WriteChannel::new(leaf_kind_of(arena.data(*leaf_id))?));
            ordered_bindings.push(binding);
        }
        if !bindings.is_empty() {
            return Err(E57Error::BadBuffer(format!(
                "buffer bound to path not in prototype: {}",
                bindings[0].path
            )));
        }

        let header_len = SectionHeader::new_compressed_vector(0).to_bytes()?.len() as u64;
        let section_start = paged_file.allocate(header_len);
        let data_start = section_start + header_len;
        let header = SectionHeader::new_compressed_vector(data_start);
        paged_file.write_at(section_start, &header.to_bytes()?)?;

        if let crate::node::NodeData::CompressedVector(c) = arena.data_mut(cv) {
            c.binary_section_logical_start = section_start;
        }

        debug!(section_start, data_start, fields = channels.len(), "opened compressed vector writer");

        Ok(CompressedVectorWriter {
            paged_file,
            cv,
            channels,
            bindings: ordered_bindings,
            index_entries: Vec::new(),
            section_start,
            data_start,
            records_written: 0,
            records_at_packet_start: 0,
            closed: false,
        })
    }

    /// Push up to `max_records` records from the bound buffers, sealing
    /// packets as they fill. Returns the number actually written, which is
    /// less than `max_records` once every binding runs dry.
    pub fn write(&mut self, max_records: usize) -> Result<usize, E57Error> {
        if self.closed {
            return Err(E57Error::WriterNotOpen);
        }
        let available = self.bindings.iter().map(|b| b.remaining()).min().unwrap_or(0);
        let n = available.min(max_records);
        for _ in 0..n {
            for (channel, binding) in self.channels.iter_mut().zip(self.bindings.iter_mut()) {
                channel.push(binding)?;
            }
            self.records_written += 1;
            self.maybe_seal()?;
        }
        Ok(n)
    }

    fn maybe_seal(&mut self) -> Result<(), E57Error> {
        let lens: Vec<usize> = self.channels.iter().map(|c| c.staged_len()).collect();
        let predicted = DataPacket::encoded_len_from_lens(&lens);
        if predicted + SEAL_MARGIN > MAX_PACKET_LEN {
            self.seal_packet()?;
        }
        Ok(())
    }

    fn seal_packet(&mut self) -> Result<(), E57Error> {
        let streams: Vec<Vec<u8>> = self.channels.iter_mut().map(|c| c.drain()).collect();
        if streams.iter().all(|s| s.is_empty()) {
            return Ok(());
        }
        let packet = DataPacket::new(streams);
        let bytes = packet.to_bytes()?;
        let offset = self.paged_file.allocate(bytes.len() as u64);
        self.paged_file.write_at(offset, &bytes)?;
        self.index_entries.push(IndexEntry {
            chunk_record_number: self.records_at_packet_start,
            chunk_physical_offset: offset,
        });
        self.records_at_packet_start = self.records_written;
        Ok(())
    }

    /// Build the bottom-up index tree over `entries`, chaining levels until
    /// exactly one packet remains; returns that root packet's offset.
    fn build_index_tree(paged_file: &mut StdPagedFile<F>, mut entries: Vec<IndexEntry>) -> Result<u64, E57Error> {
        let mut level = 0u8;
        loop {
            let mut next_level = Vec::new();
            for chunk in entries.chunks(MAX_INDEX_ENTRIES) {
                let packet = IndexPacket::new(level, chunk.to_vec());
                let bytes = packet.to_bytes()?;
                let offset = paged_file.allocate(bytes.len() as u64);
                paged_file.write_at(offset, &bytes)?;
                next_level.push(IndexEntry {
                    chunk_record_number: chunk[0].chunk_record_number,
                    chunk_physical_offset: offset,
                });
            }
            if next_level.len() == 1 {
                return Ok(next_level[0].chunk_physical_offset);
            }
            level += 1;
            entries = next_level;
        }
    }

    /// Flush remaining buffered bits, write the seek index, and patch the
    /// section header with the final record count and lengths. Returns the
    /// total record count; the caller is responsible for writing it back
    /// onto the `CompressedVector` node (this avoids the writer needing to
    /// hold a second, conflicting borrow of the arena across its lifetime).
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<u64, E57Error> {
        if self.closed {
            return Err(E57Error::WriterNotOpen);
        }
        self.seal_packet()?;

        let index_physical_offset = if self.index_entries.is_empty() {
            0
        } else {
            Self::build_index_tree(&mut *self.paged_file, std::mem::take(&mut self.index_entries))?
        };

        let section_logical_length = self.paged_file.next_free_logical() - self.section_start;
        let header = SectionHeader {
            section_id: crate::header::COMPRESSED_VECTOR_SECTION_ID,
            reserved: vec![0; 7],
            section_logical_length,
            data_physical_offset: self.data_start,
            index_physical_offset,
        };
        self.paged_file.write_at(self.section_start, &header.to_bytes()?)?;
        self.paged_file.flush()?;

        self.closed = true;
        debug!(records = self.records_written, index_physical_offset, "closed compressed vector writer");
        Ok(self.records_written)
    }

    /// The `CompressedVector` node this writer is bound to, for the caller
    /// to patch bookkeeping fields on after [`Self::close`].
    pub fn node(&self) -> NodeId {
        self.cv
    }
}
