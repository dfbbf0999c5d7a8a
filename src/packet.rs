//! Data/index/empty packet framing (§3.3). Every packet is at most 64 KiB;
//! `length_minus1` stores `total_length - 1` so the full 65536-byte case
//! still fits in 16 bits.

use deku::prelude::*;

pub const DATA_PACKET_TYPE: u8 = 1;
pub const INDEX_PACKET_TYPE: u8 = 0;
pub const EMPTY_PACKET_TYPE: u8 = 2;

pub const MAX_PACKET_LEN: usize = 65536;
pub const MAX_INDEX_ENTRIES: usize = 2048;

/// Header bytes common to a `DataPacket` before its per-stream chunks.
const DATA_PACKET_HEADER_LEN: usize = 1 + 1 + 2 + 2;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ByteStreamChunk {
    pub length: u16,
    #[deku(count = "length")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DataPacket {
    #[deku(assert_eq = "DATA_PACKET_TYPE")]
    pub packet_type: u8,
    pub flags: u8,
    pub length_minus1: u16,
    pub bytestream_count: u16,
    #[deku(count = "bytestream_count")]
    pub streams: Vec<ByteStreamChunk>,
}

impl DataPacket {
    pub fn new(streams: Vec<Vec<u8>>) -> Self {
        let total_len = Self::encoded_len(&streams);
        DataPacket {
            packet_type: DATA_PACKET_TYPE,
            flags: 0,
            length_minus1: (total_len - 1) as u16,
            bytestream_count: streams.len() as u16,
            streams: streams
                .into_iter()
                .map(|payload| ByteStreamChunk { length: payload.len() as u16, payload })
                .collect(),
        }
    }

    /// Total encoded length a `DataPacket` built from `streams` would have,
    /// without needing to actually serialize it first. Used to decide when
    /// a packet should be sealed (§4.4).
    pub fn encoded_len(streams: &[Vec<u8>]) -> usize {
        DATA_PACKET_HEADER_LEN + streams.iter().map(|s| 2 + s.len()).sum::<usize>()
    }

    /// Same prediction as [`Self::encoded_len`], from staged byte counts
    /// rather than the bytes themselves.
    pub fn encoded_len_from_lens(lens: &[usize]) -> usize {
        DATA_PACKET_HEADER_LEN + lens.iter().map(|l| 2 + l).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct IndexEntry {
    pub chunk_record_number: u64,
    pub chunk_physical_offset: u64,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct IndexPacket {
    #[deku(assert_eq = "INDEX_PACKET_TYPE")]
    pub packet_type: u8,
    pub flags: u8,
    pub length_minus1: u16,
    pub entry_count: u16,
    pub index_level: u8,
    #[deku(count = "9")]
    pub reserved: Vec<u8>,
    #[deku(count = "entry_count")]
    pub entries: Vec<IndexEntry>,
}

impl IndexPacket {
    pub fn new(index_level: u8, entries: Vec<IndexEntry>) -> Self {
        assert!(entries.len() <= MAX_INDEX_ENTRIES, "index packet entry count overflow");
        let header_len = 1 + 1 + 2 + 2 + 1 + 9;
        let total_len = header_len + entries.len() * 16;
        IndexPacket {
            packet_type: INDEX_PACKET_TYPE,
            flags: 0,
            length_minus1: (total_len - 1) as u16,
            entry_count: entries.len() as u16,
            index_level,
            reserved: vec![0; 9],
            entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EmptyPacket {
    #[deku(assert_eq = "EMPTY_PACKET_TYPE")]
    pub packet_type: u8,
    pub reserved: u8,
    pub length_minus1: u16,
    #[deku(count = "length_minus1 as usize + 1 - 4")]
    pub padding: Vec<u8>,
}

impl EmptyPacket {
    pub fn new(total_len: usize) -> Self {
        assert!((4..=MAX_PACKET_LEN).contains(&total_len), "empty packet length out of range");
        EmptyPacket {
            packet_type: EMPTY_PACKET_TYPE,
            reserved: 0,
            length_minus1: (total_len - 1) as u16,
            padding: vec![0; total_len - 4],
        }
    }
}
