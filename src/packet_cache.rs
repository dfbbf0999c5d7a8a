//! Fixed-size LRU of resident packet byte buffers (§4.6), keyed by logical
//! offset. A "lock" is simply an `Rc` clone: as long as a caller holds one,
//! the entry's `Rc::strong_count()` exceeds 1 and it is ineligible for
//! eviction. The `lru` crate supplies the backing map; pinning is layered
//! on top since `lru` itself has no notion of it.

use std::io::{Read, Seek, Write};
use std::num::NonZeroUsize;
use std::rc::Rc;

use tracing::trace;

use crate::error::E57Error;
use crate::paged_file::StdPagedFile;

pub struct PacketCache {
    map: lru::LruCache<u64, Rc<Vec<u8>>>,
}

impl PacketCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity.max(1) is never zero");
        PacketCache { map: lru::LruCache::new(cap) }
    }

    /// Return the packet at `offset`, reading it from `paged_file` and
    /// evicting the least-recently-used unlocked entry if the cache is
    /// full. Fails if every resident slot is locked.
    pub fn lock<F: Read + Write + Seek>(
        &mut self,
        paged_file: &mut StdPagedFile<F>,
        offset: u64,
    ) -> Result<Rc<Vec<u8>>, E57Error> {
        if let Some(entry) = self.map.get(&offset) {
            trace!(offset, "packet cache hit");
            return Ok(Rc::clone(entry));
        }
        self.make_room()?;
        trace!(offset, "packet cache miss, reading from paged file");
        let bytes = Rc::new(read_packet(paged_file, offset)?);
        self.map.put(offset, Rc::clone(&bytes));
        Ok(bytes)
    }

    fn make_room(&mut self) -> Result<(), E57Error> {
        if self.map.len() < self.map.cap().get() {
            return Ok(());
        }
        // `iter()` walks most-recently-used first, so the last unlocked
        // entry encountered is the least-recently-used one.
        let victim = self
            .map
            .iter()
            .filter(|(_, rc)| Rc::strong_count(rc) == 1)
            .last()
            .map(|(&k, _)| k);
        match victim {
            Some(k) => {
                self.map.pop(&k);
                Ok(())
            },
            None => Err(E57Error::InternalError(
                "packet cache exhausted: every slot is locked".to_string(),
            )),
        }
    }

    pub fn capacity(&self) -> usize {
        self.map.cap().get()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Packets share a 4-byte prefix (`packet_type`, `flags`/`reserved`,
/// `length_minus1`) regardless of variant, so the total length can be
/// peeked before reading the rest.
pub(crate) fn read_packet<F: Read + Write + Seek>(paged_file: &mut StdPagedFile<F>, offset: u64) -> Result<Vec<u8>, E57Error> {
    let mut head = [0u8; 4];
    paged_file.read_at(offset, &mut head)?;
    let length_minus1 = u16::from_le_bytes([head[2], head[3]]);
    let total_len = length_minus1 as usize + 1;
    let mut bytes = vec![0u8; total_len];
    paged_file.read_at(offset, &mut bytes)?;
    Ok(bytes)
}
