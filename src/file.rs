//! `E57File` (§3.2, §5): the top-level entity owning one open file's
//! metadata tree, namespace registry, and underlying [`StdPagedFile`].
//!
//! Mirrors the teacher's `Squashfs::{from_reader, to_bytes}` lifecycle: a
//! `from_reader`-style constructor that reads every field needed to work
//! with the file in memory, and a `to_bytes`-style writer that serializes
//! an up-to-date on-disk image. Here that lifecycle is split into
//! `open`/`create` and `close`, since this format additionally supports
//! incremental binary-section writes between the two.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};

use deku::{DekuContainerRead, DekuContainerWrite};
use tracing::{debug, info, instrument};

use crate::binding::BufferBinding;
use crate::compressed_vector::{CompressedVectorReader, CompressedVectorWriter};
use crate::error::E57Error;
use crate::header::{FileHeader, CURRENT_MAJOR_VERSION, CURRENT_MINOR_VERSION, FILE_SIGNATURE};
use crate::node::{Arena, NodeData, NodeId};
use crate::packet_cache::PacketCache;
use crate::paged_file::{ReadChecksumPolicy, StdPagedFile};
use crate::xml;

pub const DEFAULT_PAGE_SIZE: u32 = 1024;
const DEFAULT_CACHE_CAPACITY: usize = 8;

/// An open E57-like container: the typed metadata tree, its namespace
/// registry, and the paged backing store. Single-threaded, single-writer
/// per §5 — `writer_open` is a plain `bool`, not a `Mutex`, matching the
/// Non-goal that rules out cross-thread sharing of one open file.
pub struct E57File<F> {
    arena: Arena,
    paged_file: StdPagedFile<F>,
    cache: RefCell<PacketCache>,
    namespaces: Vec<(String, String)>,
    xml_physical_offset: u64,
    xml_logical_length: u64,
    writer_open: bool,
}

impl<F: Read + Write + Seek> E57File<F> {
    /// Create a fresh, empty file over `inner`: reserves header space and
    /// starts the metadata tree at an empty root Structure. Nothing else is
    /// written until [`Self::close`].
    pub fn create(inner: F, page_size: u32) -> Result<Self, E57Error> {
        Self::create_with_policy(inner, page_size, ReadChecksumPolicy::Sparse)
    }

    #[instrument(skip(inner))]
    pub fn create_with_policy(inner: F, page_size: u32, policy: ReadChecksumPolicy) -> Result<Self, E57Error> {
        let mut paged_file = StdPagedFile::new(inner, page_size, policy)?;
        let header_bytes = FileHeader::new(page_size as u64).to_bytes()?;
        let header_start = paged_file.allocate(header_bytes.len() as u64);
        paged_file.write_at(header_start, &header_bytes)?;

        info!(page_size, "created new file");
        Ok(E57File {
            arena: Arena::new(),
            paged_file,
            cache: RefCell::new(PacketCache::new(DEFAULT_CACHE_CAPACITY)),
            namespaces: Vec::new(),
            xml_physical_offset: 0,
            xml_logical_length: 0,
            writer_open: false,
        })
    }

    /// Open an existing file: reads the header, restores the allocator
    /// cursor, and parses the XML metadata tree at `xmlPhysicalOffset`.
    pub fn open(inner: F) -> Result<Self, E57Error> {
        Self::open_with_policy(inner, ReadChecksumPolicy::Sparse)
    }

    #[instrument(skip(inner))]
    pub fn open_with_policy(mut inner: F, policy: ReadChecksumPolicy) -> Result<Self, E57Error> {
        // The header always starts at physical offset 0 regardless of page
        // size or checksum policy, so it can be read directly without a
        // `StdPagedFile` (which needs the header's own `page_size` field to
        // compute physical offsets for anything past page 0).
        let header_len = FileHeader::new(DEFAULT_PAGE_SIZE as u64).to_bytes()?.len();
        let mut header_bytes = vec![0u8; header_len];
        inner.seek(SeekFrom::Start(0)).map_err(E57Error::FileOpen)?;
        inner.read_exact(&mut header_bytes).map_err(E57Error::FileOpen)?;
        let (_, header) = FileHeader::from_bytes((&header_bytes, 0))?;
        if header.signature != FILE_SIGNATURE {
            return Err(E57Error::BadFileSignature);
        }
        header.check_supported_version()?;
        debug!(?header, "read file header");

        let mut paged_file =
            StdPagedFile::new(inner, header.page_size as u32, policy)?.with_cursor(header.file_physical_length);

        let mut xml_bytes = vec![0u8; header.xml_logical_length as usize];
        paged_file.read_at(header.xml_physical_offset, &mut xml_bytes)?;
        let (arena, _root) = xml::from_reader(xml_bytes.as_slice())?;

        info!(records = arena.prototype_leaves(arena.root()).len(), "opened file, parsed metadata tree");
        Ok(E57File {
            arena,
            paged_file,
            cache: RefCell::new(PacketCache::new(DEFAULT_CACHE_CAPACITY)),
            namespaces: Vec::new(),
            xml_physical_offset: header.xml_physical_offset,
            xml_logical_length: header.xml_logical_length,
            writer_open: false,
        })
    }

    /// Commit: serialize the metadata tree to a fresh XML section, patch
    /// the file header, flush, and return the backing store.
    #[instrument(skip(self))]
    pub fn close(mut self) -> Result<F, E57Error> {
        if self.writer_open {
            return Err(E57Error::InternalError("a writer is still open on this file".to_string()));
        }

        let mut xml_bytes = Vec::new();
        xml::to_writer(&self.arena, self.arena.root(), &mut xml_bytes)?;
        let xml_offset = self.paged_file.allocate(xml_bytes.len() as u64);
        self.paged_file.write_at(xml_offset, &xml_bytes)?;
        self.xml_physical_offset = xml_offset;
        self.xml_logical_length = xml_bytes.len() as u64;

        let header = FileHeader {
            signature: FILE_SIGNATURE,
            major_version: CURRENT_MAJOR_VERSION,
            minor_version: CURRENT_MINOR_VERSION,
            file_physical_length: self.paged_file.next_free_logical(),
            xml_physical_offset: xml_offset,
            xml_logical_length: xml_bytes.len() as u64,
            page_size: self.paged_file.page_size() as u64,
        };
        self.paged_file.write_at(0, &header.to_bytes()?)?;
        self.paged_file.flush()?;

        debug!(xml_offset, xml_len = xml_bytes.len(), "closed file, wrote metadata tree");
        Ok(self.paged_file.into_inner())
    }

    /// Discard every write made this session: the header and XML are never
    /// rewritten, so any sections appended since `open`/`create` are simply
    /// unreferenced tail bytes past the last committed `file_physical_length`
    /// — the file reads back exactly as it did before this session (§5).
    pub fn cancel(self) -> F {
        self.paged_file.into_inner()
    }

    pub fn root(&self) -> NodeId {
        self.arena.root()
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn get(&self, path: &str) -> Result<NodeId, E57Error> {
        self.arena.get(self.arena.root(), path)
    }

    pub fn set(&mut self, path: &str, data: NodeData, auto_path_create: bool) -> Result<NodeId, E57Error> {
        let root = self.arena.root();
        self.arena.set(root, path, data, auto_path_create)
    }

    pub fn is_defined(&self, path: &str) -> bool {
        self.arena.is_defined(self.arena.root(), path)
    }

    /// Register an extension namespace prefix/URI pair; both directions
    /// must be unique across the registry (§3.2).
    pub fn register_namespace(&mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Result<(), E57Error> {
        let prefix = prefix.into();
        let uri = uri.into();
        if self.namespaces.iter().any(|(p, u)| *p == prefix || *u == uri) {
            return Err(E57Error::AlreadyDefined(format!("namespace {prefix}={uri}")));
        }
        self.namespaces.push((prefix, uri));
        Ok(())
    }

    pub fn namespaces(&self) -> &[(String, String)] {
        &self.namespaces
    }

    /// Open a writer bound to `cv`, taking exclusive use of the file's
    /// allocator until the returned writer is closed and [`Self::finish_write`]
    /// is called (§5: at most one writer may be active per file).
    #[instrument(skip(self, bindings))]
    pub fn open_writer<'a>(
        &'a mut self,
        cv: NodeId,
        bindings: Vec<BufferBinding<'a>>,
    ) -> Result<CompressedVectorWriter<'a, F>, E57Error> {
        if self.writer_open {
            return Err(E57Error::InternalError("a writer is already open on this file".to_string()));
        }
        self.writer_open = true;
        CompressedVectorWriter::new(&mut self.arena, cv, &mut self.paged_file, bindings)
    }

    /// Patch `node`'s record count after a writer returned by
    /// [`Self::open_writer`] has been closed and dropped, and release the
    /// single-writer slot. The writer can't do this itself: its `close()`
    /// can't take `&mut Arena` without tying its lifetime to the whole
    /// `&mut self`, which would make this very call unreachable while the
    /// writer was still alive.
    pub fn finish_write(&mut self, node: NodeId, record_count: u64) {
        if let NodeData::CompressedVector(c) = self.arena.data_mut(node) {
            c.record_count = record_count;
        }
        self.writer_open = false;
    }

    /// Open a reader bound to `cv`. Readers share this file's `PacketCache`
    /// through a `RefCell` (§5); only one reader or writer handle may be
    /// checked out from one `E57File` value at a time, since both borrow
    /// `&mut self` for their lifetime.
    #[instrument(skip(self, bindings))]
    pub fn open_reader<'a>(
        &'a mut self,
        cv: NodeId,
        bindings: Vec<BufferBinding<'a>>,
    ) -> Result<CompressedVectorReader<'a, F>, E57Error> {
        CompressedVectorReader::new(&self.arena, cv, &mut self.paged_file, &self.cache, bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::MemoryRepresentation;
    use crate::node::Precision;
    use std::io::Cursor;

    fn new_cursor_file() -> Cursor<Vec<u8>> {
        Cursor::new(Vec::new())
    }

    #[test]
    fn create_set_close_reopen_round_trips_tree() {
        let file = E57File::create(new_cursor_file(), DEFAULT_PAGE_SIZE).unwrap();
        let mut file = file;
        file.set("/count", NodeData::Integer(crate::node::IntegerData { value: 7, min: 0, max: 10 }), true)
            .unwrap();
        let inner = file.close().unwrap();

        let reopened = E57File::open(inner).unwrap();
        let found = reopened.get("/count").unwrap();
        match reopened.arena().data(found) {
            NodeData::Integer(i) => assert_eq!(i.value, 7),
            _ => panic!("expected integer"),
        }
    }

    #[test]
    fn reopening_a_writer_before_finish_write_is_rejected() {
        let mut file = E57File::create(new_cursor_file(), DEFAULT_PAGE_SIZE).unwrap();
        let proto = file.arena_mut().new_structure();
        let field = file.arena_mut().new_integer(0, 0, 255).unwrap();
        file.arena_mut().adopt(proto, "a".into(), field).unwrap();
        let codecs = file.arena_mut().new_vector(true);
        let cv = file.arena_mut().new_compressed_vector(proto, codecs).unwrap();
        let root = file.root();
        file.arena_mut().adopt(root, "points".into(), cv).unwrap();

        let mut data = [1i64];
        let binding = BufferBinding::new("a", MemoryRepresentation::I64(&mut data), 1).unwrap();
        let mut writer = file.open_writer(cv, vec![binding]).unwrap();
        writer.close().unwrap();
        // The borrow checker alone would allow a second `open_writer` here
        // once `writer` is dropped; the `writer_open` flag is what still
        // blocks it until `finish_write` acknowledges the first one.
        drop(writer);

        let mut data2 = [1i64];
        let binding2 = BufferBinding::new("a", MemoryRepresentation::I64(&mut data2), 1).unwrap();
        let err = file.open_writer(cv, vec![binding2]).unwrap_err();
        assert!(matches!(err, E57Error::InternalError(_)));
    }

    #[test]
    fn write_then_read_back_compressed_vector_through_file() {
        let mut file = E57File::create(new_cursor_file(), DEFAULT_PAGE_SIZE).unwrap();
        let proto = file.arena_mut().new_structure();
        let field = file.arena_mut().new_integer(0, 0, 1_000_000).unwrap();
        file.arena_mut().adopt(proto, "intensity".into(), field).unwrap();
        let codecs = file.arena_mut().new_vector(true);
        let cv = file.arena_mut().new_compressed_vector(proto, codecs).unwrap();
        let root = file.root();
        file.arena_mut().adopt(root, "points".into(), cv).unwrap();

        let values: Vec<i64> = (0..2000).collect();
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

        let mut out = vec![0i64; values.len()];
        {
            let binding = BufferBinding::new("intensity", MemoryRepresentation::I64(&mut out), 1).unwrap();
            let mut reader = file.open_reader(cv, vec![binding]).unwrap();
            let n = reader.read(values.len()).unwrap();
            assert_eq!(n, values.len());
        }
        assert_eq!(out, values);
    }

    #[test]
    fn register_namespace_rejects_prefix_or_uri_collision() {
        let mut file = E57File::create(new_cursor_file(), DEFAULT_PAGE_SIZE).unwrap();
        file.register_namespace("ext", "http://example.com/ext").unwrap();
        assert!(file.register_namespace("ext", "http://example.com/other").is_err());
        assert!(file.register_namespace("ext2", "http://example.com/ext").is_err());
    }

    #[test]
    fn cancel_discards_changes_made_since_the_last_close() {
        let mut file = E57File::create(new_cursor_file(), DEFAULT_PAGE_SIZE).unwrap();
        file.set("/a", NodeData::Integer(crate::node::IntegerData { value: 1, min: 0, max: 1 }), true).unwrap();
        let inner = file.close().unwrap();

        let mut file2 = E57File::open(inner).unwrap();
        file2.set("/b", NodeData::Integer(crate::node::IntegerData { value: 2, min: 0, max: 2 }), true).unwrap();
        let inner2 = file2.cancel();

        let reopened = E57File::open(inner2).unwrap();
        assert!(reopened.is_defined("/a"));
        assert!(!reopened.is_defined("/b"));
        let _ = Precision::Double;
    }
}
