//! Checksummed logical read/write over an arbitrary `Read + Write + Seek`
//! backing store, plus the bump-pointer "next free logical byte" allocator.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::{debug, instrument, trace};

use crate::error::E57Error;

/// `Sparse` checksums every `SPARSE_CHECKSUM_STRIDE`th page.
pub const SPARSE_CHECKSUM_STRIDE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadChecksumPolicy {
    Never,
    Sparse,
    All,
}

/// Logical offsets map 1:1 onto a computable physical layout: each page of
/// `page_size` bytes is optionally followed by a 4-byte `crc32fast` trailer,
/// per [`ReadChecksumPolicy`]. No remapping or compaction is implemented —
/// that would be an allocator concern beyond this crate's scope.
pub struct StdPagedFile<F> {
    inner: F,
    page_size: u64,
    policy: ReadChecksumPolicy,
    next_free_logical: u64,
}

impl<F: Read + Write + Seek> StdPagedFile<F> {
    pub fn new(inner: F, page_size: u32, policy: ReadChecksumPolicy) -> Result<Self, E57Error> {
        if page_size < 1024 || page_size % 1024 != 0 {
            return Err(E57Error::InternalError(format!(
                "page size {page_size} must be a multiple of 1024 and >= 1024"
            )));
        }
        Ok(StdPagedFile {
            inner,
            page_size: page_size as u64,
            policy,
            next_free_logical: 0,
        })
    }

    /// Reopen over a file whose allocator cursor is already at
    /// `next_free_logical` (read back from the file header on open).
    pub fn with_cursor(mut self, next_free_logical: u64) -> Self {
        self.next_free_logical = next_free_logical;
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    pub fn next_free_logical(&self) -> u64 {
        self.next_free_logical
    }

    /// Bump-pointer allocation: reserves `len` logical bytes and returns
    /// the logical offset of the first one.
    pub fn allocate(&mut self, len: u64) -> u64 {
        let start = self.next_free_logical;
        self.next_free_logical += len;
        start
    }

    fn page_index(&self, logical_offset: u64) -> u64 {
        logical_offset / self.page_size
    }

    fn is_checksummed_page(&self, page: u64) -> bool {
        match self.policy {
            ReadChecksumPolicy::Never => false,
            ReadChecksumPolicy::All => true,
            ReadChecksumPolicy::Sparse => page % SPARSE_CHECKSUM_STRIDE == SPARSE_CHECKSUM_STRIDE - 1,
        }
    }

    fn checksummed_pages_before(&self, page: u64) -> u64 {
        match self.policy {
            ReadChecksumPolicy::Sparse => page / SPARSE_CHECKSUM_STRIDE,
            ReadChecksumPolicy::All => page,
            ReadChecksumPolicy::Never => 0,
        }
    }

    fn physical_page_start(&self, page: u64) -> u64 {
        let trailer_bytes = match self.policy {
            ReadChecksumPolicy::Never => 0,
            _ => 4 * self.checksummed_pages_before(page),
        };
        page * self.page_size + trailer_bytes
    }

    #[instrument(skip(self, buf))]
    pub fn read_at(&mut self, logical_offset: u64, buf: &mut [u8]) -> Result<(), E57Error> {
        let mut read = 0usize;
        while read < buf.len() {
            let logical = logical_offset + read as u64;
            let page = self.page_index(logical);
            let offset_in_page = (logical - page * self.page_size) as usize;
            let take = (self.page_size as usize - offset_in_page).min(buf.len() - read);
            let physical_page_start = self.physical_page_start(page);

            let verify = match self.policy {
                ReadChecksumPolicy::Never => false,
                ReadChecksumPolicy::Sparse => self.is_checksummed_page(page),
                ReadChecksumPolicy::All => true,
            };

            if verify {
                let mut content = vec![0u8; self.page_size as usize];
                self.inner.seek(SeekFrom::Start(physical_page_start)).map_err(E57Error::FileRead)?;
                self.inner.read_exact(&mut content).map_err(E57Error::FileRead)?;
                let mut trailer = [0u8; 4];
                self.inner.read_exact(&mut trailer).map_err(E57Error::FileRead)?;
                let expected = u32::from_le_bytes(trailer);
                let actual = crc32fast::hash(&content);
                if actual != expected {
                    return Err(E57Error::ChecksumMismatch { offset: logical });
                }
                buf[read..read + take].copy_from_slice(&content[offset_in_page..offset_in_page + take]);
            } else {
                self.inner
                    .seek(SeekFrom::Start(physical_page_start + offset_in_page as u64))
                    .map_err(E57Error::FileRead)?;
                self.inner.read_exact(&mut buf[read..read + take]).map_err(E57Error::FileRead)?;
            }
            trace!(logical, take, page, "read page slice");
            read += take;
        }
        Ok(())
    }

    #[instrument(skip(self, buf))]
    pub fn write_at(&mut self, logical_offset: u64, buf: &[u8]) -> Result<(), E57Error> {
        let mut written = 0usize;
        while written < buf.len() {
            let logical = logical_offset + written as u64;
            let page = self.page_index(logical);
            let offset_in_page = (logical - page * self.page_size) as usize;
            let take = (self.page_size as usize - offset_in_page).min(buf.len() - written);
            let physical_page_start = self.physical_page_start(page);

            self.inner
                .seek(SeekFrom::Start(physical_page_start + offset_in_page as u64))
                .map_err(E57Error::FileWrite)?;
            self.inner.write_all(&buf[written..written + take]).map_err(E57Error::FileWrite)?;

            if self.is_checksummed_page(page) {
                self.rewrite_page_checksum(page, physical_page_start)?;
            }
            trace!(logical, take, page, "wrote page slice");
            written += take;
        }
        Ok(())
    }

    fn rewrite_page_checksum(&mut self, page: u64, physical_page_start: u64) -> Result<(), E57Error> {
        let mut content = vec![0u8; self.page_size as usize];
        self.inner.seek(SeekFrom::Start(physical_page_start)).map_err(E57Error::FileWrite)?;
        read_best_effort(&mut self.inner, &mut content).map_err(E57Error::FileWrite)?;
        let checksum = crc32fast::hash(&content);
        self.inner
            .seek(SeekFrom::Start(physical_page_start + self.page_size))
            .map_err(E57Error::FileWrite)?;
        self.inner.write_all(&checksum.to_le_bytes()).map_err(E57Error::FileWrite)?;
        debug!(page, checksum, "rewrote page checksum trailer");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), E57Error> {
        self.inner.flush().map_err(E57Error::FileWrite)?;
        Ok(())
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

fn read_best_effort(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
