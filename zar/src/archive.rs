//! The high-level interface for reading a zar archive.

use std::{
    fmt,
    num::NonZero,
    sync::{Mutex, PoisonError},
};

use bstr::BStr;
use lru::LruCache;
use positioned_io::{ReadAt, Size};
use sha2::{Digest, Sha256};
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    bisect_range_by,
    format::{self, BLOCK_SIZE, BLOCKS_PER_RECORD, FOOTER_SIZE, Footer, OffsetRecord, TreeEntry},
    path,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from opening or reading an archive.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    InvalidMagic(u32),
    UnsupportedVersion(u32),
    SizeMismatch { stated: u64, actual: u64 },
    SectionBounds(&'static str),
    SectionLimit(&'static str),
    Malformed(&'static str),
    InvalidConfig(&'static str),
    NotAFile,
    CorruptBlock(u64),
    Decompress(u64, std::io::Error),
    HashMismatch,
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::InvalidMagic(magic) => write!(f, "invalid archive magic {magic:#x}"),
            ErrorInner::UnsupportedVersion(ver) => {
                write!(f, "unsupported archive version {ver:#x}")
            }
            ErrorInner::SizeMismatch { stated, actual } => write!(
                f,
                "footer states a total size of {stated} bytes but the file has {actual}"
            ),
            ErrorInner::SectionBounds(what) => {
                write!(f, "{what} section lies outside the file")
            }
            ErrorInner::SectionLimit(what) => write!(f, "{what} section exceeds its size limit"),
            ErrorInner::Malformed(msg) => write!(f, "malformed archive: {msg}"),
            ErrorInner::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            ErrorInner::NotAFile => f.pad("node is not a file"),
            ErrorInner::CorruptBlock(block) => {
                write!(f, "block {block} is out of range or corrupt")
            }
            ErrorInner::Decompress(block, err) => {
                write!(f, "failed to decompress block {block}: {err}")
            }
            ErrorInner::HashMismatch => f.pad("archive integrity hash does not match"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Decompress(_, err) | ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

// Needed for the `Read` impl of `FileReader`.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct Config {
    block_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // 64 x 64KiB blocks.
            block_cache_size: 4 << 20,
        }
    }
}

impl Config {
    /// Set the decompressed block cache capacity in bytes.
    ///
    /// The capacity is rounded up to a whole number of [`BLOCK_SIZE`] slots.
    pub fn block_cache_size(mut self, bytes: usize) -> Self {
        self.block_cache_size = bytes;
        self
    }
}

/// An opaque handle to an entry in an archive's file tree.
///
/// Handles are only meaningful for the [`Archive`] that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(u32);

/// One entry yielded by [`Archive::dir_entry`].
#[derive(Debug, Clone, Copy)]
pub struct DirEntry<'a> {
    /// The entry name, stored verbatim; not guaranteed to be UTF-8.
    pub name: &'a BStr,
    pub is_file: bool,
    pub is_directory: bool,
    /// File length in bytes; zero for directories.
    pub size: u64,
}

struct BlockCache {
    /// LRU cache of block index -> decompressed block. Evicted buffers are
    /// recycled into the incoming block's slot.
    blocks: LruCache<u64, Box<[u8]>>,
    /// Staging buffer for compressed block payloads.
    scratch: Box<[u8]>,
}

/// A read-only, random-access view of a zar archive.
///
/// All file reads go through a fixed-size cache of decompressed blocks
/// guarded by a mutex, so an `Archive` can be shared between threads;
/// lookups and stats touch only immutable state and never contend.
pub struct Archive<R: ?Sized> {
    offset_records: Box<[OffsetRecord]>,
    name_table: Box<[u8]>,
    file_tree: Box<[TreeEntry]>,
    compressed_data_offset: u64,
    compressed_data_size: u64,
    block_count: u64,
    footer: Footer,
    cache: Mutex<BlockCache>,
    rdr: R,
}

impl<R: ?Sized> fmt::Debug for Archive<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("entries", &self.file_tree.len())
            .field("blocks", &self.block_count)
            .field("compressed_data_size", &self.compressed_data_size)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt + Size> Archive<R> {
    /// Open an archive from a random-access stream, typically a
    /// [`std::fs::File`].
    ///
    /// Do not wrap the stream in [`BufReader`][std::io::BufReader]; the
    /// archive has its own block cache.
    pub fn new(rdr: R) -> Result<Self> {
        Self::new_with_config(rdr, &Config::default())
    }

    /// Same as [`Archive::new`] but with a non-default [`Config`].
    pub fn new_with_config(rdr: R, config: &Config) -> Result<Self> {
        let stream_len = rdr
            .size()?
            .ok_or(ErrorInner::Malformed("cannot measure the archive stream"))?;
        Self::open(rdr, stream_len, config)
    }
}

impl<R: ReadAt> Archive<R> {
    fn open(rdr: R, stream_len: u64, config: &Config) -> Result<Self> {
        trace_time!("open archive");

        if stream_len < FOOTER_SIZE as u64 {
            bail!(ErrorInner::Malformed("file is too short for a footer"));
        }
        let mut footer = Footer::new_zeroed();
        rdr.read_exact_at(stream_len - FOOTER_SIZE as u64, footer.as_mut_bytes())?;

        if footer.magic.get() != format::MAGIC {
            bail!(ErrorInner::InvalidMagic(footer.magic.get()));
        }
        if footer.version.get() != format::VERSION {
            bail!(ErrorInner::UnsupportedVersion(footer.version.get()));
        }
        if footer.total_size.get() != stream_len {
            bail!(ErrorInner::SizeMismatch {
                stated: footer.total_size.get(),
                actual: stream_len,
            });
        }
        for (range, what) in [
            (&footer.compressed_data, "compressed data"),
            (&footer.offset_records, "offset records"),
            (&footer.names, "name table"),
            (&footer.file_tree, "file tree"),
            (&footer.meta_directory, "meta directory"),
            (&footer.meta_data, "meta data"),
        ] {
            if !range.fits_within(stream_len) {
                bail!(ErrorInner::SectionBounds(what));
            }
        }
        if footer.offset_records.size.get() > u64::from(u32::MAX) {
            bail!(ErrorInner::SectionLimit("offset records"));
        }
        if footer.names.size.get() > u64::from(format::NAME_OFFSET_NONE) {
            bail!(ErrorInner::SectionLimit("name table"));
        }
        if footer.file_tree.size.get() > u64::from(u32::MAX) {
            bail!(ErrorInner::SectionLimit("file tree"));
        }

        // An archive holding nothing but the empty root directory has no
        // blocks and therefore no offset records; zero is a valid count.
        let records_size = footer.offset_records.size.get();
        if records_size % size_of::<OffsetRecord>() as u64 != 0 {
            bail!(ErrorInner::Malformed(
                "offset record section is not a whole number of records"
            ));
        }
        let record_count = (records_size / size_of::<OffsetRecord>() as u64) as usize;
        let mut offset_records =
            OffsetRecord::new_vec_zeroed(record_count).expect("alloc failed");
        rdr.read_exact_at(
            footer.offset_records.offset.get(),
            offset_records.as_mut_bytes(),
        )?;

        let mut name_table = vec![0u8; footer.names.size.get() as usize];
        rdr.read_exact_at(footer.names.offset.get(), &mut name_table)?;

        let tree_size = footer.file_tree.size.get();
        if tree_size % size_of::<TreeEntry>() as u64 != 0 {
            bail!(ErrorInner::Malformed(
                "file tree section is not a whole number of entries"
            ));
        }
        let entry_count = (tree_size / size_of::<TreeEntry>() as u64) as usize;
        if entry_count == 0 {
            bail!(ErrorInner::Malformed("file tree has no root entry"));
        }
        let mut file_tree = TreeEntry::new_vec_zeroed(entry_count).expect("alloc failed");
        rdr.read_exact_at(footer.file_tree.offset.get(), file_tree.as_mut_bytes())?;

        let root = &file_tree[0];
        if root.is_file() {
            bail!(ErrorInner::Malformed("root entry is not a directory"));
        }
        if root.name_offset() != format::NAME_OFFSET_NONE {
            bail!(ErrorInner::Malformed("root entry has a name"));
        }
        let tree_len = file_tree.len() as u64;
        for ent in &file_tree {
            if !ent.is_file()
                && u64::from(ent.dir_start()) + u64::from(ent.dir_count()) > tree_len
            {
                bail!(ErrorInner::Malformed(
                    "directory child range exceeds the file tree"
                ));
            }
        }

        let cache_slots = NonZero::new(config.block_cache_size.div_ceil(BLOCK_SIZE))
            .ok_or(ErrorInner::InvalidConfig(
                "block cache must hold at least one block",
            ))?;

        Ok(Self {
            offset_records: offset_records.into_boxed_slice(),
            name_table: name_table.into_boxed_slice(),
            file_tree: file_tree.into_boxed_slice(),
            compressed_data_offset: footer.compressed_data.offset.get(),
            compressed_data_size: footer.compressed_data.size.get(),
            block_count: record_count as u64 * BLOCKS_PER_RECORD as u64,
            footer,
            cache: Mutex::new(BlockCache {
                blocks: LruCache::new(cache_slots),
                scratch: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            }),
            rdr,
        })
    }
}

impl<R: ?Sized> Archive<R> {
    /// The handle of the root directory.
    pub fn root(&self) -> NodeHandle {
        NodeHandle(0)
    }

    fn entry(&self, handle: NodeHandle) -> Option<&TreeEntry> {
        self.file_tree.get(handle.0 as usize)
    }

    fn name_at(&self, offset: u32) -> Option<&BStr> {
        format::name_at(&self.name_table, offset).map(BStr::new)
    }

    pub fn is_file(&self, handle: NodeHandle) -> bool {
        self.entry(handle).is_some_and(TreeEntry::is_file)
    }

    pub fn is_dir(&self, handle: NodeHandle) -> bool {
        self.entry(handle).is_some_and(|ent| !ent.is_file())
    }

    /// The byte length of a file; `None` for directories and stale handles.
    pub fn file_size(&self, handle: NodeHandle) -> Option<u64> {
        let ent = self.entry(handle)?;
        ent.is_file().then(|| ent.file_size())
    }

    /// Resolve a path from the root to a node of either kind.
    ///
    /// Separator runs are skipped, so `"a/b"`, `"/a//b"` and `"a\\b"` name
    /// the same node, and the empty path resolves to the root. Matching is
    /// ASCII case-insensitive. Children are stored sorted, so each segment
    /// is a binary search.
    pub fn lookup(&self, archive_path: impl AsRef<[u8]>) -> Option<NodeHandle> {
        self.lookup_inner(archive_path.as_ref())
    }

    fn lookup_inner(&self, archive_path: &[u8]) -> Option<NodeHandle> {
        let mut cur = 0u32;
        for seg in path::segments(archive_path) {
            let ent = &self.file_tree[cur as usize];
            if ent.is_file() {
                // Trying to descend into a file.
                return None;
            }
            let start = ent.dir_start() as usize;
            let end = start + ent.dir_count() as usize;
            let idx = bisect_range_by(start..end, |i| {
                let name = self
                    .name_at(self.file_tree[i].name_offset())
                    .unwrap_or(BStr::new(""));
                path::cmp_names(name, seg)
            })?;
            cur = idx as u32;
        }
        Some(NodeHandle(cur))
    }

    /// Like [`Archive::lookup`] but only succeeds for files.
    pub fn lookup_file(&self, archive_path: impl AsRef<[u8]>) -> Option<NodeHandle> {
        let handle = self.lookup(archive_path)?;
        self.is_file(handle).then_some(handle)
    }

    /// Like [`Archive::lookup`] but only succeeds for directories.
    pub fn lookup_dir(&self, archive_path: impl AsRef<[u8]>) -> Option<NodeHandle> {
        let handle = self.lookup(archive_path)?;
        self.is_dir(handle).then_some(handle)
    }

    /// The number of children of a directory; zero for files and stale
    /// handles.
    pub fn dir_entry_count(&self, handle: NodeHandle) -> u32 {
        self.entry(handle)
            .map_or(0, |ent| if ent.is_file() { 0 } else { ent.dir_count() })
    }

    /// The `index`-th child of a directory, in ascending case-insensitive
    /// name order.
    pub fn dir_entry(&self, handle: NodeHandle, index: u32) -> Option<DirEntry<'_>> {
        let dir = self.entry(handle)?;
        if dir.is_file() || index >= dir.dir_count() {
            return None;
        }
        let ent = &self.file_tree[(dir.dir_start() + index) as usize];
        let name = self.name_at(ent.name_offset())?;
        if name.is_empty() {
            return None;
        }
        Some(DirEntry {
            name,
            is_file: ent.is_file(),
            is_directory: !ent.is_file(),
            size: if ent.is_file() { ent.file_size() } else { 0 },
        })
    }

    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rdr
    }

    pub fn into_inner(self) -> R
    where
        R: Sized,
    {
        self.rdr
    }
}

impl<R: ReadAt + ?Sized> Archive<R> {
    /// Read up to `buf.len()` bytes of a file starting at `offset`.
    ///
    /// The read is clamped to the file length; `Ok(0)` means `offset` is at
    /// or past the end. Fails for directory or stale handles and when a
    /// block cannot be loaded; no partial count is reported in that case.
    ///
    /// Reads from different threads are serialised on the internal cache
    /// lock.
    pub fn read_at(&self, handle: NodeHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let ent = self.entry(handle).ok_or(ErrorInner::NotAFile)?;
        if !ent.is_file() {
            bail!(ErrorInner::NotAFile);
        }
        let file_size = ent.file_size();
        if offset >= file_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(file_size - offset) as usize;
        let buf = &mut buf[..len];

        let mut guard = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let mut raw_offset = ent.file_offset() + offset;
        let mut copied = 0;
        while copied < len {
            let block = raw_offset / BLOCK_SIZE as u64;
            let intra = (raw_offset % BLOCK_SIZE as u64) as usize;
            let step = (len - copied).min(BLOCK_SIZE - intra);
            let slot = self.cached_block(state, block)?;
            buf[copied..copied + step].copy_from_slice(&slot[intra..intra + step]);
            raw_offset += step as u64;
            copied += step;
        }
        Ok(len)
    }

    /// Get a [`std::io::Read`] adapter over a file's content; `None` for
    /// directory or stale handles.
    pub fn file_reader(&self, handle: NodeHandle) -> Option<FileReader<'_, R>> {
        self.is_file(handle).then_some(FileReader {
            archive: self,
            handle,
            pos: 0,
        })
    }

    /// Look up a block in the cache, loading and caching it on a miss, and
    /// return its decompressed bytes.
    fn cached_block<'c>(&self, state: &'c mut BlockCache, block: u64) -> Result<&'c [u8]> {
        // NB. `get` promotes the block to most-recently-used.
        if state.blocks.contains(&block) {
            trace!("block {block}: cache hit");
        } else {
            self.load_block(state, block)?;
        }
        let data = state.blocks.get(&block).expect("cache is not empty");
        Ok(data)
    }

    fn load_block(&self, state: &mut BlockCache, block: u64) -> Result<()> {
        trace_time!("block {block}: cache miss");

        if block >= self.block_count {
            bail!(ErrorInner::CorruptBlock(block));
        }
        let record = &self.offset_records[(block / BLOCKS_PER_RECORD as u64) as usize];
        let sub = (block % BLOCKS_PER_RECORD as u64) as usize;
        let (offset, compressed_size) = record
            .block_location(sub)
            .ok_or(ErrorInner::CorruptBlock(block))?;
        let end = offset
            .checked_add(compressed_size as u64)
            .ok_or(ErrorInner::CorruptBlock(block))?;
        if end > self.compressed_data_size {
            bail!(ErrorInner::CorruptBlock(block));
        }
        // In bounds of the compressed-data section, which was itself bounds
        // checked against the file at open, so this cannot overflow.
        let file_offset = self.compressed_data_offset + offset;

        // Recycle the least-recently-used slot once the cache is full.
        let mut slot = if state.blocks.len() == state.blocks.cap().get() {
            state.blocks.pop_lru().expect("cache is full").1
        } else {
            vec![0u8; BLOCK_SIZE].into_boxed_slice()
        };

        // Any failure below leaves the block uncached; the stale entry was
        // already evicted above.
        if compressed_size == BLOCK_SIZE {
            // Stored verbatim; read straight into the slot.
            self.rdr.read_exact_at(file_offset, &mut slot)?;
        } else {
            let scratch = &mut state.scratch[..compressed_size];
            self.rdr.read_exact_at(file_offset, scratch)?;
            let n = zstd::bulk::decompress_to_buffer(scratch, &mut slot)
                .map_err(|err| ErrorInner::Decompress(block, err))?;
            if n != BLOCK_SIZE {
                bail!(ErrorInner::CorruptBlock(block));
            }
        }
        state.blocks.push(block, slot);
        Ok(())
    }

    /// Recompute the whole-file SHA-256 (with the footer's hash field zeroed)
    /// and compare it against the stored integrity hash.
    pub fn verify_integrity(&self) -> Result<()> {
        trace_time!("verify archive integrity");

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BLOCK_SIZE];
        let body_len = self.footer.total_size.get() - FOOTER_SIZE as u64;
        let mut pos = 0u64;
        while pos < body_len {
            let step = (body_len - pos).min(buf.len() as u64) as usize;
            self.rdr.read_exact_at(pos, &mut buf[..step])?;
            hasher.update(&buf[..step]);
            pos += step as u64;
        }
        let mut footer = self.footer;
        footer.integrity_hash = [0u8; 32];
        hasher.update(footer.as_bytes());
        if hasher.finalize()[..] != self.footer.integrity_hash {
            bail!(ErrorInner::HashMismatch);
        }
        Ok(())
    }
}

/// A [`std::io::Read`] adapter returned by [`Archive::file_reader`].
pub struct FileReader<'a, R: ?Sized> {
    archive: &'a Archive<R>,
    handle: NodeHandle,
    pos: u64,
}

impl<R: ?Sized> fmt::Debug for FileReader<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("handle", &self.handle)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt + ?Sized> std::io::Read for FileReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.archive.read_at(self.handle, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}
