//! On-disk records of the zar format.
//!
//! An archive is laid out top to bottom as: the compressed data stream, the
//! offset records, the name table, the file tree, two reserved metadata
//! sections, and the [`Footer`]. The footer is always the trailing
//! [`FOOTER_SIZE`] bytes of the file and locates every other section.
//!
//! All multi-byte integers are big-endian regardless of host, so every record
//! here is a `zerocopy` struct over [`zerocopy::big_endian`] integers and can
//! be loaded and stored as raw bytes.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, big_endian as be};

/// The size of one uncompressed block of file data.
///
/// The data stream is sliced into blocks of exactly this size; the final
/// block is zero-padded up to it.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// The number of consecutive blocks covered by one [`OffsetRecord`].
pub const BLOCKS_PER_RECORD: usize = 16;

/// Footer magic.
pub const MAGIC: u32 = 0x169f_52d6;

/// Format version, also acting as an extended magic.
pub const VERSION: u32 = 0x61bf_3a01;

/// The name-table offset marking "no name"; used by the root entry.
pub const NAME_OFFSET_NONE: u32 = 0x7FFF_FFFF;

/// The longest representable entry name. Longer names are truncated.
pub const NAME_LEN_MAX: usize = 0x7FFF;

const FILE_FLAG: u32 = 0x8000_0000;

/// A section descriptor in the [`Footer`]: absolute byte offset plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SectionRange {
    pub offset: be::U64,
    pub size: be::U64,
}

impl SectionRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset: offset.into(),
            size: size.into(),
        }
    }

    /// Check that the whole range lies inside a file of `file_size` bytes.
    pub fn fits_within(&self, file_size: u64) -> bool {
        self.offset
            .get()
            .checked_add(self.size.get())
            .is_some_and(|end| end <= file_size)
    }
}

/// Sparse index entry covering [`BLOCKS_PER_RECORD`] consecutive blocks.
///
/// `base_offset` is the absolute byte offset of the first covered block
/// within the compressed-data section. Each `sizes[i]` holds the on-disk
/// length of block `i` minus one, so a full 64 KiB stored block fits in 16
/// bits. The position of sub-block `k` is `base_offset + Σ_{i<k}(sizes[i]+1)`.
/// The final record of an archive is stored in full with unused trailing
/// entries zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OffsetRecord {
    pub base_offset: be::U64,
    pub sizes: [be::U16; BLOCKS_PER_RECORD],
}

impl OffsetRecord {
    /// Resolve the section-relative offset and on-disk length of sub-block
    /// `sub` of this record.
    ///
    /// Returns `None` when the accumulated offset overflows; only a corrupt
    /// record can trigger that.
    pub fn block_location(&self, sub: usize) -> Option<(u64, usize)> {
        let mut offset = self.base_offset.get();
        for size in &self.sizes[..sub] {
            offset = offset.checked_add(u64::from(size.get()) + 1)?;
        }
        Some((offset, usize::from(self.sizes[sub].get()) + 1))
    }
}

/// A fixed 16-byte entry of the file tree.
///
/// The MSB of `name_offset_and_kind` distinguishes files from directories;
/// the low 31 bits are the byte offset of the entry's name in the name table
/// ([`NAME_OFFSET_NONE`] for the unnamed root). The remaining three words are
/// a file record (offset low, size low, packed high 16-bit extensions) or a
/// directory record (first child index, child count, reserved). Entry 0 is
/// always the root directory; a directory's children occupy one contiguous,
/// name-sorted index range.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TreeEntry {
    name_offset_and_kind: be::U32,
    word0: be::U32,
    word1: be::U32,
    word2: be::U32,
}

impl TreeEntry {
    /// Build a file entry. Offset and size must fit in 48 bits.
    pub fn file(name_offset: u32, file_offset: u64, file_size: u64) -> Self {
        debug_assert!(file_offset < 1 << 48 && file_size < 1 << 48);
        let high = (((file_size >> 32) as u32) << 16) | ((file_offset >> 32) as u32 & 0xFFFF);
        Self {
            name_offset_and_kind: (FILE_FLAG | (name_offset & NAME_OFFSET_NONE)).into(),
            word0: (file_offset as u32).into(),
            word1: (file_size as u32).into(),
            word2: high.into(),
        }
    }

    /// Build a directory entry owning `count` children starting at tree index
    /// `node_start_index`.
    pub fn directory(name_offset: u32, node_start_index: u32, count: u32) -> Self {
        Self {
            name_offset_and_kind: (name_offset & NAME_OFFSET_NONE).into(),
            word0: node_start_index.into(),
            word1: count.into(),
            word2: 0.into(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.name_offset_and_kind.get() & FILE_FLAG != 0
    }

    pub fn name_offset(&self) -> u32 {
        self.name_offset_and_kind.get() & NAME_OFFSET_NONE
    }

    /// Byte offset of this file's data within the uncompressed stream.
    pub fn file_offset(&self) -> u64 {
        u64::from(self.word0.get()) | u64::from(self.word2.get() & 0xFFFF) << 32
    }

    /// Length of this file in bytes.
    pub fn file_size(&self) -> u64 {
        u64::from(self.word1.get()) | u64::from(self.word2.get() & 0xFFFF_0000) << 16
    }

    /// Tree index of this directory's first child.
    pub fn dir_start(&self) -> u32 {
        self.word0.get()
    }

    /// Number of children of this directory.
    pub fn dir_count(&self) -> u32 {
        self.word1.get()
    }
}

impl fmt::Debug for TreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_file() {
            f.debug_struct("TreeEntry::File")
                .field("name_offset", &self.name_offset())
                .field("file_offset", &self.file_offset())
                .field("file_size", &self.file_size())
                .finish()
        } else {
            f.debug_struct("TreeEntry::Directory")
                .field("name_offset", &self.name_offset())
                .field("dir_start", &self.dir_start())
                .field("dir_count", &self.dir_count())
                .finish()
        }
    }
}

/// The fixed-layout trailer of an archive.
///
/// `total_size` must equal the file length, and `integrity_hash` is the
/// SHA-256 of the entire file computed with the hash field itself zeroed.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Footer {
    pub compressed_data: SectionRange,
    pub offset_records: SectionRange,
    pub names: SectionRange,
    pub file_tree: SectionRange,
    pub meta_directory: SectionRange,
    pub meta_data: SectionRange,
    pub integrity_hash: [u8; 32],
    pub total_size: be::U64,
    pub version: be::U32,
    pub magic: be::U32,
}

/// The size of the serialised [`Footer`] in bytes.
pub const FOOTER_SIZE: usize = size_of::<Footer>();

const _: () = assert!(size_of::<SectionRange>() == 16);
const _: () = assert!(size_of::<OffsetRecord>() == 8 + 2 * BLOCKS_PER_RECORD);
const _: () = assert!(size_of::<TreeEntry>() == 16);
const _: () = assert!(size_of::<Footer>() == 16 * 6 + 32 + 8 + 4 + 4);

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("compressed_data", &self.compressed_data)
            .field("offset_records", &self.offset_records)
            .field("names", &self.names)
            .field("file_tree", &self.file_tree)
            .field("meta_directory", &self.meta_directory)
            .field("meta_data", &self.meta_data)
            .field("integrity_hash", &format_args!("{:02x?}", self.integrity_hash))
            .field("total_size", &self.total_size.get())
            .field("version", &format_args!("{:#x}", self.version.get()))
            .field("magic", &format_args!("{:#x}", self.magic.get()))
            .finish()
    }
}

/// Encode the 1- or 2-byte length prefix for a name of `len` bytes.
///
/// Returns the prefix buffer and how many of its bytes are used. Lengths up
/// to 127 use a single byte; longer names set the high bit of the first byte
/// and extend the length field to 15 bits with a second byte. The caller must
/// have truncated the name to [`NAME_LEN_MAX`] already.
pub fn name_prefix(len: usize) -> ([u8; 2], usize) {
    debug_assert!(len <= NAME_LEN_MAX);
    if len >= 0x80 {
        ([(len & 0x7F) as u8 | 0x80, (len >> 7) as u8], 2)
    } else {
        ([len as u8, 0], 1)
    }
}

/// Decode the name stored at `offset` in the name table.
///
/// The [`NAME_OFFSET_NONE`] sentinel decodes to the empty name. Returns
/// `None` when the prefix or the name bytes run past the end of the table.
pub fn name_at(table: &[u8], offset: u32) -> Option<&[u8]> {
    if offset == NAME_OFFSET_NONE {
        return Some(&[]);
    }
    let offset = offset as usize;
    let &b0 = table.get(offset)?;
    let (len, start) = if b0 & 0x80 != 0 {
        let &b1 = table.get(offset + 1)?;
        (usize::from(b0 & 0x7F) | usize::from(b1) << 7, offset + 2)
    } else {
        (usize::from(b0), offset + 1)
    };
    table.get(start..start + len)
}
