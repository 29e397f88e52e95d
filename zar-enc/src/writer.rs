//! The streaming archive writer.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use sha2::{Digest, Sha256};
use zar::format::{
    self, BLOCK_SIZE, BLOCKS_PER_RECORD, FOOTER_SIZE, Footer, OffsetRecord, SectionRange,
    TreeEntry,
};
use zar::path;
use zerocopy::{FromZeros, IntoBytes};

use crate::{ErrorInner, Result, sink::Sink};

/// The zstd level used for block compression.
const COMPRESSION_LEVEL: i32 = 6;

/// A streaming, append-only archive writer.
///
/// Files are declared with [`Writer::start_file`] and filled with
/// [`Writer::append`]; data must arrive sequentially per file. Incoming
/// bytes are sliced into 64 KiB blocks which are compressed and emitted
/// immediately, so memory usage stays flat no matter how large the archive
/// grows. [`Writer::finish`] emits the index sections and the hashed footer.
///
/// The writer is single-threaded and not reentrant; the caller serialises
/// all operations.
pub struct Writer<W: ?Sized> {
    /// Node arena; index 0 is the anonymous root directory.
    nodes: Vec<PathNode>,
    active_file: Option<u32>,
    /// Distinct entry names in insertion order, deduplicated by `name_lookup`.
    names: Vec<String>,
    name_lookup: HashMap<String, u32>,
    block_buf: Vec<u8>,
    compress_buf: Vec<u8>,
    offset_records: Vec<OffsetRecord>,
    block_count: u64,
    /// Bytes emitted through the sink so far.
    out_offset: u64,
    /// Current offset within the uncompressed input stream.
    input_offset: u64,
    hasher: Sha256,
    sink: W,
}

struct PathNode {
    /// Index into `names`; `u32::MAX` for the unnamed root.
    name_idx: u32,
    data: NodeData,
}

enum NodeData {
    File {
        offset: u64,
        size: u64,
    },
    Dir {
        children: Vec<u32>,
        /// Tree index of the first child, assigned during finalisation.
        start_index: u32,
    },
}

impl NodeData {
    fn empty_dir() -> Self {
        NodeData::Dir {
            children: Vec::new(),
            start_index: 0,
        }
    }
}

impl<W: ?Sized> fmt::Debug for Writer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("nodes", &self.nodes.len())
            .field("blocks", &self.block_count)
            .field("input_offset", &self.input_offset)
            .field("out_offset", &self.out_offset)
            .finish_non_exhaustive()
    }
}

impl<W: Sink> Writer<W> {
    /// Create a writer emitting into `sink`.
    ///
    /// The sink's initial part is announced immediately with part index `-1`.
    pub fn new(mut sink: W) -> Result<Self> {
        sink.begin_part(-1)?;
        Ok(Self {
            nodes: vec![PathNode {
                name_idx: u32::MAX,
                data: NodeData::empty_dir(),
            }],
            active_file: None,
            names: Vec::new(),
            name_lookup: HashMap::new(),
            block_buf: Vec::with_capacity(BLOCK_SIZE),
            compress_buf: Vec::new(),
            offset_records: Vec::new(),
            block_count: 0,
            out_offset: 0,
            input_offset: 0,
            hasher: Sha256::new(),
            sink,
        })
    }
}

impl<W: Sink + ?Sized> Writer<W> {
    /// Create a new file and make it the active target for [`Writer::append`].
    ///
    /// The parent directory must already exist; the filename must be
    /// non-empty and not collide (ASCII case-insensitively) with an existing
    /// entry. The file's data starts at the current input offset.
    pub fn start_file(&mut self, archive_path: &str) -> Result<()> {
        self.active_file = None;
        let (parent, name) = path::split_filename(archive_path.as_bytes());
        if name.is_empty() {
            bail!(ErrorInner::EmptyName);
        }
        let dir = self.resolve_dir(parent)?;
        if self.find_child(dir, name).is_some() {
            bail!(ErrorInner::DuplicateEntry);
        }
        let name_idx = self.intern_name(std::str::from_utf8(name).expect("validated"));
        let node = self.push_node(PathNode {
            name_idx,
            data: NodeData::File {
                offset: self.input_offset,
                size: 0,
            },
        })?;
        self.attach_child(dir, node);
        self.active_file = Some(node);
        Ok(())
    }

    /// Append data to the active file's byte stream.
    ///
    /// Complete blocks are compressed and flushed immediately. With no
    /// active file the bytes are still consumed into the block stream but
    /// not attributed to any file.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        let total = data.len() as u64;
        while !data.is_empty() {
            if self.block_buf.is_empty() && data.len() >= BLOCK_SIZE {
                // Block-aligned input skips the staging copy.
                let (block, rest) = data.split_at(BLOCK_SIZE);
                self.store_block(block)?;
                data = rest;
                continue;
            }
            let take = (BLOCK_SIZE - self.block_buf.len()).min(data.len());
            let (chunk, rest) = data.split_at(take);
            self.block_buf.extend_from_slice(chunk);
            data = rest;
            if self.block_buf.len() == BLOCK_SIZE {
                let buf = std::mem::take(&mut self.block_buf);
                self.store_block(&buf)?;
                self.block_buf = buf;
                self.block_buf.clear();
            }
        }
        if let Some(node) = self.active_file {
            if let NodeData::File { size, .. } = &mut self.nodes[node as usize].data {
                *size += total;
            }
        }
        self.input_offset += total;
        Ok(())
    }

    /// Create a directory.
    ///
    /// Non-recursive: the parent must exist and the final segment must not.
    /// Recursive: missing directories along the path are created; an
    /// existing segment that is a file fails the call. Trailing separators
    /// are ignored.
    pub fn make_dir(&mut self, archive_path: &str, recursive: bool) -> Result<()> {
        let mut p = archive_path.as_bytes();
        while let Some((&last, rest)) = p.split_last() {
            if !path::is_separator(last) {
                break;
            }
            p = rest;
        }
        if !recursive {
            let (parent, name) = path::split_filename(p);
            if name.is_empty() {
                bail!(ErrorInner::EmptyName);
            }
            let dir = self.resolve_dir(parent)?;
            if self.find_child(dir, name).is_some() {
                bail!(ErrorInner::DuplicateEntry);
            }
            let name_idx = self.intern_name(std::str::from_utf8(name).expect("validated"));
            let node = self.push_node(PathNode {
                name_idx,
                data: NodeData::empty_dir(),
            })?;
            self.attach_child(dir, node);
        } else {
            let mut cur = 0u32;
            for seg in path::segments(p) {
                match self.find_child(cur, seg) {
                    Some(child) => match self.nodes[child as usize].data {
                        NodeData::File { .. } => bail!(ErrorInner::NotADirectory),
                        NodeData::Dir { .. } => cur = child,
                    },
                    None => {
                        let name_idx =
                            self.intern_name(std::str::from_utf8(seg).expect("validated"));
                        let node = self.push_node(PathNode {
                            name_idx,
                            data: NodeData::empty_dir(),
                        })?;
                        self.attach_child(cur, node);
                        cur = node;
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk `archive_path` from the root, requiring every segment to be an
    /// existing directory, and return the final directory node.
    fn resolve_dir(&self, archive_path: &[u8]) -> Result<u32> {
        let mut cur = 0u32;
        for seg in path::segments(archive_path) {
            let child = self
                .find_child(cur, seg)
                .ok_or(ErrorInner::ParentNotFound)?;
            match self.nodes[child as usize].data {
                NodeData::File { .. } => bail!(ErrorInner::NotADirectory),
                NodeData::Dir { .. } => cur = child,
            }
        }
        Ok(cur)
    }

    /// Linear scan of a directory's children; they stay unsorted until
    /// finalisation.
    fn find_child(&self, dir: u32, name: &[u8]) -> Option<u32> {
        let NodeData::Dir { children, .. } = &self.nodes[dir as usize].data else {
            return None;
        };
        children.iter().copied().find(|&child| {
            let child_name = &self.names[self.nodes[child as usize].name_idx as usize];
            path::eq_names(child_name.as_bytes(), name)
        })
    }

    fn intern_name(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.name_lookup.get(name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_owned());
        self.name_lookup.insert(name.to_owned(), idx);
        idx
    }

    fn push_node(&mut self, node: PathNode) -> Result<u32> {
        let idx = u32::try_from(self.nodes.len())
            .ok()
            .ok_or(ErrorInner::Limit("file tree entry count exceeds 2^32"))?;
        self.nodes.push(node);
        Ok(idx)
    }

    fn attach_child(&mut self, dir: u32, child: u32) {
        let NodeData::Dir { children, .. } = &mut self.nodes[dir as usize].data else {
            unreachable!("parent resolved to a directory");
        };
        children.push(child);
    }

    /// Emit archive bytes: everything flows through here so the integrity
    /// hash tracks the whole output stream.
    fn output(&mut self, data: &[u8]) -> Result<()> {
        self.sink.write_all(data)?;
        self.hasher.update(data);
        self.out_offset += data.len() as u64;
        Ok(())
    }

    /// Compress and emit one full uncompressed block, recording its on-disk
    /// length in the current offset record.
    fn store_block(&mut self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        let base_offset = self.out_offset;

        self.compress_buf
            .resize(zstd::zstd_safe::compress_bound(BLOCK_SIZE), 0);
        let mut compress_buf = std::mem::take(&mut self.compress_buf);
        let written = zstd::bulk::compress_to_buffer(data, &mut compress_buf, COMPRESSION_LEVEL)
            .map_err(ErrorInner::Compress)?;
        let stored_len = if written >= BLOCK_SIZE {
            // Compression did not help; store the block verbatim.
            self.output(data)?;
            BLOCK_SIZE
        } else {
            self.output(&compress_buf[..written])?;
            written
        };
        self.compress_buf = compress_buf;

        let sub = (self.block_count % BLOCKS_PER_RECORD as u64) as usize;
        if sub == 0 {
            let mut record = OffsetRecord::new_zeroed();
            record.base_offset = base_offset.into();
            self.offset_records.push(record);
        }
        let record = self.offset_records.last_mut().expect("record pushed");
        record.sizes[sub] = ((stored_len - 1) as u16).into();
        self.block_count += 1;
        Ok(())
    }
}

impl<W: Sink> Writer<W> {
    /// Finalize the archive and return the sink.
    ///
    /// Closes the active file, pads the open block to a full 64 KiB, then
    /// emits the offset records, the name table, the file tree, the reserved
    /// metadata sections and the footer. The footer's integrity hash is the
    /// SHA-256 of every emitted byte with the hash field itself zeroed.
    pub fn finish(mut self) -> Result<W> {
        self.active_file = None;
        if !self.block_buf.is_empty() {
            let pad = vec![0u8; BLOCK_SIZE - self.block_buf.len()];
            self.append(&pad)?;
        }
        let mut footer = Footer::new_zeroed();
        footer.compressed_data = SectionRange::new(0, self.out_offset);
        while self.out_offset % 8 != 0 {
            self.output(&[0])?;
        }

        // Offset records.
        let start = self.out_offset;
        let records = std::mem::take(&mut self.offset_records);
        self.output(records.as_slice().as_bytes())?;
        footer.offset_records = SectionRange::new(start, self.out_offset - start);

        // Name table: record each name's table offset, then emit its
        // length-prefixed bytes. Overlong names are cut at the length the
        // prefix can express.
        let start = self.out_offset;
        let names = std::mem::take(&mut self.names);
        let mut name_offsets = Vec::with_capacity(names.len());
        let mut table_offset = 0u64;
        for name in &names {
            if table_offset >= u64::from(format::NAME_OFFSET_NONE) {
                bail!(ErrorInner::Limit("name table exceeds 2^31 bytes"));
            }
            name_offsets.push(table_offset as u32);
            let name = &name.as_bytes()[..name.len().min(format::NAME_LEN_MAX)];
            let (prefix, prefix_len) = format::name_prefix(name.len());
            self.output(&prefix[..prefix_len])?;
            self.output(name)?;
            table_offset += (prefix_len + name.len()) as u64;
        }
        footer.names = SectionRange::new(start, self.out_offset - start);

        // File tree, pass 1: assign each directory a contiguous child range
        // in BFS order, sorting children so the reader can binary-search.
        let mut queue = VecDeque::new();
        queue.push_back(0u32);
        let mut next_index = 1u32;
        while let Some(n) = queue.pop_front() {
            let NodeData::Dir { children, .. } = &mut self.nodes[n as usize].data else {
                continue;
            };
            let mut kids = std::mem::take(children);
            kids.sort_by(|&a, &b| {
                path::cmp_names(
                    names[self.nodes[a as usize].name_idx as usize].as_bytes(),
                    names[self.nodes[b as usize].name_idx as usize].as_bytes(),
                )
            });
            let count = kids.len() as u32;
            queue.extend(kids.iter().copied());
            if let NodeData::Dir {
                children,
                start_index,
            } = &mut self.nodes[n as usize].data
            {
                *children = kids;
                *start_index = next_index;
            }
            next_index = next_index
                .checked_add(count)
                .ok_or(ErrorInner::Limit("file tree entry count exceeds 2^32"))?;
        }

        // Pass 2: emit one entry per node in the same BFS order.
        let start = self.out_offset;
        queue.push_back(0);
        while let Some(n) = queue.pop_front() {
            let entry = {
                let node = &self.nodes[n as usize];
                let name_offset = if n == 0 {
                    format::NAME_OFFSET_NONE
                } else {
                    name_offsets[node.name_idx as usize]
                };
                match &node.data {
                    NodeData::File { offset, size } => {
                        if *offset >= 1 << 48 || *size >= 1 << 48 {
                            bail!(ErrorInner::Limit("file offset or size exceeds 2^48"));
                        }
                        TreeEntry::file(name_offset, *offset, *size)
                    }
                    NodeData::Dir {
                        children,
                        start_index,
                    } => {
                        queue.extend(children.iter().copied());
                        TreeEntry::directory(name_offset, *start_index, children.len() as u32)
                    }
                }
            };
            self.output(entry.as_bytes())?;
        }
        footer.file_tree = SectionRange::new(start, self.out_offset - start);

        // Reserved metadata sections.
        footer.meta_directory = SectionRange::new(self.out_offset, 0);
        footer.meta_data = SectionRange::new(self.out_offset, 0);

        footer.magic = format::MAGIC.into();
        footer.version = format::VERSION.into();
        footer.total_size = (self.out_offset + FOOTER_SIZE as u64).into();

        // Hash the footer with a zeroed hash field, then patch the digest in
        // and write it out.
        self.hasher.update(footer.as_bytes());
        let digest = std::mem::take(&mut self.hasher).finalize();
        footer.integrity_hash = digest.into();
        self.sink.write_all(footer.as_bytes())?;

        Ok(self.sink)
    }
}
