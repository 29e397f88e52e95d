use std::io::Read;

use bstr::BStr;
use zar::format::{self, BLOCK_SIZE, FOOTER_SIZE, Footer, OffsetRecord};
use zar::{Archive, Config, NodeHandle};
use zar_enc::Writer;
use zerocopy::FromBytes;

fn build_with(f: impl FnOnce(&mut Writer<Vec<u8>>) -> zar_enc::Result<()>) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new()).unwrap();
    f(&mut writer).unwrap();
    writer.finish().unwrap()
}

fn footer_of(bytes: &[u8]) -> Footer {
    Footer::read_from_bytes(&bytes[bytes.len() - FOOTER_SIZE..]).unwrap()
}

fn section_of(bytes: &[u8], range: format::SectionRange) -> &[u8] {
    &bytes[range.offset.get() as usize..][..range.size.get() as usize]
}

fn read_all(archive: &Archive<Vec<u8>>, handle: NodeHandle) -> Vec<u8> {
    let mut out = Vec::new();
    archive
        .file_reader(handle)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}

fn xorshift_bytes(mut state: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn empty_archive() {
    let b = build_with(|_| Ok(()));

    let footer = footer_of(&b);
    assert_eq!(footer.total_size.get(), b.len() as u64);
    assert_eq!(footer.compressed_data.size.get(), 0);
    assert_eq!(footer.offset_records.size.get(), 0);
    // Only the root entry.
    assert_eq!(footer.file_tree.size.get(), 16);
    assert_eq!(footer.names.size.get(), 0);

    let archive = Archive::new(b).unwrap();
    let root = archive.root();
    assert!(archive.is_dir(root));
    assert_eq!(archive.dir_entry_count(root), 0);
    assert_eq!(archive.lookup(""), Some(root));
    assert_eq!(archive.lookup("/"), Some(root));
    assert_eq!(archive.lookup("anything"), None);
    archive.verify_integrity().unwrap();
}

#[test]
fn single_tiny_file() {
    let b = build_with(|w| {
        w.start_file("a.txt")?;
        w.append(b"hi")
    });

    let footer = footer_of(&b);
    // One block, so one (partially used) offset record.
    assert_eq!(footer.offset_records.size.get(), 40);
    // Root plus the file.
    assert_eq!(footer.file_tree.size.get(), 32);
    assert_eq!(section_of(&b, footer.names), b"\x05a.txt");

    let records = <[OffsetRecord]>::ref_from_bytes(section_of(&b, footer.offset_records)).unwrap();
    assert_eq!(records[0].base_offset.get(), 0);
    assert_eq!(
        u64::from(records[0].sizes[0].get()) + 1,
        footer.compressed_data.size.get()
    );

    let archive = Archive::new(b).unwrap();
    let handle = archive.lookup("/a.txt").unwrap();
    assert!(archive.is_file(handle));
    assert_eq!(archive.file_size(handle), Some(2));

    let mut buf = [0u8; 16];
    assert_eq!(archive.read_at(handle, 0, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"hi");
    // At and past the end.
    assert_eq!(archive.read_at(handle, 2, &mut buf).unwrap(), 0);
    assert_eq!(archive.read_at(handle, 100, &mut buf).unwrap(), 0);
    assert_eq!(archive.read_at(handle, 0, &mut []).unwrap(), 0);

    archive.verify_integrity().unwrap();
}

#[test]
fn deep_nesting() {
    let content: Vec<u8> = (0..=255).collect();
    let c = content.clone();
    let b = build_with(move |w| {
        w.make_dir("/x/y/z", true)?;
        w.start_file("/x/y/z/f.bin")?;
        w.append(&c)
    });

    let archive = Archive::new(b).unwrap();
    let handle = archive.lookup("/x/y/z/f.bin").unwrap();
    assert_eq!(archive.file_size(handle), Some(256));
    assert_eq!(read_all(&archive, handle), content);

    assert!(archive.is_dir(archive.lookup("x/y").unwrap()));
    // Separator style and runs do not matter.
    assert_eq!(archive.lookup("x\\y//z\\f.bin"), Some(handle));
}

#[test]
fn case_insensitive_lookup() {
    let b = build_with(|w| {
        w.make_dir("Foo", false)?;
        w.start_file("Foo/bar.txt")?;
        w.append(b"abc")
    });

    let archive = Archive::new(b).unwrap();
    let h1 = archive.lookup("/foo/BAR.txt").unwrap();
    let h2 = archive.lookup("/FOO/bar.txt").unwrap();
    assert_eq!(h1, h2);
    assert_eq!(read_all(&archive, h1), b"abc");

    // The stored name keeps its original case.
    let dir = archive.lookup_dir("foo").unwrap();
    assert_eq!(archive.dir_entry(dir, 0).unwrap().name, "bar.txt");
}

#[test]
fn cross_block_read() {
    let content = vec![0xABu8; 200_000];
    let c = content.clone();
    let b = build_with(move |w| {
        w.start_file("big")?;
        w.append(&c)
    });

    // 200000 bytes round up to 4 blocks, still one offset record.
    assert_eq!(footer_of(&b).offset_records.size.get(), 40);

    let archive = Archive::new(b).unwrap();
    let handle = archive.lookup_file("big").unwrap();
    let mut buf = [0u8; 20];
    assert_eq!(archive.read_at(handle, 65530, &mut buf).unwrap(), 20);
    assert_eq!(buf, [0xAB; 20]);
    assert_eq!(read_all(&archive, handle), content);
}

#[test]
fn stored_and_compressed_blocks() {
    // Pseudo-random bytes do not compress, forcing the verbatim fallback;
    // the zero block compresses to nearly nothing.
    let noise = xorshift_bytes(0x1234_5678_9ABC_DEF0, BLOCK_SIZE);
    let zeros = vec![0u8; BLOCK_SIZE];
    let mut content = noise.clone();
    content.extend_from_slice(&zeros);

    let c = content.clone();
    let b = build_with(move |w| {
        w.start_file("mixed")?;
        w.append(&c)
    });

    let footer = footer_of(&b);
    let records = <[OffsetRecord]>::ref_from_bytes(section_of(&b, footer.offset_records)).unwrap();
    assert_eq!(u64::from(records[0].sizes[0].get()) + 1, BLOCK_SIZE as u64);
    assert!((u64::from(records[0].sizes[1].get()) + 1) < BLOCK_SIZE as u64);

    let archive = Archive::new(b).unwrap();
    let handle = archive.lookup_file("mixed").unwrap();
    assert_eq!(read_all(&archive, handle), content);

    // A read spanning the stored/compressed boundary.
    let mut buf = [0u8; 32];
    assert_eq!(
        archive.read_at(handle, BLOCK_SIZE as u64 - 16, &mut buf).unwrap(),
        32
    );
    assert_eq!(&buf[..16], &noise[BLOCK_SIZE - 16..]);
    assert_eq!(&buf[16..], &[0u8; 16]);
}

#[test]
fn multiple_offset_records() {
    // 17 blocks spill into a second offset record.
    let content: Vec<u8> = (0..17 * BLOCK_SIZE).map(|i| (i / 7) as u8).collect();
    let c = content.clone();
    let b = build_with(move |w| {
        w.start_file("long")?;
        w.append(&c)
    });

    let footer = footer_of(&b);
    let records = <[OffsetRecord]>::ref_from_bytes(section_of(&b, footer.offset_records)).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].base_offset.get() < records[1].base_offset.get());
    // Only one block in the second record; its tail entries are unused.
    assert_eq!(records[1].sizes[1].get(), 0);

    let archive = Archive::new(b).unwrap();
    let handle = archive.lookup_file("long").unwrap();
    let mut buf = [0u8; 20];
    let boundary = 16 * BLOCK_SIZE as u64 - 10;
    assert_eq!(archive.read_at(handle, boundary, &mut buf).unwrap(), 20);
    assert_eq!(
        buf,
        content[boundary as usize..boundary as usize + 20]
    );
    assert_eq!(read_all(&archive, handle), content);
}

#[test]
fn duplicate_and_missing_entries() {
    let b = build_with(|w| {
        w.make_dir("a", false)?;
        w.start_file("a/b")?;
        w.append(b"data")?;

        assert!(w.start_file("a/b").is_err());
        assert!(w.make_dir("a/b", false).is_err());
        assert!(w.make_dir("a/b/c", true).is_err());
        assert!(w.make_dir("a", false).is_err());
        // Duplicate checks fold case.
        assert!(w.make_dir("A", false).is_err());
        assert!(w.start_file("missing/f").is_err());

        // The writer stays usable after a rejected operation.
        w.start_file("a/c")?;
        w.append(b"more")
    });

    let archive = Archive::new(b).unwrap();
    assert_eq!(read_all(&archive, archive.lookup_file("a/b").unwrap()), b"data");
    assert_eq!(read_all(&archive, archive.lookup_file("a/c").unwrap()), b"more");
    assert_eq!(archive.dir_entry_count(archive.lookup_dir("a").unwrap()), 2);
}

#[test]
fn empty_file_and_exact_block_multiples() {
    let full = vec![0x5Au8; 2 * BLOCK_SIZE];
    let f = full.clone();
    let b = build_with(move |w| {
        w.start_file("empty")?;
        w.start_file("full")?;
        w.append(&f)?;
        w.start_file("tail")?;
        w.append(b"0123456789")
    });

    // Two full blocks plus the padded tail block.
    let footer = footer_of(&b);
    assert_eq!(footer.offset_records.size.get(), 40);

    let archive = Archive::new(b).unwrap();
    let empty = archive.lookup_file("empty").unwrap();
    assert_eq!(archive.file_size(empty), Some(0));
    let mut buf = [0u8; 8];
    assert_eq!(archive.read_at(empty, 0, &mut buf).unwrap(), 0);
    assert_eq!(read_all(&archive, empty), b"");

    let h = archive.lookup_file("full").unwrap();
    assert_eq!(read_all(&archive, h), full);
    assert_eq!(archive.read_at(h, 2 * BLOCK_SIZE as u64, &mut buf).unwrap(), 0);

    assert_eq!(read_all(&archive, archive.lookup_file("tail").unwrap()), b"0123456789");
}

#[test]
fn enumeration_is_sorted() {
    let b = build_with(|w| {
        w.start_file("zeta")?;
        w.append(b"zz")?;
        w.make_dir("Alpha", false)?;
        w.start_file("beta")?;
        w.make_dir("GAMMA", false)
    });

    let archive = Archive::new(b).unwrap();
    let root = archive.root();
    assert_eq!(archive.dir_entry_count(root), 4);

    let entries: Vec<_> = (0..4).map(|i| archive.dir_entry(root, i).unwrap()).collect();
    let names: Vec<&BStr> = entries.iter().map(|ent| ent.name).collect();
    assert_eq!(names, ["Alpha", "beta", "GAMMA", "zeta"]);

    assert!(entries[0].is_directory && !entries[0].is_file);
    assert!(entries[3].is_file && !entries[3].is_directory);
    assert_eq!(entries[0].size, 0);
    assert_eq!(entries[3].size, 2);

    assert!(archive.dir_entry(root, 4).is_none());
    let file = archive.lookup_file("zeta").unwrap();
    assert_eq!(archive.dir_entry_count(file), 0);
    assert!(archive.dir_entry(file, 0).is_none());
}

#[test]
fn lookup_filters_enforce_kind() {
    let b = build_with(|w| {
        w.make_dir("dir", false)?;
        w.start_file("dir/f")?;
        w.append(b"x")
    });

    let archive = Archive::new(b).unwrap();
    assert!(archive.lookup_dir("dir").is_some());
    assert_eq!(archive.lookup_file("dir"), None);
    assert!(archive.lookup_file("dir/f").is_some());
    assert_eq!(archive.lookup_dir("dir/f"), None);
    // Descending into a file fails outright.
    assert_eq!(archive.lookup("dir/f/x"), None);

    // Reading a directory handle is an error, not a short read.
    let dir = archive.lookup_dir("dir").unwrap();
    assert!(archive.read_at(dir, 0, &mut [0u8; 4]).is_err());
    assert!(archive.file_reader(dir).is_none());
    assert_eq!(archive.file_size(dir), None);
}

#[test]
fn names_are_deduplicated() {
    let b = build_with(|w| {
        w.make_dir("x", false)?;
        w.make_dir("y", false)?;
        w.start_file("x/dup")?;
        w.start_file("y/dup")
    });

    // "x", "y" and a single copy of "dup".
    assert_eq!(footer_of(&b).names.size.get(), 2 + 2 + 4);

    let archive = Archive::new(b).unwrap();
    assert!(archive.lookup_file("x/dup").is_some());
    assert!(archive.lookup_file("y/dup").is_some());
}

#[test]
fn name_length_boundaries() {
    let short = "a".repeat(127);
    let long = "b".repeat(128);
    let overlong = "c".repeat(40_000);

    let (s, l, o) = (short.clone(), long.clone(), overlong.clone());
    let b = build_with(move |w| {
        w.start_file(&s)?;
        w.start_file(&l)?;
        w.make_dir(&o, false)
    });

    let footer = footer_of(&b);
    // 1-byte prefix at 127, 2-byte prefix at 128, truncation at 32767.
    assert_eq!(
        footer.names.size.get(),
        (1 + 127) + (2 + 128) + (2 + format::NAME_LEN_MAX as u64)
    );

    let archive = Archive::new(b).unwrap();
    assert!(archive.lookup_file(&short).is_some());
    assert!(archive.lookup_file(&long).is_some());
    // The overlong name was cut to the representable maximum.
    assert_eq!(archive.lookup_dir(&overlong), None);
    assert!(archive.lookup_dir(&overlong[..format::NAME_LEN_MAX]).is_some());

    let root = archive.root();
    let max_len = (0..3)
        .map(|i| archive.dir_entry(root, i).unwrap().name.len())
        .max();
    assert_eq!(max_len, Some(format::NAME_LEN_MAX));
}

#[test]
fn corruption_is_detected() {
    let b = build_with(|w| {
        w.start_file("f")?;
        w.append(&[0x77; 1000])
    });

    // A flipped bit in the data stream passes footer validation but fails
    // integrity verification.
    let mut corrupt = b.clone();
    corrupt[10] ^= 0x04;
    let archive = Archive::new(corrupt).unwrap();
    assert!(archive.verify_integrity().is_err());

    // A flipped bit in the stored hash itself.
    let mut corrupt = b.clone();
    let hash_pos = b.len() - FOOTER_SIZE + (16 * 6);
    corrupt[hash_pos] ^= 0x80;
    assert!(Archive::new(corrupt).unwrap().verify_integrity().is_err());

    // A flipped bit in the footer magic fails at open.
    let mut corrupt = b.clone();
    let magic_pos = b.len() - 1;
    corrupt[magic_pos] ^= 0x01;
    assert!(Archive::new(corrupt).is_err());

    // Truncation breaks the stated total size.
    let mut truncated = b.clone();
    truncated.pop();
    assert!(Archive::new(truncated).is_err());

    // The pristine archive still verifies.
    Archive::new(b).unwrap().verify_integrity().unwrap();
}

#[test]
fn corrupt_offset_record_fails_read() {
    let b = build_with(|w| {
        w.start_file("f")?;
        w.append(&[1u8; 10])
    });

    // Rewrite the record's base offset to the end of the address space; the
    // read must fail instead of overflowing the block arithmetic.
    let footer = footer_of(&b);
    let mut evil = b.clone();
    let rec_off = footer.offset_records.offset.get() as usize;
    evil[rec_off..rec_off + 8].copy_from_slice(&u64::MAX.to_be_bytes());

    let archive = Archive::new(evil).unwrap();
    let handle = archive.lookup_file("f").unwrap();
    assert!(archive.read_at(handle, 0, &mut [0u8; 4]).is_err());
}

#[test]
fn tiny_cache_evicts_and_rereads() {
    let content: Vec<u8> = (0..5 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let c = content.clone();
    let b = build_with(move |w| {
        w.start_file("f")?;
        w.append(&c)
    });

    // A single cache slot forces an eviction on every block switch.
    let config = Config::default().block_cache_size(BLOCK_SIZE);
    let archive = Archive::new_with_config(b, &config).unwrap();
    let handle = archive.lookup_file("f").unwrap();
    assert_eq!(read_all(&archive, handle), content);

    // Jump back to the start after the cache has cycled through.
    let mut buf = [0u8; 16];
    assert_eq!(archive.read_at(handle, 0, &mut buf).unwrap(), 16);
    assert_eq!(&buf, &content[..16]);
}

#[test]
fn sequential_files_share_blocks() {
    let b = build_with(|w| {
        w.start_file("f1")?;
        w.append(b"first")?;
        w.start_file("f2")?;
        w.append(b"second")?;
        w.make_dir("d", false)?;
        w.start_file("d/f3")?;
        w.append(b"third")
    });

    let archive = Archive::new(b).unwrap();
    assert_eq!(read_all(&archive, archive.lookup_file("f1").unwrap()), b"first");
    assert_eq!(read_all(&archive, archive.lookup_file("f2").unwrap()), b"second");
    assert_eq!(read_all(&archive, archive.lookup_file("d/f3").unwrap()), b"third");
}
