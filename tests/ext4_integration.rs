//! End-to-end ext4 scenarios (spec §8), driving the full
//! `new -> mkdir/add_file/add_symlink* -> commit -> precompile -> compile`
//! pipeline. Most scenarios use an in-memory sink; the large-file scenario
//! uses a real temp file, matching how a caller would actually size a
//! multi-hundred-megabyte image.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::Utc;
use fsimage::ext4::extent::{needs_external_index, MAX_EXTENT_LEN};
use fsimage::{CompileError, Ext4Compiler, SymlinkSource};

const BLOCK_SIZE: u64 = 4096;
const SUPERBLOCK_OFFSET: usize = 1024;
const MAGIC_OFFSET: usize = SUPERBLOCK_OFFSET + 56;
const BLOCKS_COUNT_OFFSET: usize = SUPERBLOCK_OFFSET + 4;
const INODES_COUNT_OFFSET: usize = SUPERBLOCK_OFFSET;
const FREE_INODES_COUNT_OFFSET: usize = SUPERBLOCK_OFFSET + 16;
const INODE_SIZE_OFFSET: usize = SUPERBLOCK_OFFSET + 88;
const UUID_OFFSET: usize = SUPERBLOCK_OFFSET + 104;

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn compile_to_vec(compiler: &mut Ext4Compiler, size: u64) -> Vec<u8> {
    compiler.precompile(size).expect("precompile");
    let mut sink = Cursor::new(vec![0u8; size as usize]);
    compiler.compile(&mut sink).expect("compile");
    sink.into_inner()
}

#[test]
fn empty_tree_compiles_to_a_mountable_minimum_image() {
    let mut compiler = Ext4Compiler::new();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    assert!(minimum > 0);
    assert_eq!(minimum % BLOCK_SIZE, 0);

    let data = compile_to_vec(&mut compiler, minimum);
    assert_eq!(data.len() as u64, minimum);
    assert_eq!(read_u16(&data, MAGIC_OFFSET), 0xEF53);
    assert_eq!(read_u32(&data, BLOCKS_COUNT_OFFSET) as u64, minimum / BLOCK_SIZE);
    assert_eq!(read_u16(&data, INODE_SIZE_OFFSET), 128);

    let inodes_count = read_u32(&data, INODES_COUNT_OFFSET);
    let free_inodes = read_u32(&data, FREE_INODES_COUNT_OFFSET);
    assert!(inodes_count - free_inodes >= 10, "reserved inodes 1..=10 must all be marked used");
}

#[test]
fn superblock_uuid_is_deterministic_across_repeated_compiles() {
    // spec §8 property #10 (idempotence): compiling the same tree at the
    // same size twice must produce byte-identical images, including s_uuid.
    let build = || {
        let mut compiler = Ext4Compiler::new();
        compiler.commit().unwrap();
        let minimum = compiler.minimum_size().unwrap();
        compile_to_vec(&mut compiler, minimum)
    };
    let first = build();
    let second = build();
    assert_eq!(&first[UUID_OFFSET..UUID_OFFSET + 16], &second[UUID_OFFSET..UUID_OFFSET + 16]);
    assert_ne!(&first[UUID_OFFSET..UUID_OFFSET + 16], &[0u8; 16][..], "uuid must not be left zeroed");
}

#[test]
fn flat_directory_of_one_hundred_entries_commits_and_compiles() {
    let mut compiler = Ext4Compiler::new();
    for i in 1..=100 {
        let name = format!("data/{}", "v".repeat(i));
        compiler
            .add_file(Path::new(&name), Box::new(Cursor::new(Vec::new())), 0, Utc::now())
            .unwrap();
    }
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    let data = compile_to_vec(&mut compiler, minimum);
    assert_eq!(read_u16(&data, MAGIC_OFFSET), 0xEF53);
}

#[test]
fn long_symlink_target_uses_an_extent_mapped_block_not_the_inline_area() {
    let mut compiler = Ext4Compiler::new();
    let target = "/".to_string() + &"a".repeat(255);
    assert!(target.len() >= 60, "target must be long enough to force an out-of-line block");
    let len = target.len() as u64;
    compiler
        .add_symlink(
            Path::new("opt/app/link"),
            SymlinkSource::Reader(Box::new(Cursor::new(target.into_bytes())), len),
            Utc::now(),
        )
        .unwrap();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    let data = compile_to_vec(&mut compiler, minimum);
    assert_eq!(read_u16(&data, MAGIC_OFFSET), 0xEF53);
}

#[test]
fn short_symlink_target_fits_the_inline_sixty_byte_area() {
    let mut compiler = Ext4Compiler::new();
    compiler
        .add_symlink(Path::new("bin/sh"), SymlinkSource::Cached("/bin/busybox".into()), Utc::now())
        .unwrap();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    let data = compile_to_vec(&mut compiler, minimum);
    assert_eq!(read_u16(&data, MAGIC_OFFSET), 0xEF53);
}

#[test]
fn precompile_below_minimum_is_rejected() {
    let mut compiler = Ext4Compiler::new();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    let err = compiler.precompile(minimum - BLOCK_SIZE).unwrap_err();
    match err {
        CompileError::SizeBelowMinimum { requested, minimum: reported } => {
            assert_eq!(requested, minimum - BLOCK_SIZE);
            assert_eq!(reported, minimum);
        }
        other => panic!("expected SizeBelowMinimum, got {other:?}"),
    }
}

/// A 768 MiB file of zeros, streamed lazily so the test doesn't need to hold
/// the content in memory (spec §8 worked scenario). Exactly 6 extents at the
/// 128 MiB-per-extent cap; per DESIGN.md this needs one external index block
/// since 6 exceeds the 4-entry inline extent area.
#[test]
fn large_contiguous_file_needs_exactly_six_extents_and_an_external_index() {
    let content_blocks = 768 * 1024 * 1024 / BLOCK_SIZE;
    assert_eq!(content_blocks, 6 * MAX_EXTENT_LEN);
    assert!(needs_external_index(content_blocks));

    let mut compiler = Ext4Compiler::new();
    let size = 768 * 1024 * 1024u64;
    let reader: Box<dyn Read> = Box::new(std::io::repeat(0).take(size));
    compiler.add_file(Path::new("binary"), reader, size, Utc::now()).unwrap();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();

    let mut sink = tempfile::tempfile().expect("temp file");
    sink.set_len(minimum).expect("pre-size the sink, per the Sink contract");
    compiler.precompile(minimum).unwrap();
    compiler.compile(&mut sink).unwrap();

    let len = sink.seek(SeekFrom::End(0)).unwrap();
    assert_eq!(len, minimum);

    let mut header = [0u8; SUPERBLOCK_OFFSET + 128];
    sink.seek(SeekFrom::Start(0)).unwrap();
    sink.read_exact(&mut header).unwrap();
    assert_eq!(read_u16(&header, MAGIC_OFFSET), 0xEF53);
}
