//! End-to-end ext2 scenarios (spec §8), driving the full
//! `new -> mkdir/add_file/add_symlink* -> commit -> precompile -> compile`
//! pipeline against an in-memory sink.

use std::io::{Cursor, Read};
use std::path::Path;

use chrono::Utc;
use fsimage::{CompileError, Ext2Compiler, SymlinkSource};

const BLOCK_SIZE: u64 = 4096;
const SUPERBLOCK_OFFSET: usize = 1024;
const MAGIC_OFFSET: usize = SUPERBLOCK_OFFSET + 56;
const BLOCKS_COUNT_OFFSET: usize = SUPERBLOCK_OFFSET + 4;
const INODES_COUNT_OFFSET: usize = SUPERBLOCK_OFFSET;
const FREE_INODES_COUNT_OFFSET: usize = SUPERBLOCK_OFFSET + 16;
const INODE_SIZE_OFFSET: usize = SUPERBLOCK_OFFSET + 88;

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn compile_to_vec(compiler: &mut Ext2Compiler, size: u64) -> Vec<u8> {
    compiler.precompile(size).expect("precompile");
    let mut sink = Cursor::new(vec![0u8; size as usize]);
    compiler.compile(&mut sink).expect("compile");
    sink.into_inner()
}

#[test]
fn empty_tree_compiles_to_a_mountable_minimum_image() {
    let mut compiler = Ext2Compiler::new();
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
fn small_file_round_trips_through_commit_precompile_compile() {
    let mut compiler = Ext2Compiler::new();
    let content = b"hello from an application image\n".to_vec();
    compiler
        .add_file(Path::new("etc/motd"), Box::new(Cursor::new(content)), 33, Utc::now())
        .unwrap();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    let data = compile_to_vec(&mut compiler, minimum);
    assert_eq!(read_u16(&data, MAGIC_OFFSET), 0xEF53);
}

#[test]
fn cached_symlink_and_long_symlink_both_commit_successfully() {
    let mut compiler = Ext2Compiler::new();
    compiler
        .add_symlink(Path::new("bin/app"), SymlinkSource::Cached("/usr/bin/real-app".into()), Utc::now())
        .unwrap();
    let long_target = "a/".repeat(100);
    let long_len = long_target.len() as u64;
    compiler
        .add_symlink(
            Path::new("bin/long"),
            SymlinkSource::Reader(Box::new(Cursor::new(long_target.into_bytes())), long_len),
            Utc::now(),
        )
        .unwrap();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    let data = compile_to_vec(&mut compiler, minimum);
    assert_eq!(read_u16(&data, MAGIC_OFFSET), 0xEF53);
}

#[test]
fn precompile_below_minimum_is_rejected() {
    let mut compiler = Ext2Compiler::new();
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

#[test]
fn compile_before_precompile_is_a_state_error() {
    let mut compiler = Ext2Compiler::new();
    compiler.commit().unwrap();
    let mut sink = Cursor::new(Vec::new());
    let err = compiler.compile(&mut sink).unwrap_err();
    assert!(matches!(err, CompileError::StateError(_)));
}

#[test]
fn region_is_hole_reports_true_for_a_directory_only_tree_data_region() {
    let mut compiler = Ext2Compiler::new();
    compiler.mkdir(Path::new("var/log")).unwrap();
    compiler.commit().unwrap();
    let minimum = compiler.minimum_size().unwrap();
    compiler.precompile(minimum + 16 * BLOCK_SIZE).unwrap();
    // The tail of the enlarged image holds no planned node, so it must read
    // back as a hole the sink can leave unwritten (spec §6.2).
    let tail_offset = (minimum + 8 * BLOCK_SIZE) as u64;
    assert!(compiler.region_is_hole(tail_offset, BLOCK_SIZE).unwrap());
}
