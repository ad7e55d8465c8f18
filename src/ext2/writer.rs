//! Streaming writer for ext2 (spec §4.6): builds the block-usage bitmap and
//! group-descriptor table from the fixed geometry, then walks every group
//! writing superblock, BGDT, bitmaps, inode table and data in one forward
//! pass.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Read, Seek, Write};

use crate::arith::{divide, ext2_block_type};
use crate::cancel::CancellationToken;
use crate::common::bitmap::Bitmap;
use crate::common::constants::*;
use crate::common::dirent::{self, DirChild};
use crate::common::gdt::GroupDescriptor;
use crate::common::planned_node::{node_file_type, Plan, PlannedNode};
use crate::common::superblock::{self, Superblock};
use crate::ext2::inode::Ext2Inode;
use crate::ext2::planner::FixedGeometry;
use crate::error::Result;
use crate::sink::Sink;
use crate::tree::FileTree;

/// Maps a logical data-block index to its absolute block address (spec
/// §4.5 ext2 formula).
pub struct Mapper {
    pub data_blocks_per_group: u64,
    pub overhead_per_group: u64,
}

impl Mapper {
    pub fn absolute(&self, n: u64) -> u64 {
        let group = n / self.data_blocks_per_group;
        let offset = n % self.data_blocks_per_group;
        group * BLOCKS_PER_GROUP + self.overhead_per_group + offset
    }
}

/// Blocks physically available in `group`, clipped for a possibly-short
/// final group (spec §8 property #4: "clipped in the last group").
fn blocks_in_group(fixed: &FixedGeometry, group: u64) -> u64 {
    let group_start = group * BLOCKS_PER_GROUP;
    BLOCKS_PER_GROUP.min(fixed.blocks.saturating_sub(group_start))
}

pub struct Geometry {
    pub fixed: FixedGeometry,
    pub block_bitmap: Bitmap,
    pub inode_bitmap: Bitmap,
    pub gdt: Vec<GroupDescriptor>,
    pub mapper: Mapper,
}

/// Builds the bitmap and group-descriptor table for a fixed geometry (spec
/// §4.5). `plan.filled_data_blocks` must fit within `fixed`'s capacity —
/// the caller (compiler) already checked this via `minimum_size`.
pub fn build_geometry(tree: &FileTree, plan: &Plan, fixed: &FixedGeometry) -> Result<Geometry> {
    let groups = fixed.groups;
    let g = fixed.geometry;
    let mapper = Mapper { data_blocks_per_group: fixed.data_blocks_per_group, overhead_per_group: g.overhead_per_group };

    let mut block_bitmap = Bitmap::new(fixed.blocks);
    let mut gdt = Vec::with_capacity(groups as usize);
    let mut remaining_data = plan.filled_data_blocks;

    for group in 0..groups {
        let group_start = group * BLOCKS_PER_GROUP;
        let blocks_in_group = blocks_in_group(fixed, group);
        block_bitmap.set_range(group_start, g.overhead_per_group.min(blocks_in_group));

        let data_capacity_this_group = blocks_in_group.saturating_sub(g.overhead_per_group);
        let used_this_group = remaining_data.min(data_capacity_this_group);
        block_bitmap.set_range(group_start + g.overhead_per_group, used_this_group);
        remaining_data -= used_this_group;

        let free_blocks = blocks_in_group.saturating_sub(g.overhead_per_group).saturating_sub(used_this_group);

        gdt.push(GroupDescriptor {
            block_bitmap_addr: (group_start + 1 + g.bgdt_blocks) as u32,
            inode_bitmap_addr: (group_start + 1 + g.bgdt_blocks + 1) as u32,
            inode_table_addr: (group_start + 1 + g.bgdt_blocks + 2) as u32,
            free_blocks: free_blocks.min(u16::MAX as u64) as u16,
            free_inodes: 0, // filled below once inode usage is known
            directories: 0,
            flags: 0,
        });
    }
    block_bitmap.pad_final_word();

    let total_inodes = groups * g.inodes_per_group;
    let mut inode_bitmap = Bitmap::new(total_inodes);
    for ino in 1..INO_FIRST_FREE {
        inode_bitmap.set((ino - 1) as u64);
    }
    for node in plan.iter() {
        inode_bitmap.set((node.ino - 1) as u64);
    }

    for group in 0..groups {
        let first_ino_1based = group * g.inodes_per_group + 1;
        let used = inode_bitmap.count_set((first_ino_1based - 1) as u64, g.inodes_per_group);
        gdt[group as usize].free_inodes = (g.inodes_per_group - used).min(u16::MAX as u64) as u16;
    }

    for node in plan.iter() {
        if tree.is_dir(node.tree_idx) {
            let group = ((node.ino - 1) as u64) / g.inodes_per_group;
            gdt[group as usize].directories += 1;
        }
    }

    Ok(Geometry { fixed: *fixed, block_bitmap, inode_bitmap, gdt, mapper })
}

fn directory_children_for(tree: &FileTree, plan: &Plan, dir_idx: usize) -> Vec<DirChild> {
    let self_ino = plan.ino_of(dir_idx);
    let parent_ino = plan.ino_of(tree.parent(dir_idx));
    let mut children = crate::common::planned_node::directory_children(tree, dir_idx, self_ino, parent_ino);
    for &child_idx in tree.children(dir_idx) {
        children.push(DirChild {
            name: tree.name(child_idx).to_string(),
            inode: plan.ino_of(child_idx),
            file_type: node_file_type(tree, child_idx),
        });
    }
    children
}

fn render_directory(tree: &FileTree, plan: &Plan, dir_idx: usize) -> Vec<u8> {
    let children = directory_children_for(tree, plan, dir_idx);
    let blocks = dirent::layout(&children);
    let mut buf = Vec::with_capacity(blocks.len() * BLOCK_SIZE as usize);
    for block in &blocks {
        dirent::write_block(block, &mut buf).expect("writing to a Vec cannot fail");
    }
    buf
}

enum Source {
    Bytes(std::io::Cursor<Vec<u8>>),
    Reader(Box<dyn Read>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::Bytes(c) => c.read(buf),
            Source::Reader(r) => r.read(buf),
        }
    }
}

/// Walks every planned node's `fs` range in `start` order, handing back one
/// block at a time and deciding data-vs-pointer via `ext2_block_type`
/// (spec §4.6).
struct Streamer<'a> {
    tree: &'a mut FileTree,
    plan: &'a Plan,
    order: Vec<&'a PlannedNode>,
    idx: usize,
    local_pos: u64,
    source: Option<Source>,
}

impl<'a> Streamer<'a> {
    fn new(tree: &'a mut FileTree, plan: &'a Plan) -> Self {
        Self { tree, plan, order: plan.iter_by_start(), idx: 0, local_pos: 0, source: None }
    }

    fn current(&self) -> Option<&'a PlannedNode> {
        self.order.get(self.idx).copied()
    }

    fn ensure_source(&mut self) -> Result<()> {
        if self.source.is_some() {
            return Ok(());
        }
        let node = self.current().expect("ensure_source called past the end");
        let src = if self.tree.is_dir(node.tree_idx) {
            Source::Bytes(std::io::Cursor::new(render_directory(self.tree, self.plan, node.tree_idx)))
        } else {
            Source::Reader(self.tree.open_reader(node.tree_idx)?)
        };
        self.source = Some(src);
        Ok(())
    }

    fn advance_to_next_node(&mut self) {
        if let Some(node) = self.current() {
            self.tree.close(node.tree_idx);
        }
        self.source = None;
        self.idx += 1;
        self.local_pos = 0;
    }

    /// Produces the next global-order block (one full `BLOCK_SIZE` buffer).
    /// Once every planned node's range has been streamed, the remainder of
    /// the image's data region is free space and reads back as zeros.
    fn next_block(&mut self, mapper: &Mapper) -> Result<Vec<u8>> {
        loop {
            let node = match self.current() {
                Some(n) => n,
                None => return Ok(vec![0u8; BLOCK_SIZE as usize]),
            };
            if self.local_pos >= node.fs {
                self.advance_to_next_node();
                continue;
            }
            self.ensure_source()?;
            let i = self.local_pos;
            self.local_pos += 1;
            let block_type = ext2_block_type(i);
            return if block_type == 0 {
                self.read_content_block()
            } else {
                Ok(self.write_pointer_block(node, i, block_type, mapper))
            };
        }
    }

    fn read_content_block(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let mut filled = 0usize;
        if let Some(src) = self.source.as_mut() {
            while filled < buf.len() {
                let n = src.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
        }
        Ok(buf)
    }

    fn write_pointer_block(&self, node: &PlannedNode, i: u64, block_type: u64, mapper: &Mapper) -> Vec<u8> {
        let p = crate::arith::POINTERS_PER_BLOCK;
        let stride = match block_type {
            1 => 1,
            2 => 1 + p,
            3 => 1 + p + p * p,
            _ => unreachable!("block_type is always 0..=3"),
        };
        let remaining_positions = node.fs.saturating_sub(i + 1);
        let count = divide(remaining_positions, stride).min(p);

        let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);
        for k in 0..count {
            let local_target = i + 1 + k * stride;
            let global_n = (node.start + local_target as i64) as u64;
            let addr = mapper.absolute(global_n);
            buf.write_u32::<LittleEndian>(addr as u32).expect("writing to a Vec cannot fail");
        }
        buf.resize(BLOCK_SIZE as usize, 0);
        buf
    }
}

fn write_superblock_block<W: Write>(group: u64, sb: &Superblock, w: &mut W) -> Result<()> {
    let mut written = 0usize;
    if group == 0 {
        w.write_all(&[0u8; 1024])?;
        written += 1024;
    }
    let mut buf = Vec::with_capacity(superblock::SUPERBLOCK_WIRE_SIZE);
    sb.write_le(&mut buf)?;
    w.write_all(&buf)?;
    written += buf.len();
    w.write_all(&vec![0u8; BLOCK_SIZE as usize - written])?;
    Ok(())
}

fn write_bgdt<W: Write>(gdt: &[GroupDescriptor], bgdt_blocks: u64, w: &mut W) -> Result<()> {
    let mut buf = Vec::with_capacity((bgdt_blocks * BLOCK_SIZE) as usize);
    for desc in gdt {
        desc.write_le(&mut buf)?;
    }
    buf.resize((bgdt_blocks * BLOCK_SIZE) as usize, 0);
    w.write_all(&buf)?;
    Ok(())
}

fn build_superblock(tree: &FileTree, plan: &Plan, fixed: &FixedGeometry, geometry: &Geometry, now: u32) -> Superblock {
    let mut sb = Superblock::new();
    sb.inodes_count = (fixed.groups * fixed.geometry.inodes_per_group) as u32;
    sb.blocks_count = fixed.blocks as u32;
    sb.free_blocks_count = geometry.gdt.iter().map(|d| d.free_blocks as u64).sum::<u64>() as u32;
    sb.free_inodes_count = geometry.gdt.iter().map(|d| d.free_inodes as u64).sum::<u64>() as u32;
    sb.first_data_block = 0;
    sb.log_block_size = (BLOCK_SIZE / 1024).trailing_zeros();
    sb.log_frag_size = sb.log_block_size;
    sb.blocks_per_group = BLOCKS_PER_GROUP as u32;
    sb.frags_per_group = BLOCKS_PER_GROUP as u32;
    sb.inodes_per_group = fixed.geometry.inodes_per_group as u32;
    sb.mtime = now;
    sb.wtime = now;
    sb.max_mnt_count = u16::MAX;
    sb.first_ino = INO_FIRST_FREE;
    sb.inode_size = INODE_SIZE as u16;
    let _ = (tree, plan);
    sb
}

fn inode_slot_for(ino: u32, inodes_per_group: u64) -> (u64, u64) {
    let zero_based = (ino - 1) as u64;
    (zero_based / inodes_per_group, zero_based % inodes_per_group)
}

fn build_inode(tree: &FileTree, plan: &Plan, node: &PlannedNode, mapper: &Mapper, now: u32) -> Ext2Inode {
    let mut inode = Ext2Inode::default();
    let is_dir = tree.is_dir(node.tree_idx);
    let is_symlink = tree.is_symlink(node.tree_idx);
    inode.mode = DEFAULT_PERMISSIONS
        | if is_dir {
            S_IFDIR
        } else if is_symlink {
            S_IFLNK
        } else {
            S_IFREG
        };
    let mtime = if node.tree_idx == crate::tree::ROOT { now as i64 } else { tree.modified(node.tree_idx).timestamp() };
    inode.atime = mtime as u32;
    inode.ctime = mtime as u32;
    inode.mtime = mtime as u32;

    let size = if is_dir {
        node.content * BLOCK_SIZE
    } else {
        tree.size(node.tree_idx)
    };
    inode.size_lo = size as u32;
    inode.size_hi = (size >> 32) as u32;
    inode.sectors = (node.fs * SECTORS_PER_BLOCK) as u32;
    inode.links = if is_dir {
        2 + tree.children(node.tree_idx).iter().filter(|&&c| tree.is_dir(c)).count() as u16
    } else {
        1
    };

    // Lay out the direct/single/double/triple block pointers by re-running
    // the same block-type classification the streamer used, so the
    // pointer slots line up with what was actually written.
    let mut direct_idx = 0usize;
    for i in 0..node.fs {
        let global_n = (node.start + i as i64) as u64;
        let addr = mapper.absolute(global_n) as u32;
        match ext2_block_type(i) {
            0 if direct_idx < crate::ext2::inode::DIRECT_POINTERS => {
                inode.direct_mut()[direct_idx] = addr;
                direct_idx += 1;
            }
            0 => {}
            1 => inode.set_single(addr),
            2 => inode.set_double(addr),
            3 => inode.set_triple(addr),
            _ => unreachable!(),
        }
    }
    let _ = plan;
    inode
}

/// Writes the complete image (spec §4.6). `now` is the mtime stamped on the
/// superblock and the root directory.
pub fn write<S: Sink>(
    tree: &mut FileTree,
    plan: &Plan,
    geometry: &Geometry,
    sink: &mut S,
    cancel: &CancellationToken,
    now: u32,
) -> Result<()> {
    let fixed = &geometry.fixed;
    let sb = build_superblock(tree, plan, fixed, geometry, now);

    // Inode table bytes, built once up front since every slot's address is
    // already fixed by the geometry.
    let inodes_per_group = fixed.geometry.inodes_per_group;
    let mut inode_slots: Vec<Vec<u8>> = vec![vec![0u8; INODE_SIZE as usize]; (fixed.groups * inodes_per_group) as usize];
    for node in plan.iter() {
        let inode = build_inode(tree, plan, node, &geometry.mapper, now);
        let mut buf = Vec::with_capacity(INODE_SIZE as usize);
        inode.write_le(&mut buf)?;
        inode_slots[(node.ino - 1) as usize] = buf;
    }

    let mut streamer = Streamer::new(tree, plan);

    for group in 0..fixed.groups {
        cancel.check()?;
        let group_start = group * BLOCKS_PER_GROUP;
        sink.seek(std::io::SeekFrom::Start(group_start * BLOCK_SIZE))?;

        write_superblock_block(group, &sb, sink)?;
        write_bgdt(&geometry.gdt, fixed.geometry.bgdt_blocks, sink)?;
        sink.write_all(&geometry.block_bitmap.serialize_range(group_start, BLOCKS_PER_GROUP))?;
        sink.write_all(&geometry.inode_bitmap.serialize_group_block(group * inodes_per_group, inodes_per_group))?;

        for slot in 0..inodes_per_group {
            let (g, _) = inode_slot_for((group * inodes_per_group + slot + 1) as u32, inodes_per_group);
            debug_assert_eq!(g, group);
            sink.write_all(&inode_slots[(group * inodes_per_group + slot) as usize])?;
        }

        let data_blocks_this_group = blocks_in_group(fixed, group).saturating_sub(fixed.geometry.overhead_per_group);
        for _ in 0..data_blocks_this_group {
            cancel.check()?;
            let block = streamer.next_block(&geometry.mapper)?;
            sink.write_all(&block)?;
        }
    }

    sink.seek(std::io::SeekFrom::Start(fixed.blocks * BLOCK_SIZE))?;
    Ok(())
}
