//! Streaming writer for ext4 (spec §4.6). Block and inode bitmaps concentrate
//! into one flex-sized region per flex group (spec §4.5); the rest of each
//! flex's span is a single contiguous data run, which is what lets files
//! larger than a few blocks stay inside the inline extent tree.

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::arith::divide;
use crate::cancel::CancellationToken;
use crate::common::bitmap::Bitmap;
use crate::common::constants::*;
use crate::common::dirent::DirChild;
use crate::common::gdt::GroupDescriptor;
use crate::common::planned_node::{node_file_type, Plan, PlannedNode, SYNTHETIC_NODE};
use crate::common::superblock::{self, feature_compat, feature_incompat, feature_ro_compat, Superblock};
use crate::error::Result;
use crate::ext4::directory;
use crate::ext4::extent::{self, Extent};
use crate::ext4::inode::{Ext4Inode, EXT4_EXTENTS_FL};
use crate::ext4::journal::JournalSuperblock;
use crate::ext4::planner::{bgdt_blocks, flex0_extra, reserved_gdt_blocks, FixedGeometry};
use crate::sink::Sink;
use crate::tree::FileTree;
use uuid::Uuid;

/// Flex-aware logical-to-physical mapping (spec §4.5). Bitmaps and inode
/// tables for every group in a flex concentrate at the flex's start, so a
/// flex's data region is one contiguous run.
pub struct Mapper {
    fixed: FixedGeometry,
}

fn blocks_in_group(fixed: &FixedGeometry, group: u64) -> u64 {
    let group_start = group * BLOCKS_PER_GROUP;
    BLOCKS_PER_GROUP.min(fixed.blocks.saturating_sub(group_start))
}

impl Mapper {
    fn groups_in_flex(&self, flex_idx: u64) -> u64 {
        let start = flex_idx * self.fixed.groups_per_flex;
        self.fixed.groups_per_flex.min(self.fixed.groups.saturating_sub(start))
    }

    fn flex_total_blocks(&self, flex_idx: u64) -> u64 {
        let gpf = self.fixed.groups_per_flex;
        let start_group = flex_idx * gpf;
        let end_group = (start_group + gpf).min(self.fixed.groups);
        (start_group..end_group).map(|g| blocks_in_group(&self.fixed, g)).sum()
    }

    fn concentrated_overhead(&self, flex_idx: u64) -> u64 {
        self.groups_in_flex(flex_idx) * self.fixed.geometry.overhead_per_group
            + if flex_idx == 0 { flex0_extra(self.fixed.groups) } else { 0 }
    }

    fn flex_start_addr(&self, flex_idx: u64) -> u64 {
        flex_idx * self.fixed.groups_per_flex * BLOCKS_PER_GROUP
    }

    fn overhead_base(&self, flex_idx: u64) -> u64 {
        self.flex_start_addr(flex_idx) + if flex_idx == 0 { flex0_extra(self.fixed.groups) } else { 0 }
    }

    fn flex_data_start(&self, flex_idx: u64) -> u64 {
        self.flex_start_addr(flex_idx) + self.concentrated_overhead(flex_idx)
    }

    fn flex_content(&self, flex_idx: u64) -> u64 {
        self.flex_total_blocks(flex_idx).saturating_sub(self.concentrated_overhead(flex_idx))
    }

    fn flex_count(&self) -> u64 {
        divide(self.fixed.groups, self.fixed.groups_per_flex)
    }

    /// Maps logical data block `n` to `(absolute_address, run_length)`, the
    /// address and the number of further logical blocks contiguous with it
    /// before the next flex boundary (spec §4.5).
    pub fn locate(&self, n: u64) -> (u64, u64) {
        let mut base = 0u64;
        let mut flex_idx = 0u64;
        loop {
            let cap = self.flex_content(flex_idx);
            if n < base + cap || flex_idx + 1 >= self.flex_count() {
                let within = n.saturating_sub(base);
                return (self.flex_data_start(flex_idx) + within, cap.saturating_sub(within));
            }
            base += cap;
            flex_idx += 1;
        }
    }

    fn block_bitmap_addr(&self, group: u64) -> u64 {
        let flex_idx = group / self.fixed.groups_per_flex;
        let j = group % self.fixed.groups_per_flex;
        self.overhead_base(flex_idx) + j
    }

    fn inode_bitmap_addr(&self, group: u64) -> u64 {
        let flex_idx = group / self.fixed.groups_per_flex;
        let gpf_here = self.groups_in_flex(flex_idx);
        let j = group % self.fixed.groups_per_flex;
        self.overhead_base(flex_idx) + gpf_here + j
    }

    fn inode_table_addr(&self, group: u64) -> u64 {
        let flex_idx = group / self.fixed.groups_per_flex;
        let gpf_here = self.groups_in_flex(flex_idx);
        let j = group % self.fixed.groups_per_flex;
        self.overhead_base(flex_idx) + gpf_here * 2 + j * self.fixed.geometry.inode_table_blocks
    }
}

/// A node's content begins one block past its own `start` when it needs an
/// external extent-index block (spec §4.6: "emit it as the first of the fs
/// blocks").
fn content_start(node: &PlannedNode) -> u64 {
    node.start as u64 + if node.fs > node.content { 1 } else { 0 }
}

pub struct Geometry {
    pub fixed: FixedGeometry,
    pub block_bitmap: Bitmap,
    pub inode_bitmap: Bitmap,
    pub gdt: Vec<GroupDescriptor>,
    pub mapper: Mapper,
}

/// Builds the bitmaps and group-descriptor table for a fixed geometry (spec
/// §4.5 ext4 branch). `plan` already carries the synthetic journal and
/// resize entries.
pub fn build_geometry(tree: &FileTree, plan: &Plan, fixed: &FixedGeometry) -> Result<Geometry> {
    let mapper = Mapper { fixed: *fixed };
    let groups = fixed.groups;
    let g = fixed.geometry;

    let mut block_bitmap = Bitmap::new(fixed.blocks);
    let flex_count = mapper.flex_count();
    for flex_idx in 0..flex_count {
        let start = mapper.flex_start_addr(flex_idx);
        let overhead = mapper.concentrated_overhead(flex_idx).min(mapper.flex_total_blocks(flex_idx));
        block_bitmap.set_range(start, overhead);
    }

    let mut remaining_data = plan.filled_data_blocks;
    for flex_idx in 0..flex_count {
        if remaining_data == 0 {
            break;
        }
        let cap = mapper.flex_content(flex_idx);
        let used = remaining_data.min(cap);
        block_bitmap.set_range(mapper.flex_data_start(flex_idx), used);
        remaining_data -= used;
    }
    block_bitmap.pad_final_word();

    let mut gdt = Vec::with_capacity(groups as usize);
    for group in 0..groups {
        gdt.push(GroupDescriptor {
            block_bitmap_addr: mapper.block_bitmap_addr(group) as u32,
            inode_bitmap_addr: mapper.inode_bitmap_addr(group) as u32,
            inode_table_addr: mapper.inode_table_addr(group) as u32,
            free_blocks: 0,
            free_inodes: 0,
            directories: 0,
            flags: 0,
        });
    }
    for group in 0..groups {
        let group_start = group * BLOCKS_PER_GROUP;
        let span = blocks_in_group(fixed, group);
        let used = block_bitmap.count_set(group_start, span);
        gdt[group as usize].free_blocks = (span - used).min(u16::MAX as u64) as u16;
    }

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
        if node.tree_idx != SYNTHETIC_NODE && tree.is_dir(node.tree_idx) {
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

/// Walks every planned node's `fs` range in `start` order. A node whose
/// `fs` exceeds its `content` emits one external extent-index block before
/// its content (spec §4.6).
struct Streamer<'a> {
    tree: &'a mut FileTree,
    plan: &'a Plan,
    synthetic: &'a HashMap<u32, Vec<u8>>,
    order: Vec<&'a PlannedNode>,
    idx: usize,
    local_pos: u64,
    source: Option<Source>,
}

impl<'a> Streamer<'a> {
    fn new(tree: &'a mut FileTree, plan: &'a Plan, synthetic: &'a HashMap<u32, Vec<u8>>) -> Self {
        Self { tree, plan, synthetic, order: plan.iter_by_start(), idx: 0, local_pos: 0, source: None }
    }

    fn current(&self) -> Option<&'a PlannedNode> {
        self.order.get(self.idx).copied()
    }

    fn ensure_source(&mut self) -> Result<()> {
        if self.source.is_some() {
            return Ok(());
        }
        let node = self.current().expect("ensure_source called past the end");
        let src = if node.tree_idx == SYNTHETIC_NODE {
            Source::Bytes(std::io::Cursor::new(self.synthetic[&node.ino].clone()))
        } else if self.tree.is_dir(node.tree_idx) {
            let children = directory_children_for(self.tree, self.plan, node.tree_idx);
            Source::Bytes(std::io::Cursor::new(directory::render(&children)?))
        } else {
            Source::Reader(self.tree.open_reader(node.tree_idx)?)
        };
        self.source = Some(src);
        Ok(())
    }

    fn advance_to_next_node(&mut self) {
        if let Some(node) = self.current() {
            if node.tree_idx != SYNTHETIC_NODE {
                self.tree.close(node.tree_idx);
            }
        }
        self.source = None;
        self.idx += 1;
        self.local_pos = 0;
    }

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
            let needs_external = node.fs > node.content;
            if needs_external && self.local_pos == 0 {
                self.local_pos += 1;
                return self.external_block(node, mapper);
            }
            self.ensure_source()?;
            self.local_pos += 1;
            return self.read_content_block();
        }
    }

    fn external_block(&self, node: &PlannedNode, mapper: &Mapper) -> Result<Vec<u8>> {
        let extents = build_extents_for_node(node, mapper)?;
        let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);
        extent::write_external_block(&mut buf, &extents)?;
        Ok(buf)
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
}

fn build_extents_for_node(node: &PlannedNode, mapper: &Mapper) -> Result<Vec<Extent>> {
    let locate = |n: u64| mapper.locate(n);
    extent::build_extents(content_start(node), node.content, &locate)
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

fn build_superblock(fixed: &FixedGeometry, geometry: &Geometry, now: u32) -> Superblock {
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

    sb.feature_compat = feature_compat::HAS_JOURNAL | feature_compat::RESIZE_INODE | feature_compat::DIR_INDEX;
    sb.feature_incompat = feature_incompat::FILETYPE | feature_incompat::EXTENTS | feature_incompat::FLEX_BG;
    sb.feature_ro_compat = feature_ro_compat::SPARSE_SUPER | feature_ro_compat::LARGE_FILE;
    sb.journal_inum = INO_JOURNAL;
    sb.def_hash_version = 2; // TEA unsigned, matching ext4::hash and ext4::directory
    sb.desc_size = GROUP_DESC_SIZE as u16;
    sb.mkfs_time = now;
    sb.log_groups_per_flex = fixed.groups_per_flex.trailing_zeros() as u8;
    sb.checksum_type = 1;
    sb.reserved_gdt_blocks = reserved_gdt_blocks(fixed.groups).min(u16::MAX as u64) as u16;
    sb.uuid = derive_uuid(fixed, sb.inodes_count, sb.blocks_count);

    sb
}

/// Deterministic `s_uuid`: a version-5 (name-based) UUID seeded from the
/// fixed geometry, so repeated compiles of the same tree at the same size
/// produce byte-identical images (spec §8 property #10) without reaching
/// for a random generator.
fn derive_uuid(fixed: &FixedGeometry, inodes_count: u32, blocks_count: u32) -> [u8; 16] {
    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&fixed.groups.to_le_bytes());
    seed.extend_from_slice(&fixed.groups_per_flex.to_le_bytes());
    seed.extend_from_slice(&inodes_count.to_le_bytes());
    seed.extend_from_slice(&blocks_count.to_le_bytes());
    *Uuid::new_v5(&Uuid::NAMESPACE_OID, &seed).as_bytes()
}

fn inode_slot_for(ino: u32, inodes_per_group: u64) -> (u64, u64) {
    let zero_based = (ino - 1) as u64;
    (zero_based / inodes_per_group, zero_based % inodes_per_group)
}

fn inline_symlink_bytes(tree: &mut FileTree, idx: usize) -> Result<Vec<u8>> {
    let size = tree.size(idx) as usize;
    let mut reader = tree.open_reader(idx)?;
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Builds the extent-mapped inode shared by regular files, directories and
/// non-inline symlinks, plus the journal (spec §4.6, §4.7: the journal is
/// addressed the same way an ordinary file would be).
fn build_extent_inode(
    mode: u16,
    size: u64,
    links: u16,
    mtime: u32,
    node: &PlannedNode,
    mapper: &Mapper,
) -> Result<Ext4Inode> {
    let mut inode = Ext4Inode::default();
    inode.mode = mode;
    inode.atime = mtime;
    inode.ctime = mtime;
    inode.mtime = mtime;
    inode.size_lo = size as u32;
    inode.size_hi = (size >> 32) as u32;
    inode.sectors = (node.fs * SECTORS_PER_BLOCK) as u32;
    inode.links = links;
    inode.flags |= EXT4_EXTENTS_FL;

    let needs_external = node.fs > node.content;
    let mut block_buf = Vec::with_capacity(60);
    if needs_external {
        let addr = mapper.locate(node.start as u64).0;
        extent::write_inline_index(&mut block_buf, addr)?;
    } else {
        let extents = build_extents_for_node(node, mapper)?;
        extent::write_inline(&mut block_buf, &extents)?;
    }
    inode.block.copy_from_slice(&block_buf);
    Ok(inode)
}

fn build_inode(tree: &mut FileTree, plan: &Plan, node: &PlannedNode, mapper: &Mapper, now: u32) -> Result<Ext4Inode> {
    let is_dir = tree.is_dir(node.tree_idx);
    let is_symlink = tree.is_symlink(node.tree_idx);
    let mtime = if node.tree_idx == crate::tree::ROOT { now } else { tree.modified(node.tree_idx).timestamp() as u32 };

    let links = if is_dir {
        2 + tree.children(node.tree_idx).iter().filter(|&&c| tree.is_dir(c)).count() as u16
    } else {
        1
    };

    // A fast symlink: target stored directly in the inode's block area, no
    // extent tree at all.
    if is_symlink && node.content == 0 && node.fs == 0 {
        let mut inode = Ext4Inode::default();
        inode.mode = DEFAULT_PERMISSIONS | S_IFLNK;
        inode.atime = mtime;
        inode.ctime = mtime;
        inode.mtime = mtime;
        inode.links = 1;
        let bytes = inline_symlink_bytes(tree, node.tree_idx)?;
        inode.size_lo = bytes.len() as u32;
        inode.block[..bytes.len()].copy_from_slice(&bytes);
        return Ok(inode);
    }

    let mode = DEFAULT_PERMISSIONS
        | if is_dir {
            S_IFDIR
        } else if is_symlink {
            S_IFLNK
        } else {
            S_IFREG
        };
    let size = if is_dir { node.content * BLOCK_SIZE } else { tree.size(node.tree_idx) };
    build_extent_inode(mode, size, links, mtime, node, mapper)
}

/// Renders the resize inode's classic double-indirect pointer layout (spec
/// §4.7): `block` slot 13 (the DIND slot) addresses a single indirect block
/// whose entries are the reserved-GDT block addresses. This crate keeps one
/// superblock/BGDT installation (at group 0), so that single indirect block
/// is all the resize inode needs — see DESIGN.md.
fn build_resize_inode(node: &PlannedNode, fixed: &FixedGeometry, mapper: &Mapper, now: u32) -> Result<Ext4Inode> {
    let mut inode = Ext4Inode::default();
    inode.mode = DEFAULT_PERMISSIONS | S_IFREG;
    inode.atime = now;
    inode.ctime = now;
    inode.mtime = now;
    inode.links = 1;
    let size = node.content * BLOCK_SIZE;
    inode.size_lo = size as u32;
    inode.size_hi = (size >> 32) as u32;
    // Per spec §9 open question (b): i_blocks counts the reserved-GDT blocks
    // the indirect block addresses, plus the indirect block itself.
    inode.sectors = ((reserved_gdt_blocks(fixed.groups) + 1) * SECTORS_PER_BLOCK) as u32;

    let dind_addr = mapper.locate(node.start as u64).0;
    let mut w = &mut inode.block[..];
    w.write_u32::<LittleEndian>(0)?; // direct[0..12] unused
    for _ in 0..11 {
        w.write_u32::<LittleEndian>(0)?;
    }
    w.write_u32::<LittleEndian>(0)?; // single indirect unused
    w.write_u32::<LittleEndian>(dind_addr as u32)?; // double indirect
    w.write_u32::<LittleEndian>(0)?; // triple indirect unused
    Ok(inode)
}

/// The reserved-GDT growth region sits right after the superblock and BGDT
/// at the start of flex 0 (spec §4.4); the resize inode's single indirect
/// block just lists those addresses.
fn render_resize_block(fixed: &FixedGeometry, mapper: &Mapper) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);
    let reserved = reserved_gdt_blocks(fixed.groups);
    let base = mapper.overhead_base(0) - reserved;
    for i in 0..reserved {
        buf.write_u32::<LittleEndian>((base + i) as u32).expect("writing to a Vec cannot fail");
    }
    buf.resize(BLOCK_SIZE as usize, 0);
    buf
}

fn render_journal_block(journal_blocks: u64) -> Vec<u8> {
    let sb = JournalSuperblock::new(journal_blocks as u32);
    let mut buf = Vec::new();
    sb.write_be(&mut buf).expect("writing to a Vec cannot fail");
    buf
}

/// Writes the complete image (spec §4.6). `plan` must already carry the
/// synthetic journal (`INO_JOURNAL`) and resize (`INO_RESIZE`) entries.
pub fn write<S: Sink>(
    tree: &mut FileTree,
    plan: &Plan,
    geometry: &Geometry,
    sink: &mut S,
    cancel: &CancellationToken,
    now: u32,
) -> Result<()> {
    let fixed = &geometry.fixed;
    let mapper = &geometry.mapper;
    let sb = build_superblock(fixed, geometry, now);

    let journal_node = plan.get(INO_JOURNAL);
    let resize_node = plan.get(INO_RESIZE);
    debug_assert_eq!(resize_node.content, 1, "the resize inode holds exactly one indirect block");

    let mut synthetic: HashMap<u32, Vec<u8>> = HashMap::new();
    synthetic.insert(INO_RESIZE, render_resize_block(fixed, mapper));
    // The journal's own content is streamed in full as its "content"; only
    // the first of its `content` blocks carries the JBD2 superblock, the
    // rest are zero. The streamer reads this straight through like a file,
    // so stage the whole thing up front.
    let mut journal_bytes = vec![0u8; (journal_node.content * BLOCK_SIZE) as usize];
    let first_block = render_journal_block(journal_node.content);
    journal_bytes[..first_block.len()].copy_from_slice(&first_block);
    synthetic.insert(INO_JOURNAL, journal_bytes);

    let inodes_per_group = fixed.geometry.inodes_per_group;
    let mut inode_slots: Vec<Vec<u8>> = vec![vec![0u8; INODE_SIZE as usize]; (fixed.groups * inodes_per_group) as usize];
    for node in plan.iter() {
        let inode = if node.ino == INO_RESIZE {
            build_resize_inode(node, fixed, mapper, now)?
        } else if node.ino == INO_JOURNAL {
            build_extent_inode(DEFAULT_PERMISSIONS | S_IFREG, node.content * BLOCK_SIZE, 1, now, node, mapper)?
        } else {
            build_inode(tree, plan, node, mapper, now)?
        };
        let mut buf = Vec::with_capacity(INODE_SIZE as usize);
        inode.write_le(&mut buf)?;
        inode_slots[(node.ino - 1) as usize] = buf;
    }

    let mut streamer = Streamer::new(tree, plan, &synthetic);

    for flex_idx in 0..mapper.flex_count() {
        cancel.check()?;
        let flex_start = mapper.flex_start_addr(flex_idx);
        sink.seek(SeekFrom::Start(flex_start * BLOCK_SIZE))?;

        if flex_idx == 0 {
            write_superblock_block(0, &sb, sink)?;
            write_bgdt(&geometry.gdt, bgdt_blocks(fixed.groups), sink)?;
            sink.write_all(&vec![0u8; (reserved_gdt_blocks(fixed.groups) * BLOCK_SIZE) as usize])?;
        }

        let groups_here = mapper.groups_in_flex(flex_idx);
        let start_group = flex_idx * fixed.groups_per_flex;
        for j in 0..groups_here {
            let g = start_group + j;
            sink.write_all(&geometry.block_bitmap.serialize_range(g * BLOCKS_PER_GROUP, BLOCKS_PER_GROUP))?;
        }
        for j in 0..groups_here {
            let g = start_group + j;
            sink.write_all(&geometry.inode_bitmap.serialize_group_block(g * inodes_per_group, inodes_per_group))?;
        }
        for j in 0..groups_here {
            let g = start_group + j;
            for slot in 0..inodes_per_group {
                let (gg, _) = inode_slot_for((g * inodes_per_group + slot + 1) as u32, inodes_per_group);
                debug_assert_eq!(gg, g);
                sink.write_all(&inode_slots[(g * inodes_per_group + slot) as usize])?;
            }
        }

        let data_blocks_this_flex = mapper.flex_content(flex_idx);
        for _ in 0..data_blocks_this_flex {
            cancel.check()?;
            let block = streamer.next_block(mapper)?;
            sink.write_all(&block)?;
        }
    }

    sink.seek(SeekFrom::Start(fixed.blocks * BLOCK_SIZE))?;
    Ok(())
}
