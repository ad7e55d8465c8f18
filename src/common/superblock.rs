//! The on-disk superblock record (spec §6.3). ext2 and ext4 share one
//! layout; ext4 only exercises the fields spec.md calls out as additions
//! (journal inode, hash seed/version, descriptor size, flex-group log,
//! checksum type, reserved-GDT block count) — ext2 leaves them zeroed.

use byteorder::{LittleEndian, WriteBytesExt};
use static_assertions::const_assert_eq;
use std::io::{self, Write};

use crate::common::constants::SUPERBLOCK_MAGIC;

/// The superblock record itself, before the padding that fills out the rest
/// of its containing block.
pub const SUPERBLOCK_WIRE_SIZE: usize = 1024;

/// Feature flags this implementation sets (spec §6.3). Real Linux defines
/// many more; only the ones the compiler actually emits are named.
pub mod feature_compat {
    pub const DIR_PREALLOC: u32 = 0x0001;
    pub const HAS_JOURNAL: u32 = 0x0004;
    pub const RESIZE_INODE: u32 = 0x0010;
    pub const DIR_INDEX: u32 = 0x0020;
    pub const SPARSE_SUPER2: u32 = 0x0200;
}
pub mod feature_incompat {
    pub const FILETYPE: u32 = 0x0002;
    pub const EXTENTS: u32 = 0x0040;
    pub const FLEX_BG: u32 = 0x0200;
    pub const INLINE_DATA: u32 = 0x8000;
}
pub mod feature_ro_compat {
    pub const SPARSE_SUPER: u32 = 0x0001;
    pub const LARGE_FILE: u32 = 0x0002;
}

pub const OS_LINUX: u32 = 0;
pub const STATE_CLEAN: u16 = 1;
pub const ERRORS_CONTINUE: u16 = 1;
pub const REV_DYNAMIC: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // Dynamic (rev 1) fields.
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algo_bitmap: u32,

    // Journaling / ext4 additions (spec §6.3).
    pub journal_inum: u32,
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub jnl_backup_type: u8,
    pub desc_size: u16,
    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
    pub mkfs_time: u32,
    pub log_groups_per_flex: u8,
    pub checksum_type: u8,
    pub reserved_gdt_blocks: u16,
}

impl Superblock {
    pub fn new() -> Self {
        Self {
            rev_level: REV_DYNAMIC,
            state: STATE_CLEAN,
            errors: ERRORS_CONTINUE,
            creator_os: OS_LINUX,
            ..Default::default()
        }
    }

    pub fn write_le<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut w = Counting::new(out);
        w.write_u32::<LittleEndian>(self.inodes_count)?;
        w.write_u32::<LittleEndian>(self.blocks_count)?;
        w.write_u32::<LittleEndian>(self.r_blocks_count)?;
        w.write_u32::<LittleEndian>(self.free_blocks_count)?;
        w.write_u32::<LittleEndian>(self.free_inodes_count)?;
        w.write_u32::<LittleEndian>(self.first_data_block)?;
        w.write_u32::<LittleEndian>(self.log_block_size)?;
        w.write_u32::<LittleEndian>(self.log_frag_size)?;
        w.write_u32::<LittleEndian>(self.blocks_per_group)?;
        w.write_u32::<LittleEndian>(self.frags_per_group)?;
        w.write_u32::<LittleEndian>(self.inodes_per_group)?;
        w.write_u32::<LittleEndian>(self.mtime)?;
        w.write_u32::<LittleEndian>(self.wtime)?;
        w.write_u16::<LittleEndian>(self.mnt_count)?;
        w.write_u16::<LittleEndian>(self.max_mnt_count)?;
        w.write_u16::<LittleEndian>(SUPERBLOCK_MAGIC)?;
        w.write_u16::<LittleEndian>(self.state)?;
        w.write_u16::<LittleEndian>(self.errors)?;
        w.write_u16::<LittleEndian>(self.minor_rev_level)?;
        w.write_u32::<LittleEndian>(self.lastcheck)?;
        w.write_u32::<LittleEndian>(self.checkinterval)?;
        w.write_u32::<LittleEndian>(self.creator_os)?;
        w.write_u32::<LittleEndian>(self.rev_level)?;
        w.write_u16::<LittleEndian>(self.def_resuid)?;
        w.write_u16::<LittleEndian>(self.def_resgid)?;

        w.write_u32::<LittleEndian>(self.first_ino)?;
        w.write_u16::<LittleEndian>(self.inode_size)?;
        w.write_u16::<LittleEndian>(self.block_group_nr)?;
        w.write_u32::<LittleEndian>(self.feature_compat)?;
        w.write_u32::<LittleEndian>(self.feature_incompat)?;
        w.write_u32::<LittleEndian>(self.feature_ro_compat)?;
        w.write_all(&self.uuid)?;
        w.write_all(&self.volume_name)?;
        w.write_all(&self.last_mounted)?;
        w.write_u32::<LittleEndian>(self.algo_bitmap)?;

        // Preallocation hints and the journal UUID: unused here.
        w.write_all(&[0u8; 2])?; // s_prealloc_blocks
        w.write_all(&[0u8; 2])?; // s_prealloc_dir_blocks
        w.write_all(&[0u8; 2])?; // s_padding1 / s_reserved_gdt_blocks placeholder (set below instead)
        w.write_all(&[0u8; 16])?; // s_journal_uuid

        w.write_u32::<LittleEndian>(self.journal_inum)?;
        w.write_u32::<LittleEndian>(0)?; // s_journal_dev
        w.write_u32::<LittleEndian>(0)?; // s_last_orphan
        for seed in self.hash_seed {
            w.write_u32::<LittleEndian>(seed)?;
        }
        w.write_u8(self.def_hash_version)?;
        w.write_u8(self.jnl_backup_type)?;
        w.write_u16::<LittleEndian>(self.desc_size)?;
        w.write_u32::<LittleEndian>(self.default_mount_opts)?;
        w.write_u32::<LittleEndian>(self.first_meta_bg)?;
        w.write_u32::<LittleEndian>(self.mkfs_time)?;
        w.write_all(&[0u8; 4 * 17])?; // s_jnl_blocks

        w.write_u32::<LittleEndian>(0)?; // s_blocks_count_hi
        w.write_u32::<LittleEndian>(0)?; // s_r_blocks_count_hi
        w.write_u32::<LittleEndian>(0)?; // s_free_blocks_count_hi
        w.write_u16::<LittleEndian>(0)?; // s_min_extra_isize
        w.write_u16::<LittleEndian>(0)?; // s_want_extra_isize
        w.write_u32::<LittleEndian>(0)?; // s_flags
        w.write_u16::<LittleEndian>(0)?; // s_raid_stride
        w.write_u16::<LittleEndian>(0)?; // s_mmp_update_interval
        w.write_u64::<LittleEndian>(0)?; // s_mmp_block
        w.write_u32::<LittleEndian>(0)?; // s_raid_stripe_width
        w.write_u8(self.log_groups_per_flex)?;
        w.write_u8(self.checksum_type)?;
        w.write_u16::<LittleEndian>(self.reserved_gdt_blocks)?;
        w.write_u64::<LittleEndian>(0)?; // s_kbytes_written

        // Everything past this point (user/group quota inodes, checksum
        // seed, error reporting, snapshot fields) is unused; zero-pad out
        // to the fixed 1024-byte record.
        let written = w.count;
        out.write_all(&vec![0u8; SUPERBLOCK_WIRE_SIZE - written])?;
        Ok(())
    }
}

/// Thin `Write` wrapper that tallies bytes passed through it, so the final
/// padding length is always derived from what was actually written rather
/// than hand-counted.
struct Counting<'a, W: Write> {
    inner: &'a mut W,
    count: usize,
}

impl<'a, W: Write> Counting<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<'a, W: Write> Write for Counting<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n;
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

const _: () = {
    const_assert_eq!(SUPERBLOCK_WIRE_SIZE, 1024);
};
