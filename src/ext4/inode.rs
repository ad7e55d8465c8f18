//! The ext4 on-disk inode record (spec §4.6, §6.3): same 128-byte layout
//! as ext2's, but the 60-byte block area holds an inline symlink target, an
//! inline extent tree, or an extent-index entry instead of block pointers.

use byteorder::{LittleEndian, WriteBytesExt};
use static_assertions::const_assert_eq;
use std::io::{self, Write};

use crate::common::constants::INODE_SIZE;

#[derive(Debug, Clone)]
pub struct Ext4Inode {
    pub mode: u16,
    pub uid: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links: u16,
    pub sectors: u32,
    pub flags: u32,
    pub block: [u8; 60],
    pub generation: u32,
    pub file_acl: u32,
    pub size_hi: u32,
    pub frag_addr: u32,
}

impl Default for Ext4Inode {
    fn default() -> Self {
        Self {
            mode: 0,
            uid: 0,
            size_lo: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            gid: 0,
            links: 0,
            sectors: 0,
            flags: 0,
            block: [0u8; 60],
            generation: 0,
            file_acl: 0,
            size_hi: 0,
            frag_addr: 0,
        }
    }
}

/// Set when an inode's block area is an extent tree rather than indirect
/// pointers (spec §6.3 incompat feature `EXTENTS`).
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
/// Set when a symlink's target is stored inline in the block area.
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

impl Ext4Inode {
    pub fn write_le<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.mode)?;
        w.write_u16::<LittleEndian>(self.uid)?;
        w.write_u32::<LittleEndian>(self.size_lo)?;
        w.write_u32::<LittleEndian>(self.atime)?;
        w.write_u32::<LittleEndian>(self.ctime)?;
        w.write_u32::<LittleEndian>(self.mtime)?;
        w.write_u32::<LittleEndian>(self.dtime)?;
        w.write_u16::<LittleEndian>(self.gid)?;
        w.write_u16::<LittleEndian>(self.links)?;
        w.write_u32::<LittleEndian>(self.sectors)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(0)?; // osv (linux1)
        w.write_all(&self.block)?;
        w.write_u32::<LittleEndian>(self.generation)?;
        w.write_u32::<LittleEndian>(self.file_acl)?;
        w.write_u32::<LittleEndian>(self.size_hi)?;
        w.write_u32::<LittleEndian>(self.frag_addr)?;
        w.write_all(&[0u8; 12])?; // osstuff
        Ok(())
    }
}

const EXT4_INODE_WIRE_SIZE: usize =
    2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2 + 4 + 4 + 4 + 60 + 4 + 4 + 4 + 4 + 12;
const_assert_eq!(EXT4_INODE_WIRE_SIZE, INODE_SIZE as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_exactly_one_inode_slot() {
        let inode = Ext4Inode::default();
        let mut buf = Vec::new();
        inode.write_le(&mut buf).unwrap();
        assert_eq!(buf.len(), INODE_SIZE as usize);
    }
}
