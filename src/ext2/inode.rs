//! The ext2 on-disk inode record (spec §4.6, §6.3): 128 bytes, 15 block
//! pointers (12 direct + single + double + triple indirect).

use byteorder::{LittleEndian, WriteBytesExt};
use static_assertions::const_assert_eq;
use std::io::{self, Write};

use crate::common::constants::INODE_SIZE;

pub const DIRECT_POINTERS: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct Ext2Inode {
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
    /// `direct[0..12]`, `single`, `double`, `triple`.
    pub block: [u32; 15],
    pub generation: u32,
    pub file_acl: u32,
    pub size_hi: u32,
    pub frag_addr: u32,
}

impl Ext2Inode {
    pub fn direct_mut(&mut self) -> &mut [u32] {
        &mut self.block[0..DIRECT_POINTERS]
    }
    pub fn set_single(&mut self, addr: u32) {
        self.block[12] = addr;
    }
    pub fn set_double(&mut self, addr: u32) {
        self.block[13] = addr;
    }
    pub fn set_triple(&mut self, addr: u32) {
        self.block[14] = addr;
    }

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
        for ptr in self.block {
            w.write_u32::<LittleEndian>(ptr)?;
        }
        w.write_u32::<LittleEndian>(self.generation)?;
        w.write_u32::<LittleEndian>(self.file_acl)?;
        w.write_u32::<LittleEndian>(self.size_hi)?;
        w.write_u32::<LittleEndian>(self.frag_addr)?;
        w.write_all(&[0u8; 12])?; // osstuff
        Ok(())
    }
}

const EXT2_INODE_WIRE_SIZE: usize =
    2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2 + 4 + 4 + 4 + 15 * 4 + 4 + 4 + 4 + 4 + 12;
const_assert_eq!(EXT2_INODE_WIRE_SIZE, INODE_SIZE as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_exactly_one_inode_slot() {
        let inode = Ext2Inode::default();
        let mut buf = Vec::new();
        inode.write_le(&mut buf).unwrap();
        assert_eq!(buf.len(), INODE_SIZE as usize);
    }
}
