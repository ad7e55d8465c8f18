//! Block group descriptor (spec §6.3): 32 bytes, one per group, packed into
//! the block group descriptor table (BGDT).

use byteorder::{LittleEndian, WriteBytesExt};
use static_assertions::const_assert_eq;
use std::io::{self, Write};

pub const GROUP_DESC_WIRE_SIZE: usize = 32;
const_assert_eq!(GROUP_DESC_WIRE_SIZE, 32);

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupDescriptor {
    pub block_bitmap_addr: u32,
    pub inode_bitmap_addr: u32,
    pub inode_table_addr: u32,
    pub free_blocks: u16,
    pub free_inodes: u16,
    pub directories: u16,
    pub flags: u16,
}

impl GroupDescriptor {
    pub fn write_le<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.block_bitmap_addr)?;
        w.write_u32::<LittleEndian>(self.inode_bitmap_addr)?;
        w.write_u32::<LittleEndian>(self.inode_table_addr)?;
        w.write_u16::<LittleEndian>(self.free_blocks)?;
        w.write_u16::<LittleEndian>(self.free_inodes)?;
        w.write_u16::<LittleEndian>(self.directories)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        // Pad to the fixed 32-byte record.
        w.write_all(&[0u8; 32 - 4 - 4 - 4 - 2 - 2 - 2 - 2])?;
        Ok(())
    }
}
