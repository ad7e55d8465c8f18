//! The JBD2 journal superblock (spec §4.7). The one on-disk structure in
//! this crate that is big-endian, per spec §5.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{self, Write};

use crate::common::constants::BLOCK_SIZE;

pub const JBD2_MAGIC: u32 = 0xC03B_3998;
pub const BLOCKTYPE_SUPERBLOCK_V2: u32 = 4;

pub mod feature_incompat {
    pub const REVOKE: u32 = 0x1;
    pub const BIT64: u32 = 0x2;
    pub const ASYNC_COMMIT: u32 = 0x4;
}

pub struct JournalSuperblock {
    pub max_len: u32,
}

impl JournalSuperblock {
    pub fn new(journal_blocks: u32) -> Self {
        Self { max_len: journal_blocks }
    }

    /// Writes the superblock's first block: header, fields, then zero
    /// padding to `BLOCK_SIZE`. Remaining journal blocks are plain zeros,
    /// written by the caller.
    pub fn write_be<W: Write>(&self, w: &mut W) -> io::Result<()> {
        struct Counting<'a, W: Write> {
            inner: &'a mut W,
            count: usize,
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

        let mut w = Counting { inner: w, count: 0 };

        w.write_u32::<BigEndian>(JBD2_MAGIC)?;
        w.write_u32::<BigEndian>(BLOCKTYPE_SUPERBLOCK_V2)?;
        w.write_u32::<BigEndian>(1)?; // h_sequence

        w.write_u32::<BigEndian>(BLOCK_SIZE as u32)?;
        w.write_u32::<BigEndian>(self.max_len)?;
        w.write_u32::<BigEndian>(1)?; // s_first
        w.write_u32::<BigEndian>(1)?; // s_sequence
        w.write_u32::<BigEndian>(0)?; // s_start
        w.write_u32::<BigEndian>(0)?; // s_errno
        w.write_u32::<BigEndian>(0)?; // s_feature_compat
        w.write_u32::<BigEndian>(
            feature_incompat::REVOKE | feature_incompat::BIT64 | feature_incompat::ASYNC_COMMIT,
        )?;
        w.write_u32::<BigEndian>(0)?; // s_feature_ro_compat
        w.write_all(&[0u8; 16])?; // s_uuid
        w.write_u32::<BigEndian>(0)?; // s_nr_users
        w.write_u32::<BigEndian>(0)?; // s_dynsuper
        w.write_u32::<BigEndian>(0)?; // s_max_transaction
        w.write_u32::<BigEndian>(0)?; // s_max_trans_data

        let written = w.count;
        w.write_all(&vec![0u8; BLOCK_SIZE as usize - written])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian as BE;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    #[test]
    fn writes_exactly_one_block_with_big_endian_magic() {
        let sb = JournalSuperblock::new(1024);
        let mut buf = Vec::new();
        sb.write_be(&mut buf).unwrap();
        assert_eq!(buf.len(), BLOCK_SIZE as usize);
        let mut cursor = Cursor::new(&buf[..4]);
        assert_eq!(cursor.read_u32::<BE>().unwrap(), JBD2_MAGIC);
    }
}
