//! Linear directory block encoding (spec §4.2), shared by ext2 (all
//! directories) and ext4 (directories small enough not to need hashing, and
//! the leaf blocks of a hash-indexed directory).

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

use crate::common::constants::BLOCK_SIZE;

/// A directory child as seen by the encoder. Callers prepend the synthetic
/// `.` and `..` entries themselves.
#[derive(Debug, Clone)]
pub struct DirChild {
    pub name: String,
    pub inode: u32,
    pub file_type: u8,
}

#[derive(Debug, Clone)]
pub struct LaidOutEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: String,
}

/// The minimum length of a directory entry record for `name`, 4-byte
/// aligned (spec §4.2: `8 + ceil((len(n)+1)/4)*4`).
pub fn min_entry_len(name: &str) -> u16 {
    (8 + crate::arith::align(name.len() as u64 + 1, 4)) as u16
}

/// Packs `children` into block-sized linear directory records. The last
/// entry of every block is extended so entries fill the block exactly.
pub fn layout(children: &[DirChild]) -> Vec<Vec<LaidOutEntry>> {
    let mut blocks: Vec<Vec<LaidOutEntry>> = vec![Vec::new()];
    let mut leftover = BLOCK_SIZE;

    for child in children {
        let need = min_entry_len(&child.name) as u64;
        let fits_cleanly = need <= leftover && (leftover - need == 0 || leftover - need >= 8);
        if !fits_cleanly {
            extend_last(&mut blocks, leftover);
            blocks.push(Vec::new());
            leftover = BLOCK_SIZE;
        }
        blocks.last_mut().unwrap().push(LaidOutEntry {
            inode: child.inode,
            rec_len: need as u16,
            file_type: child.file_type,
            name: child.name.clone(),
        });
        leftover -= need;
    }
    extend_last(&mut blocks, leftover);
    blocks
}

fn extend_last(blocks: &mut [Vec<LaidOutEntry>], leftover: u64) {
    if let Some(last_block) = blocks.last_mut() {
        if let Some(last_entry) = last_block.last_mut() {
            last_entry.rec_len += leftover as u16;
        }
    }
}

/// Block count a `layout()` call on these children would produce, without
/// building the entry list's owned names twice over (spec §4.2: size
/// calculation mirrors the encoder's own output).
pub fn block_count(children: &[DirChild]) -> u64 {
    layout(children).len() as u64
}

pub fn write_block<W: Write>(entries: &[LaidOutEntry], w: &mut W) -> io::Result<()> {
    let mut written = 0u64;
    for entry in entries {
        w.write_u32::<LittleEndian>(entry.inode)?;
        w.write_u16::<LittleEndian>(entry.rec_len)?;
        w.write_u8(entry.name.len() as u8)?;
        w.write_u8(entry.file_type)?;
        w.write_all(entry.name.as_bytes())?;
        let header_and_name = 8 + entry.name.len() as u64;
        let pad = entry.rec_len as u64 - header_and_name;
        w.write_all(&vec![0u8; pad as usize])?;
        written += entry.rec_len as u64;
    }
    if written < BLOCK_SIZE {
        w.write_all(&vec![0u8; (BLOCK_SIZE - written) as usize])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(name: &str, inode: u32) -> DirChild {
        DirChild { name: name.to_string(), inode, file_type: 1 }
    }

    #[test]
    fn single_block_extends_last_entry_to_fill_block() {
        let children = vec![child(".", 2), child("..", 2), child("a.txt", 11)];
        let blocks = layout(&children);
        assert_eq!(blocks.len(), 1);
        let total: u64 = blocks[0].iter().map(|e| e.rec_len as u64).sum();
        assert_eq!(total, BLOCK_SIZE);
    }

    #[test]
    fn overflowing_names_open_a_new_block() {
        let mut children = vec![child(".", 2), child("..", 2)];
        // Each name is 250 bytes -> min_entry_len = 8 + align(251,4) = 8+252 = 260.
        // 4096 / 260 ~= 15 entries per block.
        for i in 0..40 {
            children.push(child(&"x".repeat(250), 100 + i));
        }
        let blocks = layout(&children);
        assert!(blocks.len() > 1);
        for block in &blocks {
            let total: u64 = block.iter().map(|e| e.rec_len as u64).sum();
            assert_eq!(total, BLOCK_SIZE);
        }
    }

    #[test]
    fn block_count_matches_layout_len() {
        let children = vec![child(".", 2), child("..", 2), child("f", 11)];
        assert_eq!(block_count(&children), layout(&children).len() as u64);
    }
}
