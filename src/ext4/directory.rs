//! ext4 directory encoding: linear for small directories, hash-indexed
//! ("htree") once the linear encoding would spill past one block (spec
//! §4.2). Leaf blocks reuse the linear encoder in `common::dirent`; only
//! the root index block's layout is ext4-specific.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

use crate::common::constants::{BLOCK_SIZE, FT_DIR};
use crate::common::dirent::{self, DirChild, LaidOutEntry};
use crate::ext4::hash;

/// `children` includes the synthetic `.`/`..` pair (see
/// `planned_node::directory_children`); only the remainder is hashed and
/// distributed across leaves.
fn partition_into_leaves(children: &[DirChild]) -> Vec<Vec<DirChild>> {
    let rest = &children[2.min(children.len())..];
    let mut sorted: Vec<&DirChild> = rest.iter().collect();
    sorted.sort_by_key(|c| hash::hash(&c.name));

    // Group entries sharing a hash into one unit: the root index records one
    // "first hash" per leaf, which must come out strictly increasing, so a
    // run of equal-hash names can never be split across a leaf boundary.
    let mut runs: Vec<Vec<DirChild>> = Vec::new();
    for c in sorted {
        let h = hash::hash(&c.name);
        let same_run = runs.last().is_some_and(|run: &Vec<DirChild>| hash::hash(&run[0].name) == h);
        if same_run {
            runs.last_mut().unwrap().push(c.clone());
        } else {
            runs.push(vec![c.clone()]);
        }
    }

    let mut leaves: Vec<Vec<DirChild>> = Vec::new();
    let mut current: Vec<DirChild> = Vec::new();
    let mut leftover = BLOCK_SIZE;
    for run in runs {
        let need: u64 = run.iter().map(|c| dirent::min_entry_len(&c.name) as u64).sum();
        let fits = need <= leftover && (leftover - need == 0 || leftover - need >= 8);
        if !current.is_empty() && !fits {
            leaves.push(std::mem::take(&mut current));
            leftover = BLOCK_SIZE;
        }
        current.extend(run);
        leftover -= need.min(leftover);
    }
    if !current.is_empty() {
        leaves.push(current);
    }
    if leaves.is_empty() {
        leaves.push(Vec::new());
    }
    leaves
}

/// Total block count this directory will occupy: the linear count if it
/// fits one block, otherwise one root index block plus one block per leaf.
pub fn block_count(children: &[DirChild]) -> u64 {
    let linear = dirent::block_count(children);
    if linear <= 1 {
        return linear;
    }
    partition_into_leaves(children).len() as u64 + 1
}

pub fn is_htree(children: &[DirChild]) -> bool {
    dirent::block_count(children) > 1
}

const ROOT_HEADER_LEN: u64 = 12;

/// Renders the root index block: `.`/`..` (with `..` sized to butt up
/// against the header) followed by the hash/block index header and entries.
pub fn render_root_block<W: Write>(children: &[DirChild], leaves: &[Vec<DirChild>], w: &mut W) -> io::Result<()> {
    let dot = &children[0];
    let dotdot = &children[1];
    let dot_len = dirent::min_entry_len(&dot.name);
    let after = ROOT_HEADER_LEN + leaves.len() as u64 * 8;
    let dotdot_len = BLOCK_SIZE as u16 - dot_len - after as u16;

    let dot_entries = vec![
        LaidOutEntry { inode: dot.inode, rec_len: dot_len, file_type: FT_DIR, name: dot.name.clone() },
        LaidOutEntry { inode: dotdot.inode, rec_len: dotdot_len, file_type: FT_DIR, name: dotdot.name.clone() },
    ];
    for entry in &dot_entries {
        w.write_u32::<LittleEndian>(entry.inode)?;
        w.write_u16::<LittleEndian>(entry.rec_len)?;
        w.write_u8(entry.name.len() as u8)?;
        w.write_u8(entry.file_type)?;
        w.write_all(entry.name.as_bytes())?;
        let pad = entry.rec_len as u64 - (8 + entry.name.len() as u64);
        w.write_all(&vec![0u8; pad as usize])?;
    }

    w.write_u8(2)?; // hash_version: TEA unsigned
    w.write_u8(ROOT_HEADER_LEN as u8)?;
    w.write_u8(0)?; // indirect_levels: single level only
    w.write_u8(0)?;
    w.write_u16::<LittleEndian>(leaves.len() as u16)?; // limit == count: built once, never grown
    w.write_u16::<LittleEndian>(leaves.len() as u16)?;
    w.write_u32::<LittleEndian>(1)?; // first_leaf_block

    for (i, leaf) in leaves.iter().enumerate() {
        let first_hash = leaf.first().map(|c| hash::hash(&c.name)).unwrap_or(0);
        w.write_u32::<LittleEndian>(first_hash)?;
        w.write_u32::<LittleEndian>((i + 1) as u32)?;
    }

    let written = dot_entries.iter().map(|e| e.rec_len as u64).sum::<u64>() + after;
    w.write_all(&vec![0u8; (BLOCK_SIZE - written) as usize])
}

pub fn render_leaf_block<W: Write>(leaf: &[DirChild], w: &mut W) -> io::Result<()> {
    let blocks = dirent::layout(leaf);
    let entries = blocks.first().cloned().unwrap_or_default();
    dirent::write_block(&entries, w)
}

/// Renders a directory's full byte content: linear blocks if it fits
/// `block_count`'s linear case, otherwise a root index block followed by its
/// leaves, in the same order `block_count` sized it.
pub fn render(children: &[DirChild]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(block_count(children) as usize * BLOCK_SIZE as usize);
    if !is_htree(children) {
        for block in dirent::layout(children) {
            dirent::write_block(&block, &mut buf)?;
        }
        return Ok(buf);
    }
    let leaves = partition_into_leaves(children);
    render_root_block(children, &leaves, &mut buf)?;
    for leaf in &leaves {
        render_leaf_block(leaf, &mut buf)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(name: &str, inode: u32) -> DirChild {
        DirChild { name: name.to_string(), inode, file_type: 1 }
    }

    #[test]
    fn small_directory_stays_linear() {
        let children = vec![child(".", 2), child("..", 2), child("a", 11)];
        assert_eq!(block_count(&children), 1);
        assert!(!is_htree(&children));
    }

    #[test]
    fn hundred_flat_entries_become_hash_indexed_ascending() {
        let mut children = vec![child(".", 2), child("..", 2)];
        for i in 0..100 {
            children.push(child(&"v".repeat(i), 100 + i as u32));
        }
        assert!(is_htree(&children));
        let leaves = partition_into_leaves(&children);
        let first_hashes: Vec<u32> = leaves.iter().map(|l| hash::hash(&l[0].name)).collect();
        for pair in first_hashes.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn equal_hash_run_is_never_split_across_a_leaf_boundary() {
        // 40 entries sharing one literal name are guaranteed to share one
        // hash. Interleaved with enough distinct filler of the same
        // min_entry_len to force several leaves, a boundary is certain to
        // fall somewhere inside the sorted run unless whole runs are kept
        // atomic during packing.
        let colliding_name = "x".repeat(250); // min_entry_len = 8 + align(251,4) = 260
        let mut children = vec![child(".", 2), child("..", 2)];
        for i in 0..40u32 {
            children.push(child(&colliding_name, 100 + i));
            children.push(child(&format!("{i:0>250}"), 200 + i));
        }
        assert!(is_htree(&children));

        let leaves = partition_into_leaves(&children);
        assert!(leaves.len() > 1, "enough entries to force multiple leaves");

        let colliding_leaves: Vec<usize> = leaves
            .iter()
            .enumerate()
            .filter(|(_, leaf)| leaf.iter().any(|c| c.name == colliding_name))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(colliding_leaves.len(), 1, "the whole run of duplicate-hash entries must land in a single leaf");

        let count = leaves[colliding_leaves[0]].iter().filter(|c| c.name == colliding_name).count();
        assert_eq!(count, 40, "no duplicate-hash entry may be left behind in a different leaf");
    }
}
