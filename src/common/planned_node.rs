//! The planned-node table (spec §3.2, §4.3): one entry per tree node,
//! carrying its assigned inode number and block-range bookkeeping. Building
//! it ("commit") is the one format-dependent piece shared between ext2 and
//! ext4 — only the block-counting rules for files/symlinks/directories
//! differ, captured by `SizeModel`.

use std::collections::HashMap;

use crate::common::constants::INO_FIRST_RESERVED;
use crate::common::dirent::DirChild;
use crate::error::Result;
use crate::tree::{FileTree, ROOT};

/// Sentinel `tree_idx` for planned nodes with no backing tree node (the
/// ext4 journal and resize inodes, spec §4.7).
pub const SYNTHETIC_NODE: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub ino: u32,
    pub tree_idx: usize,
    /// Logical data-block index this node's content begins at. Signed
    /// because the ext4 journal is placed before everything else and is
    /// assigned a negative `start` until geometry fixing shifts it (spec
    /// §4.7).
    pub start: i64,
    pub content: u64,
    pub fs: u64,
}

/// Per-format block counting rules invoked while walking the tree during
/// commit (spec §4.3).
pub trait SizeModel {
    fn file_blocks(&self, content_blocks: u64) -> Result<(u64, u64)>;
    fn symlink_blocks(&self, target_len: u64) -> Result<(u64, u64)>;
    /// `children` already includes the synthetic `.`/`..` entries; inode
    /// numbers in it are placeholders (sizing never depends on them).
    fn directory_blocks(&self, children: &[DirChild]) -> Result<(u64, u64)>;
}

#[derive(Clone)]
pub struct Plan {
    /// Indexed by inode number; `slots[0]` is unused.
    slots: Vec<Option<PlannedNode>>,
    by_tree_idx: HashMap<usize, u32>,
    pub filled_data_blocks: u64,
}

impl Plan {
    pub fn get(&self, ino: u32) -> &PlannedNode {
        self.slots[ino as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("inode {ino} was never planned"))
    }

    pub fn get_mut(&mut self, ino: u32) -> &mut PlannedNode {
        self.slots[ino as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("inode {ino} was never planned"))
    }

    pub fn try_get(&self, ino: u32) -> Option<&PlannedNode> {
        self.slots.get(ino as usize).and_then(|s| s.as_ref())
    }

    pub fn ino_of(&self, tree_idx: usize) -> u32 {
        self.by_tree_idx[&tree_idx]
    }

    pub fn max_ino(&self) -> u32 {
        (self.slots.len() - 1) as u32
    }

    /// All planned nodes in ascending inode-number order.
    pub fn iter(&self) -> impl Iterator<Item = &PlannedNode> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Every planned node in ascending `start` order (the order the writer
    /// streams content in).
    pub fn iter_by_start(&self) -> Vec<&PlannedNode> {
        let mut v: Vec<&PlannedNode> = self.iter().collect();
        v.sort_by_key(|n| n.start);
        v
    }

    fn set(&mut self, ino: u32, node: PlannedNode) {
        if ino as usize >= self.slots.len() {
            self.slots.resize_with(ino as usize + 1, || None);
        }
        self.by_tree_idx.insert(node.tree_idx, ino);
        self.slots[ino as usize] = Some(node);
    }

    /// Shifts every planned node's `start` by `delta`, making room for
    /// synthetic nodes inserted ahead of the walked tree (spec §4.7).
    pub fn shift_all_starts(&mut self, delta: i64) {
        for slot in self.slots.iter_mut().flatten() {
            slot.start += delta;
        }
    }

    /// Inserts a node with no backing tree entry (the ext4 journal and
    /// resize inodes) at a fixed `start`.
    pub fn insert_synthetic(&mut self, ino: u32, start: i64, content: u64, fs: u64) {
        self.filled_data_blocks += fs;
        self.set(ino, PlannedNode { ino, tree_idx: SYNTHETIC_NODE, start, content, fs });
    }
}

/// Builds the directory-child record list (`.`, `..`, then every child in
/// tree order) for sizing or encoding a directory. Inode numbers are
/// placeholders when `plan` is still being built (sizing doesn't need
/// them); pass the real plan once it's complete to get real numbers.
pub fn directory_children(tree: &FileTree, dir_idx: usize, self_ino: u32, parent_ino: u32) -> Vec<DirChild> {
    let mut out = Vec::with_capacity(tree.children(dir_idx).len() + 2);
    out.push(DirChild { name: ".".into(), inode: self_ino, file_type: crate::common::constants::FT_DIR });
    out.push(DirChild { name: "..".into(), inode: parent_ino, file_type: crate::common::constants::FT_DIR });
    out
}

/// Walks `tree` in pre-order, assigns inode numbers, and computes each
/// node's `(content, fs)` via `model` (spec §4.3). The root directory is
/// temporarily placed at inode 10 and moved to inode 2 once the walk ends.
pub fn commit<M: SizeModel>(tree: &mut FileTree, model: &M) -> Result<Plan> {
    let mut plan = Plan { slots: Vec::new(), by_tree_idx: HashMap::new(), filled_data_blocks: 0 };

    let order = tree.walk_preorder();
    let mut next_ino = INO_FIRST_RESERVED; // root takes slot 10 first, then moves to 2
    let mut running_total: u64 = 0;

    // First pass: assign inode numbers in walk order.
    let mut ino_of_tree_idx: HashMap<usize, u32> = HashMap::new();
    for &tree_idx in &order {
        let ino = if tree_idx == ROOT {
            INO_FIRST_RESERVED
        } else {
            next_ino += 1;
            next_ino
        };
        ino_of_tree_idx.insert(tree_idx, ino);
    }

    // Second pass: compute sizes (directories need their children's names,
    // already known regardless of pass order; they don't need children's
    // inode numbers).
    for &tree_idx in &order {
        let ino = ino_of_tree_idx[&tree_idx];
        let (content, fs) = if tree.is_dir(tree_idx) {
            let self_ino = ino;
            let parent_ino = ino_of_tree_idx[&tree.parent(tree_idx)];
            let mut children = directory_children(tree, tree_idx, self_ino, parent_ino);
            for &child_idx in tree.children(tree_idx) {
                children.push(DirChild {
                    name: tree.name(child_idx).to_string(),
                    inode: ino_of_tree_idx[&child_idx],
                    file_type: node_file_type(tree, child_idx),
                });
            }
            model.directory_blocks(&children)?
        } else if tree.is_symlink(tree_idx) {
            model.symlink_blocks(tree.size(tree_idx))?
        } else {
            let content = crate::arith::divide(tree.size(tree_idx), crate::common::constants::BLOCK_SIZE);
            model.file_blocks(content)?
        };

        let start = running_total as i64;
        running_total += fs;
        plan.set(ino, PlannedNode { ino, tree_idx, start, content, fs });
    }

    plan.filled_data_blocks = running_total;

    // Move the root's planned node from slot 10 to slot 2, per spec §4.3.
    let mut root_node = plan.slots[INO_FIRST_RESERVED as usize].take().unwrap();
    root_node.ino = crate::common::constants::INO_ROOT;
    plan.by_tree_idx.insert(ROOT, crate::common::constants::INO_ROOT);
    plan.set(crate::common::constants::INO_ROOT, root_node);

    Ok(plan)
}

pub fn node_file_type(tree: &FileTree, idx: usize) -> u8 {
    if tree.is_dir(idx) {
        crate::common::constants::FT_DIR
    } else if tree.is_symlink(idx) {
        crate::common::constants::FT_SYMLINK
    } else {
        crate::common::constants::FT_REG_FILE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dirent;

    struct FlatModel;
    impl SizeModel for FlatModel {
        fn file_blocks(&self, content_blocks: u64) -> Result<(u64, u64)> {
            Ok((content_blocks, content_blocks))
        }
        fn symlink_blocks(&self, target_len: u64) -> Result<(u64, u64)> {
            Ok((if target_len == 0 { 0 } else { 1 }, if target_len == 0 { 0 } else { 1 }))
        }
        fn directory_blocks(&self, children: &[DirChild]) -> Result<(u64, u64)> {
            let n = dirent::block_count(children);
            Ok((n, n))
        }
    }

    #[test]
    fn root_ends_up_at_inode_two() {
        let mut tree = FileTree::new();
        let plan = commit(&mut tree, &FlatModel).unwrap();
        assert_eq!(plan.ino_of(ROOT), 2);
        assert!(plan.try_get(10).is_none());
        assert_eq!(plan.get(2).tree_idx, ROOT);
    }

    #[test]
    fn application_nodes_start_at_eleven() {
        use std::io::Cursor;
        let mut tree = FileTree::new();
        tree.mkdir(std::path::Path::new("a")).unwrap();
        tree.add_file(
            std::path::Path::new("a/f.txt"),
            Box::new(Cursor::new(vec![0u8; 10])),
            10,
            chrono::Utc::now(),
        )
        .unwrap();
        let plan = commit(&mut tree, &FlatModel).unwrap();
        let inos: Vec<u32> = {
            let mut v: Vec<u32> = plan.iter().map(|n| n.ino).collect();
            v.sort();
            v
        };
        assert_eq!(inos, vec![2, 11, 12]);
    }
}
