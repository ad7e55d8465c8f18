//! Helpers shared by the ext2 and ext4 compilers: constants, the block-usage
//! bitmap, the group descriptor table record, and linear directory encoding.

pub mod bitmap;
pub mod constants;
pub mod dirent;
pub mod gdt;
pub mod planned_node;
pub mod superblock;
