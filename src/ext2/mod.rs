//! The ext2 compiler (spec §4, ext2 branches throughout).

pub mod compiler;
pub mod inode;
pub mod planner;
pub mod writer;

pub use compiler::Ext2Compiler;
