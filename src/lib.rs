//! Offline ext2/ext4 filesystem image compiler for single-application VM
//! disk images (spec §1). The input is a single in-memory tree built with
//! [`tree::FileTree`]; the output is written straight to a [`sink::Sink`]
//! in one streaming pass, with no intermediate loopback mount or block
//! device involved.
//!
//! [`ext2::Ext2Compiler`] and [`ext4::Ext4Compiler`] both follow the same
//! `new → mkdir/add_file/add_symlink* → commit → precompile → compile`
//! state machine (spec §4.8); pick whichever format the target kernel
//! expects.

pub mod arith;
pub mod cancel;
pub mod common;
pub mod error;
pub mod ext2;
pub mod ext4;
pub mod sink;
pub mod tree;

pub use cancel::CancellationToken;
pub use error::{CompileError, Result};
pub use ext2::Ext2Compiler;
pub use ext4::Ext4Compiler;
pub use sink::Sink;
pub use tree::{FileTree, SymlinkSource};
