//! The ext2 `New → Mkdir/AddFile* → Commit → Precompile → Compile` state
//! machine (spec §4.8, §6.4).

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::arith::{divide, ext2_indirect_blocks};
use crate::cancel::CancellationToken;
use crate::common::constants::BLOCK_SIZE;
use crate::common::dirent::{self, DirChild};
use crate::common::planned_node::{self, Plan, SizeModel};
use crate::error::{CompileError, Result};
use crate::ext2::planner::{self, FixedGeometry, Minimums};
use crate::ext2::writer::{self, Geometry};
use crate::sink::Sink;
use crate::tree::{FileTree, SymlinkSource};

struct Ext2SizeModel;

impl SizeModel for Ext2SizeModel {
    fn file_blocks(&self, content_blocks: u64) -> Result<(u64, u64)> {
        let fs = content_blocks + ext2_indirect_blocks(content_blocks)?;
        Ok((content_blocks, fs))
    }

    fn symlink_blocks(&self, target_len: u64) -> Result<(u64, u64)> {
        self.file_blocks(divide(target_len, BLOCK_SIZE))
    }

    fn directory_blocks(&self, children: &[DirChild]) -> Result<(u64, u64)> {
        self.file_blocks(dirent::block_count(children))
    }
}

enum Phase {
    Building,
    Committed { plan: Plan },
    Precompiled { plan: Plan, fixed: FixedGeometry, geometry: Geometry },
}

pub struct Ext2Compiler {
    tree: FileTree,
    minimums: Minimums,
    cancel: CancellationToken,
    phase: Phase,
}

impl Default for Ext2Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Ext2Compiler {
    pub fn new() -> Self {
        Self { tree: FileTree::new(), minimums: Minimums::default(), cancel: CancellationToken::new(), phase: Phase::Building }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn ensure_building(&self) -> Result<()> {
        match self.phase {
            Phase::Building => Ok(()),
            _ => Err(CompileError::StateError("the tree is closed for modification after commit".into())),
        }
    }

    pub fn mkdir(&mut self, path: &Path) -> Result<()> {
        self.ensure_building()?;
        self.tree.mkdir(path)?;
        Ok(())
    }

    pub fn add_file(&mut self, path: &Path, reader: Box<dyn Read>, size: u64, modified: DateTime<Utc>) -> Result<()> {
        self.ensure_building()?;
        self.tree.add_file(path, reader, size, modified)?;
        Ok(())
    }

    pub fn add_symlink(&mut self, path: &Path, source: SymlinkSource, modified: DateTime<Utc>) -> Result<()> {
        self.ensure_building()?;
        self.tree.add_symlink(path, source, modified)?;
        Ok(())
    }

    pub fn set_min_free_inodes(&mut self, n: u64) {
        self.minimums.min_free_inodes = n;
    }
    pub fn set_min_inodes(&mut self, n: u64) {
        self.minimums.min_inodes = n;
    }
    pub fn set_min_inodes_per_64mib(&mut self, n: u64) {
        self.minimums.min_inodes_per_64mib = n;
    }
    pub fn set_min_free_space(&mut self, bytes: u64) {
        self.minimums.min_free_space = bytes;
    }

    fn effective_min_inodes(&self) -> u64 {
        self.minimums.min_inodes.max(self.tree.node_count() as u64 + self.minimums.min_free_inodes)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_building()?;
        let plan = planned_node::commit(&mut self.tree, &Ext2SizeModel)?;
        log::debug!("ext2 commit: {} planned nodes, {} filled data blocks", plan.iter().count(), plan.filled_data_blocks);
        self.phase = Phase::Committed { plan };
        Ok(())
    }

    fn plan(&self) -> Result<&Plan> {
        match &self.phase {
            Phase::Committed { plan } | Phase::Precompiled { plan, .. } => Ok(plan),
            Phase::Building => Err(CompileError::StateError("minimum_size called before commit".into())),
        }
    }

    pub fn minimum_size(&self) -> Result<u64> {
        let plan = self.plan()?;
        let result = planner::solve_minimum(plan.filled_data_blocks, self.tree.node_count() as u64, &self.minimums)?;
        Ok(result.total_blocks * BLOCK_SIZE)
    }

    pub fn precompile(&mut self, size: u64) -> Result<()> {
        let minimum = self.minimum_size()?;
        if size < minimum {
            return Err(CompileError::SizeBelowMinimum { requested: size, minimum });
        }
        let min_inodes = self.effective_min_inodes();
        let plan = self.plan()?.clone();
        let fixed = planner::fix_geometry(size, min_inodes, self.minimums.min_inodes_per_64mib)?;
        log::info!("ext2 precompile: {} groups, {} inodes/group", fixed.groups, fixed.geometry.inodes_per_group);
        let geometry = writer::build_geometry(&self.tree, &plan, &fixed)?;
        self.phase = Phase::Precompiled { plan, fixed, geometry };
        Ok(())
    }

    pub fn region_is_hole(&self, offset: u64, len: u64) -> Result<bool> {
        let Phase::Precompiled { geometry, .. } = &self.phase else {
            return Err(CompileError::StateError("region_is_hole called before precompile".into()));
        };
        let first_block = offset / BLOCK_SIZE;
        let last_block = divide(offset + len, BLOCK_SIZE);
        Ok(geometry.block_bitmap.is_hole(first_block, last_block.saturating_sub(first_block)))
    }

    pub fn compile<S: Sink>(&mut self, sink: &mut S) -> Result<()> {
        let now = Utc::now().timestamp() as u32;
        let Phase::Precompiled { plan, geometry, .. } = &self.phase else {
            return Err(CompileError::StateError("compile called before precompile".into()));
        };
        writer::write(&mut self.tree, plan, geometry, sink, &self.cancel, now)
    }
}
