//! The ext4 `New → Mkdir/AddFile* → Commit → Precompile → Compile` state
//! machine (spec §4.8, §6.4). Differs from the ext2 compiler only in its
//! `SizeModel` and in inserting the journal and resize inodes ahead of the
//! walked tree once geometry is fixed (spec §4.7).

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::arith::divide;
use crate::cancel::CancellationToken;
use crate::common::constants::{BLOCK_SIZE, INO_JOURNAL, INO_RESIZE};
use crate::common::dirent::DirChild;
use crate::common::planned_node::{self, Plan, SizeModel};
use crate::error::{CompileError, Result};
use crate::ext4::directory;
use crate::ext4::extent;
use crate::ext4::planner::{self, FixedGeometry, Minimums};
use crate::ext4::writer::{self, Geometry};
use crate::sink::Sink;
use crate::tree::{FileTree, SymlinkSource};

struct Ext4SizeModel;

impl SizeModel for Ext4SizeModel {
    fn file_blocks(&self, content_blocks: u64) -> Result<(u64, u64)> {
        let fs = content_blocks + if extent::needs_external_index(content_blocks) { 1 } else { 0 };
        Ok((content_blocks, fs))
    }

    /// Targets shorter than 60 bytes live inline in the inode's block area
    /// and need no extent tree at all (spec §4.2).
    fn symlink_blocks(&self, target_len: u64) -> Result<(u64, u64)> {
        if target_len < 60 {
            return Ok((0, 0));
        }
        self.file_blocks(divide(target_len, BLOCK_SIZE))
    }

    fn directory_blocks(&self, children: &[DirChild]) -> Result<(u64, u64)> {
        self.file_blocks(directory::block_count(children))
    }
}

enum Phase {
    Building,
    Committed { plan: Plan },
    Precompiled { base_plan: Plan, plan: Plan, fixed: FixedGeometry, geometry: Geometry },
}

pub struct Ext4Compiler {
    tree: FileTree,
    minimums: Minimums,
    cancel: CancellationToken,
    phase: Phase,
}

impl Default for Ext4Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Ext4Compiler {
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
        let plan = planned_node::commit(&mut self.tree, &Ext4SizeModel)?;
        log::debug!("ext4 commit: {} planned nodes, {} filled data blocks", plan.iter().count(), plan.filled_data_blocks);
        self.phase = Phase::Committed { plan };
        Ok(())
    }

    /// The tree-only plan, before the journal and resize inodes are spliced
    /// in ahead of it.
    fn base_plan(&self) -> Result<&Plan> {
        match &self.phase {
            Phase::Committed { plan } => Ok(plan),
            Phase::Precompiled { base_plan, .. } => Ok(base_plan),
            Phase::Building => Err(CompileError::StateError("minimum_size called before commit".into())),
        }
    }

    pub fn minimum_size(&self) -> Result<u64> {
        let plan = self.base_plan()?;
        let result = planner::solve_minimum(plan.filled_data_blocks, self.tree.node_count() as u64, &self.minimums)?;
        Ok(result.total_blocks * BLOCK_SIZE)
    }

    /// Splices the journal and resize inodes in ahead of the walked tree's
    /// plan: every existing `start` shifts forward by `journal_blocks + 1`,
    /// then the journal lands at `start == 0` and the resize inode right
    /// after it (spec §4.7).
    fn with_synthetic_nodes(base_plan: &Plan, fixed: &FixedGeometry) -> Plan {
        let mut plan = base_plan.clone();
        plan.shift_all_starts(fixed.journal_blocks as i64 + 1);
        plan.insert_synthetic(INO_JOURNAL, 0, fixed.journal_blocks, fixed.journal_blocks);
        plan.insert_synthetic(INO_RESIZE, fixed.journal_blocks as i64, 1, 1);
        plan
    }

    pub fn precompile(&mut self, size: u64) -> Result<()> {
        let minimum = self.minimum_size()?;
        if size < minimum {
            return Err(CompileError::SizeBelowMinimum { requested: size, minimum });
        }
        let min_inodes = self.effective_min_inodes();
        let base_plan = self.base_plan()?.clone();
        let solved = planner::solve_minimum(base_plan.filled_data_blocks, self.tree.node_count() as u64, &self.minimums)?;
        let fixed = planner::fix_geometry(size, min_inodes, self.minimums.min_inodes_per_64mib, solved.journal_blocks)?;
        log::info!(
            "ext4 precompile: {} groups, {} groups/flex, {} journal blocks",
            fixed.groups,
            fixed.groups_per_flex,
            fixed.journal_blocks
        );
        let plan = Self::with_synthetic_nodes(&base_plan, &fixed);
        let geometry = writer::build_geometry(&self.tree, &plan, &fixed)?;
        self.phase = Phase::Precompiled { base_plan, plan, fixed, geometry };
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
