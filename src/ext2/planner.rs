//! Minimum-size solver and geometry fixing for ext2 (spec §4.4, §4.5).

use crate::arith::{align, divide};
use crate::common::constants::{
    BLOCKS_PER_GROUP, BLOCK_SIZE, GROUP_DESC_SIZE, INODES_PER_BLOCK, INODE_SIZE,
};
use crate::error::{CompileError, Result};

/// Caller-supplied minimums feeding the solver (spec §6.4's
/// `set_min_*` operations).
#[derive(Debug, Clone, Default)]
pub struct Minimums {
    pub min_free_inodes: u64,
    pub min_inodes: u64,
    pub min_inodes_per_64mib: u64,
    pub min_free_space: u64,
}

/// Per-group geometry derived for a given group count (spec §4.4, §4.5).
/// ext2 pays this overhead in full in every group: superblock, block
/// bitmap, inode bitmap, inode table, and the whole BGDT.
#[derive(Debug, Clone, Copy)]
pub struct GroupGeometry {
    pub inodes_per_group: u64,
    pub inode_table_blocks: u64,
    pub bgdt_blocks: u64,
    pub overhead_per_group: u64,
}

/// inodes-per-group capacity of a single inode-usage bitmap block.
const MAX_INODES_PER_GROUP: u64 = 8 * BLOCK_SIZE;

pub fn group_geometry(groups: u64, min_inodes: u64, min_inodes_per_64mib: u64) -> Result<GroupGeometry> {
    let by_total = divide(min_inodes, groups);
    let by_density = 2 * min_inodes_per_64mib; // one group is 128 MiB = 2x64MiB
    let inodes_per_group = align(by_total.max(by_density).max(1), INODES_PER_BLOCK);

    if inodes_per_group > MAX_INODES_PER_GROUP {
        return Err(CompileError::GeometryInfeasible(format!(
            "{inodes_per_group} inodes per group exceed the {MAX_INODES_PER_GROUP} a single inode bitmap block can address"
        )));
    }

    let inode_table_blocks = divide(inodes_per_group * INODE_SIZE, BLOCK_SIZE);
    let bgdt_blocks = divide(groups * GROUP_DESC_SIZE, BLOCK_SIZE);
    let overhead_per_group = 3 + inode_table_blocks + bgdt_blocks;
    Ok(GroupGeometry { inodes_per_group, inode_table_blocks, bgdt_blocks, overhead_per_group })
}

#[derive(Debug, Clone, Copy)]
pub struct MinimumPlan {
    pub groups: u64,
    pub geometry: GroupGeometry,
    pub total_blocks: u64,
}

/// Solves for the smallest valid ext2 image given how many data blocks are
/// already filled (spec §4.4 ext2 branch).
pub fn solve_minimum(filled_data_blocks: u64, node_count: u64, minimums: &Minimums) -> Result<MinimumPlan> {
    let min_inodes = minimums.min_inodes.max(node_count + minimums.min_free_inodes);
    let min_data_blocks = filled_data_blocks + divide(minimums.min_free_space, BLOCK_SIZE);

    let mut groups = divide(min_data_blocks.max(1), BLOCKS_PER_GROUP).max(1);
    loop {
        let geometry = group_geometry(groups, min_inodes, minimums.min_inodes_per_64mib)?;
        let capacity = groups * BLOCKS_PER_GROUP - groups * geometry.overhead_per_group;
        if min_data_blocks <= capacity {
            let total_blocks = groups * geometry.overhead_per_group + min_data_blocks;
            return Ok(MinimumPlan { groups, geometry, total_blocks });
        }
        groups += 1;
    }
}

/// Fixed geometry for precompile, recomputed from the caller's chosen
/// `size` rather than the minimum-size search (spec §4.5).
#[derive(Debug, Clone, Copy)]
pub struct FixedGeometry {
    pub blocks: u64,
    pub groups: u64,
    pub geometry: GroupGeometry,
    pub data_blocks_per_group: u64,
}

pub fn fix_geometry(size: u64, min_inodes: u64, min_inodes_per_64mib: u64) -> Result<FixedGeometry> {
    let blocks = size / BLOCK_SIZE;
    let groups = divide(blocks, BLOCKS_PER_GROUP).max(1);
    let geometry = group_geometry(groups, min_inodes, min_inodes_per_64mib)?;
    if geometry.overhead_per_group >= BLOCKS_PER_GROUP {
        return Err(CompileError::GeometryInfeasible(
            "per-group overhead leaves no room for data blocks".into(),
        ));
    }
    let data_blocks_per_group = BLOCKS_PER_GROUP - geometry.overhead_per_group;
    Ok(FixedGeometry { blocks, groups, geometry, data_blocks_per_group })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_yields_a_small_single_group_minimum() {
        let plan = solve_minimum(0, 1, &Minimums::default()).unwrap();
        assert_eq!(plan.groups, 1);
        assert!(plan.total_blocks > 0);
        assert!(plan.total_blocks < BLOCKS_PER_GROUP);
    }

    #[test]
    fn growing_data_requirement_can_force_a_second_group() {
        let plan = solve_minimum(BLOCKS_PER_GROUP, 1, &Minimums::default()).unwrap();
        assert!(plan.groups >= 2);
    }

    #[test]
    fn excessive_min_inodes_is_geometry_infeasible() {
        let minimums = Minimums { min_inodes: MAX_INODES_PER_GROUP * 10, ..Default::default() };
        let err = solve_minimum(0, 1, &minimums).unwrap_err();
        assert!(matches!(err, CompileError::GeometryInfeasible(_)));
    }
}
