//! Minimum-size solver and geometry fixing for ext4 (spec §4.4, §4.5).
//!
//! This implementation keeps a single superblock/BGDT installation at
//! group 0 rather than replicating sparse-super backups at every flex
//! group; see DESIGN.md for the reasoning.

use crate::arith::{align, divide, POINTERS_PER_BLOCK};
use crate::common::constants::{BLOCKS_PER_GROUP, BLOCK_SIZE, GROUP_DESC_SIZE, INODES_PER_BLOCK, INODE_SIZE};
use crate::error::{CompileError, Result};

pub const MIN_JOURNAL_BLOCKS: u64 = 1024;
pub const MAX_JOURNAL_BLOCKS: u64 = 32768;
pub const RESERVED_GDT_GROWTH_FACTOR: u64 = 1024;
const MAX_INODES_PER_GROUP: u64 = 8 * BLOCK_SIZE;

#[derive(Debug, Clone, Default)]
pub struct Minimums {
    pub min_free_inodes: u64,
    pub min_inodes: u64,
    pub min_inodes_per_64mib: u64,
    pub min_free_space: u64,
}

/// Overhead paid by every group regardless of flex placement: the block
/// and inode bitmaps plus this group's slice of the inode table.
#[derive(Debug, Clone, Copy)]
pub struct GroupGeometry {
    pub inodes_per_group: u64,
    pub inode_table_blocks: u64,
    pub overhead_per_group: u64,
}

pub fn group_geometry(groups: u64, min_inodes: u64, min_inodes_per_64mib: u64) -> Result<GroupGeometry> {
    let by_total = divide(min_inodes, groups);
    let by_density = 2 * min_inodes_per_64mib;
    let inodes_per_group = align(by_total.max(by_density).max(1), INODES_PER_BLOCK);

    if inodes_per_group > MAX_INODES_PER_GROUP {
        return Err(CompileError::GeometryInfeasible(format!(
            "{inodes_per_group} inodes per group exceed the {MAX_INODES_PER_GROUP} a single inode bitmap block can address"
        )));
    }

    let inode_table_blocks = divide(inodes_per_group * INODE_SIZE, BLOCK_SIZE);
    Ok(GroupGeometry { inodes_per_group, inode_table_blocks, overhead_per_group: 2 + inode_table_blocks })
}

pub fn bgdt_blocks(groups: u64) -> u64 {
    divide(groups * GROUP_DESC_SIZE, BLOCK_SIZE)
}

/// Reserved growth room for the group-descriptor table, capped at what the
/// resize inode's single indirect block can address (spec §4.7).
pub fn reserved_gdt_blocks(groups: u64) -> u64 {
    (groups * RESERVED_GDT_GROWTH_FACTOR).min(POINTERS_PER_BLOCK)
}

/// Overhead flex 0 alone pays on top of the uniform per-group overhead:
/// the superblock, the BGDT, and the reserved-GDT growth region.
pub fn flex0_extra(groups: u64) -> u64 {
    1 + bgdt_blocks(groups) + reserved_gdt_blocks(groups)
}

/// Largest power of two dividing `groups` for which flex 0's combined
/// overhead still fits within the span of one block group.
pub fn groups_per_flex(groups: u64, geometry: &GroupGeometry) -> u64 {
    let mut flex = 1u64;
    loop {
        let next = flex * 2;
        if next > groups || groups % next != 0 {
            break;
        }
        if next * geometry.overhead_per_group + flex0_extra(groups) > BLOCKS_PER_GROUP {
            break;
        }
        flex = next;
    }
    flex
}

#[derive(Debug, Clone, Copy)]
pub struct MinimumPlan {
    pub groups: u64,
    pub geometry: GroupGeometry,
    pub groups_per_flex: u64,
    pub journal_blocks: u64,
    pub total_blocks: u64,
}

/// Solves for the smallest valid ext4 image (spec §4.4 ext4 branch). Does
/// not implement the fragmentation-triggered retry the spec allows for —
/// single-attempt sizing, documented in DESIGN.md.
pub fn solve_minimum(filled_data_blocks: u64, node_count: u64, minimums: &Minimums) -> Result<MinimumPlan> {
    let min_inodes = minimums.min_inodes.max(node_count + minimums.min_free_inodes);
    let min_data_blocks = filled_data_blocks + divide(minimums.min_free_space, BLOCK_SIZE);

    let mut groups = divide(min_data_blocks.max(1), BLOCKS_PER_GROUP).max(1);
    loop {
        let geometry = group_geometry(groups, min_inodes, minimums.min_inodes_per_64mib)?;
        let gpf = groups_per_flex(groups, &geometry);
        let fixed_overhead = groups * geometry.overhead_per_group + flex0_extra(groups);
        let provisional_total = fixed_overhead + min_data_blocks;
        let journal_blocks = (provisional_total / 10).clamp(MIN_JOURNAL_BLOCKS, MAX_JOURNAL_BLOCKS);

        let capacity = (groups * BLOCKS_PER_GROUP).saturating_sub(fixed_overhead + journal_blocks);
        if min_data_blocks <= capacity {
            let total_blocks = fixed_overhead + journal_blocks + min_data_blocks;
            return Ok(MinimumPlan { groups, geometry, groups_per_flex: gpf, journal_blocks, total_blocks });
        }
        groups += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedGeometry {
    pub blocks: u64,
    pub groups: u64,
    pub geometry: GroupGeometry,
    pub groups_per_flex: u64,
    pub journal_blocks: u64,
    pub data_blocks_per_group: u64,
}

/// Fixed geometry for precompile. `journal_blocks` is carried over from the
/// minimum-size solve rather than recomputed: `size` only ever grows from
/// there, so the 10%-of-total ceiling can only loosen.
pub fn fix_geometry(size: u64, min_inodes: u64, min_inodes_per_64mib: u64, journal_blocks: u64) -> Result<FixedGeometry> {
    let blocks = size / BLOCK_SIZE;
    let groups = divide(blocks, BLOCKS_PER_GROUP).max(1);
    let geometry = group_geometry(groups, min_inodes, min_inodes_per_64mib)?;
    if geometry.overhead_per_group >= BLOCKS_PER_GROUP {
        return Err(CompileError::GeometryInfeasible(
            "per-group overhead leaves no room for data blocks".into(),
        ));
    }
    let groups_per_flex = groups_per_flex(groups, &geometry);
    let data_blocks_per_group = BLOCKS_PER_GROUP - geometry.overhead_per_group;
    Ok(FixedGeometry { blocks, groups, geometry, groups_per_flex, journal_blocks, data_blocks_per_group })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_yields_a_small_single_group_minimum() {
        let plan = solve_minimum(0, 1, &Minimums::default()).unwrap();
        assert_eq!(plan.groups, 1);
        assert!(plan.total_blocks > 0);
        assert!(plan.journal_blocks >= 1);
    }

    #[test]
    fn growing_data_requirement_can_force_a_second_group() {
        let plan = solve_minimum(BLOCKS_PER_GROUP, 1, &Minimums::default()).unwrap();
        assert!(plan.groups >= 2);
    }

    #[test]
    fn groups_per_flex_is_a_power_of_two_dividing_groups() {
        let geometry = group_geometry(8, 1, 0).unwrap();
        let gpf = groups_per_flex(8, &geometry);
        assert_eq!(8 % gpf, 0);
        assert_eq!(gpf & (gpf - 1), 0);
    }

    #[test]
    fn excessive_min_inodes_is_geometry_infeasible() {
        let minimums = Minimums { min_inodes: MAX_INODES_PER_GROUP * 10, ..Default::default() };
        let err = solve_minimum(0, 1, &minimums).unwrap_err();
        assert!(matches!(err, CompileError::GeometryInfeasible(_)));
    }

    #[test]
    fn journal_grows_past_the_minimum_for_large_images_and_caps_at_the_maximum() {
        // A large enough data requirement pushes one tenth of the total past
        // MIN_JOURNAL_BLOCKS, so the journal must grow with the image instead
        // of sitting frozen at the minimum.
        let plan = solve_minimum(BLOCKS_PER_GROUP * 50, 1, &Minimums::default()).unwrap();
        assert!(plan.journal_blocks > MIN_JOURNAL_BLOCKS);
        assert!(plan.journal_blocks <= MAX_JOURNAL_BLOCKS);

        // And an even larger one must clamp at MAX_JOURNAL_BLOCKS rather than
        // keep growing as a tenth of an ever-larger total.
        let huge = solve_minimum(BLOCKS_PER_GROUP * 5000, 1, &Minimums::default()).unwrap();
        assert_eq!(huge.journal_blocks, MAX_JOURNAL_BLOCKS);
    }
}
