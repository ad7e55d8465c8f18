//! Reference-vector checks for the shared block arithmetic (spec §8,
//! properties #7-#9), exercised through the crate's public surface rather
//! than the in-module unit tests.

use fsimage::arith::{align, divide, ext2_block_type, ext2_indirect_blocks};

#[test]
fn divide_rounds_up_and_align_rounds_to_a_multiple() {
    assert_eq!(divide(0, 4096), 0);
    assert_eq!(divide(1, 4096), 1);
    assert_eq!(divide(4096, 4096), 1);
    assert_eq!(divide(4097, 4096), 2);

    assert_eq!(align(0, 4096), 0);
    assert_eq!(align(1, 4096), 4096);
    assert_eq!(align(4096, 4096), 4096);
    assert_eq!(align(4097, 4096), 8192);
}

#[test]
fn ext2_indirect_blocks_matches_reference_vectors() {
    for n in [0, 1, 7, 12] {
        assert_eq!(ext2_indirect_blocks(n).unwrap(), 0, "n={n}");
    }
    for n in [13, 128, 1024, 1036] {
        assert_eq!(ext2_indirect_blocks(n).unwrap(), 1, "n={n}");
    }
    assert_eq!(ext2_indirect_blocks(1037).unwrap(), 3);
}

#[test]
fn ext2_indirect_blocks_rejects_sizes_beyond_triple_indirect() {
    // POINTERS_PER_BLOCK = 1024, so the quad threshold sits at
    // 12 + 1024 + 1024^2 + 1024^3 content blocks.
    let quad = 12 + 1024 + 1024 * 1024 + 1024 * 1024 * 1024;
    assert!(ext2_indirect_blocks(quad + 1).is_err());
}

#[test]
fn ext2_block_type_classifies_direct_and_single_indirect_positions() {
    for i in 0..=11 {
        assert_eq!(ext2_block_type(i), 0, "i={i}");
    }
    assert_eq!(ext2_block_type(12), 1);
    assert_eq!(ext2_block_type(13), 0);
}

#[test]
fn divide_and_align_are_idempotent_on_already_aligned_values() {
    for n in [0u64, 4096, 8192, 65536] {
        let aligned = align(n, 4096);
        assert_eq!(aligned, n);
        assert_eq!(align(aligned, 4096), aligned);
    }
}
