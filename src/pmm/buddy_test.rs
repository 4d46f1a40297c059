//! Buddy allocator tests.

use crate::pmm::{BuddyPmm, PhysAllocator, PmmStrategy, StrategyKind};
use crate::testutil;

fn buddy_over(npages: usize) -> (BuddyPmm, crate::FrameTable<'static>) {
    let mut table = testutil::leak_table(npages);
    let mut buddy = BuddyPmm::new();
    buddy.init();
    buddy.init_memmap(&mut table, 0, npages);
    (buddy, table)
}

#[test]
fn init_decomposes_into_one_maximal_block() {
    let (buddy, table) = buddy_over(64);
    assert_eq!(buddy.nr_free_pages(), 64);
    let stats = buddy.stats();
    assert_eq!(stats.free_counts[6], 1);
    assert_eq!(stats.free_counts.iter().sum::<usize>(), 1);
    assert!(buddy.check_invariants(&table));
}

#[test]
fn init_decomposes_unaligned_range_greedily() {
    let mut table = testutil::leak_table(16);
    let mut buddy = BuddyPmm::new();
    buddy.init();
    buddy.init_memmap(&mut table, 3, 13);

    assert_eq!(buddy.nr_free_pages(), 13);
    let stats = buddy.stats();
    // [3,4) + [4,8) + [8,16)
    assert_eq!(stats.free_counts[0], 1);
    assert_eq!(stats.free_counts[2], 1);
    assert_eq!(stats.free_counts[3], 1);
    assert!(buddy.check_invariants(&table));

    // 13 free pages but no aligned contiguous run of 13.
    assert_eq!(buddy.alloc_pages(&mut table, 13), None);
    assert_eq!(buddy.alloc_pages(&mut table, 8), Some(8));
}

#[test]
fn single_page_split_and_coalesce_round_trip() {
    let (mut buddy, mut table) = buddy_over(64);

    assert_eq!(buddy.alloc_pages(&mut table, 1), Some(0));
    assert_eq!(buddy.nr_free_pages(), 63);
    let stats = buddy.stats();
    for k in 0..6 {
        assert_eq!(stats.free_counts[k], 1, "order {k}");
    }
    assert!(!table.frame(0).is_property_head());

    buddy.free_pages(&mut table, 0, 1);
    assert_eq!(buddy.nr_free_pages(), 64);
    let stats = buddy.stats();
    assert_eq!(stats.free_counts[6], 1);
    assert_eq!(stats.free_counts.iter().sum::<usize>(), 1);
    assert!(stats.coalesce_events >= 6);
    assert!(buddy.check_invariants(&table));
}

#[test]
fn order_block_round_trip_restores_position() {
    let (mut buddy, mut table) = buddy_over(64);

    let blk = buddy.alloc_pages(&mut table, 8).unwrap();
    assert_eq!(blk, 0);
    buddy.free_pages(&mut table, blk, 8);

    // The pre-allocation state is back: one order-6 block, and it is the
    // same block (a full-range allocation lands at the same head).
    let stats = buddy.stats();
    assert_eq!(stats.free_counts[6], 1);
    assert_eq!(buddy.alloc_pages(&mut table, 64), Some(0));
    buddy.free_pages(&mut table, 0, 64);
    assert!(buddy.check_invariants(&table));
}

#[test]
fn non_power_of_two_alloc_returns_exact_run() {
    let (mut buddy, mut table) = buddy_over(64);

    // 7 pages: order-3 block minus one page handed back.
    let blk = buddy.alloc_pages(&mut table, 7).unwrap();
    assert_eq!(blk, 0);
    assert_eq!(buddy.nr_free_pages(), 57);
    assert!(table.frame(7).is_property_head());
    assert_eq!(table.frame(7).property, 1);

    buddy.free_pages(&mut table, blk, 7);
    assert_eq!(buddy.nr_free_pages(), 64);
    assert_eq!(buddy.stats().free_counts[6], 1);
    assert!(buddy.check_invariants(&table));
}

#[test]
fn multi_chunk_free_coalesces_fully() {
    // Freed ranges that are neither powers of two nor aligned exercise the
    // chunk-by-chunk loop with its recomputed cursor.
    for n in [3usize, 5, 6, 7, 11, 13] {
        let (mut buddy, mut table) = buddy_over(64);
        let blk = buddy.alloc_pages(&mut table, n).unwrap();
        buddy.free_pages(&mut table, blk, n);
        assert_eq!(buddy.nr_free_pages(), 64, "n={n}");
        assert_eq!(buddy.stats().free_counts[6], 1, "n={n}");
        assert!(buddy.check_invariants(&table), "n={n}");
    }
}

#[test]
fn exhaustion_returns_none_not_partial() {
    let (mut buddy, mut table) = buddy_over(64);
    assert_eq!(buddy.alloc_pages(&mut table, 65), None);
    assert_eq!(buddy.nr_free_pages(), 64);

    let all = buddy.alloc_pages(&mut table, 64).unwrap();
    assert_eq!(buddy.alloc_pages(&mut table, 1), None);
    buddy.free_pages(&mut table, all, 64);
    assert_eq!(buddy.nr_free_pages(), 64);
}

#[test]
fn disjoint_ranges_never_merge_across_the_gap() {
    let mut table = testutil::leak_table(32);
    let mut buddy = BuddyPmm::new();
    buddy.init();
    buddy.init_memmap(&mut table, 0, 8);
    buddy.init_memmap(&mut table, 16, 8);

    assert_eq!(buddy.nr_free_pages(), 16);
    assert_eq!(buddy.alloc_pages(&mut table, 16), None);
    let a = buddy.alloc_pages(&mut table, 8).unwrap();
    let b = buddy.alloc_pages(&mut table, 8).unwrap();
    assert_ne!(a, b);
    buddy.free_pages(&mut table, a, 8);
    buddy.free_pages(&mut table, b, 8);
    assert!(buddy.check_invariants(&table));
}

#[test]
fn interleaved_alloc_free_keeps_invariants() {
    let (mut buddy, mut table) = buddy_over(64);
    let mut live = Vec::new();
    for n in [1usize, 2, 3, 4, 5] {
        live.push((buddy.alloc_pages(&mut table, n).unwrap(), n));
        assert!(buddy.check_invariants(&table));
    }
    // Free out of allocation order.
    for (base, n) in [live[3], live[0], live[4], live[1], live[2]] {
        buddy.free_pages(&mut table, base, n);
        assert!(buddy.check_invariants(&table));
    }
    assert_eq!(buddy.nr_free_pages(), 64);
    assert_eq!(buddy.stats().free_counts[6], 1);
}

#[test]
fn self_check_and_dump_run_clean() {
    let (mut buddy, mut table) = buddy_over(64);
    buddy.check(&mut table);
    let mut text = String::new();
    buddy.dump_free(&table, &mut text).unwrap();
    assert!(text.contains("[buddy] 64 pages free"));
    assert!(text.contains("order=6"));
}

#[test]
fn phys_allocator_front_delegates() {
    let mut pmm = PhysAllocator::new(testutil::leak_table(64), StrategyKind::Buddy);
    assert_eq!(pmm.strategy_name(), "buddy");
    pmm.init_memmap(0, 64);
    let run = pmm.alloc_pages(4).unwrap();
    assert_eq!(pmm.nr_free_pages(), 60);
    pmm.free_pages(run, 4);
    assert_eq!(pmm.nr_free_pages(), 64);
    assert!(pmm.check_invariants());
    pmm.check();
}
