//! Test-only helpers: leaked page arenas backing a [`FrameTable`].

use core::ptr::NonNull;

use crate::frame::{FrameTable, PageFrame, PAGE_SIZE};
use crate::pmm::{PhysAllocator, StrategyKind};

/// Leaks an arena of `npages` pages plus its descriptor table. The u64
/// backing store keeps the arena 8-byte aligned.
pub fn leak_table(npages: usize) -> FrameTable<'static> {
    let arena: &'static mut [u64] = Vec::leak(vec![0u64; npages * PAGE_SIZE / 8]);
    let frames: &'static mut [PageFrame] = Vec::leak(vec![PageFrame::reserved(); npages]);
    let base = NonNull::new(arena.as_mut_ptr().cast::<u8>()).unwrap();
    unsafe { FrameTable::new(frames, base) }
}

/// A physical allocator over a leaked arena with the whole range released.
pub fn phys(npages: usize, kind: StrategyKind) -> PhysAllocator<'static> {
    let mut pmm = PhysAllocator::new(leak_table(npages), kind);
    pmm.init_memmap(0, npages);
    pmm
}
