//! Optional kernel-wide allocator front.
//!
//! Wraps one [`SlubAllocator`] in a spinlock and exposes the classic
//! `kmalloc`/`kzalloc`/`kfree` entry points. The core allocator takes no
//! locks itself; this mutex is the external serialization the contract
//! requires.

use core::ptr::NonNull;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::pmm::PhysAllocator;
use crate::slub::SlubAllocator;

lazy_static! {
    static ref KERNEL_HEAP: Mutex<Option<SlubAllocator<'static>>> = Mutex::new(None);
}

/// Installs the global allocator over an already-initialized physical
/// allocator. Panics on double initialization.
pub fn init(pmm: PhysAllocator<'static>) {
    let mut heap = KERNEL_HEAP.lock();
    if heap.is_some() {
        panic!("global allocator already initialized");
    }
    *heap = Some(SlubAllocator::new(pmm));
    log::info!("global: kernel heap installed");
}

/// Allocates `n` bytes, or `None` before init / on exhaustion.
pub fn kmalloc(n: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.lock().as_mut()?.allocate(n)
}

/// Allocates `n` zero-filled bytes.
pub fn kzalloc(n: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.lock().as_mut()?.allocate_zeroed(n)
}

/// Frees an allocation returned by [`kmalloc`]/[`kzalloc`].
pub fn kfree(ptr: NonNull<u8>) {
    match KERNEL_HEAP.lock().as_mut() {
        Some(heap) => heap.free(ptr),
        None => log::error!("global: kfree before init, leaking {:p}", ptr),
    }
}

pub fn nr_free_pages() -> usize {
    KERNEL_HEAP.lock().as_ref().map_or(0, |heap| heap.nr_free_pages())
}

pub fn check_invariants(fatal: bool) -> bool {
    KERNEL_HEAP
        .lock()
        .as_ref()
        .map_or(true, |heap| heap.check_invariants(fatal))
}

pub fn dump_stats(verbose: bool) -> heapless::String<4096> {
    KERNEL_HEAP
        .lock()
        .as_ref()
        .map_or_else(heapless::String::new, |heap| heap.dump_stats(verbose))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::StrategyKind;
    use crate::testutil;

    // The global heap is process-wide state, so everything that touches it
    // lives in this one test.
    #[test]
    fn kmalloc_round_trip() {
        assert_eq!(kmalloc(64), None);

        init(testutil::phys(64, StrategyKind::Buddy));
        let before = nr_free_pages();

        let a = kmalloc(64).unwrap();
        let z = kzalloc(256).unwrap();
        unsafe {
            assert_eq!(*z.as_ptr(), 0);
            assert_eq!(*z.as_ptr().add(255), 0);
        }
        let big = kmalloc(3000).unwrap();
        assert!(check_invariants(true));

        let text = dump_stats(false);
        assert!(text.contains("class=64"));

        kfree(big);
        kfree(z);
        kfree(a);
        assert!(check_invariants(true));
        assert_eq!(nr_free_pages(), before);
    }
}
