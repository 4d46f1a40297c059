//! Slab allocator for small kernel objects.
//!
//! Nine fixed size classes (8..2048 bytes) are served from single-page
//! slabs; anything larger goes straight to the page allocator as a "big
//! block" carrying two redundant integrity headers. Each slab page starts
//! with a magic-tagged header followed by an array of fixed-stride object
//! slots; free slots are threaded into a singly-linked list through their
//! own first four bytes.
//!
//! A slab whose `inuse` count drops to zero is returned to the page
//! allocator immediately. That trades slab re-creation cost for a low
//! steady-state footprint.

mod check;


use core::mem;
use core::ptr::{self, NonNull};

use crate::error::CorruptionKind;
use crate::frame::PAGE_SIZE;
use crate::pmm::PhysAllocator;

pub use check::CacheUsage;

/// Object alignment guaranteed to callers.
pub const SLUB_ALIGN: usize = 8;

/// Fixed small-object size classes.
pub const SIZE_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];
pub const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// Intra-slab free-list terminator.
const SLOT_NIL: u32 = u32::MAX;

const SLAB_MAGIC: u32 = 0x51AB_51AB;
const BIG_MAGIC: u32 = 0xB16A_110C;
const BIG_GUARD: u32 = 0xF00D_CAFE;

const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Header at the base of every slab page.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    /// Index of the owning size class.
    cache: u32,
    total: u16,
    inuse: u16,
    free_head: u32,
    next: *mut SlabHeader,
}

/// Integrity header for page-run allocations above the largest size class.
/// Written twice per run: at the run base and immediately before the pointer
/// handed to the caller.
#[repr(C)]
#[derive(Clone, Copy)]
struct BigHeader {
    magic: u32,
    npages: u32,
    guard: u32,
    _pad: u32,
}

const BIG_HDR_SIZE: usize = mem::size_of::<BigHeader>();

/// Per-size-class slab bookkeeping: intrusive singly-linked `partial` and
/// `full` lists. A slab is on exactly one of them, except transiently while
/// an operation holds it popped.
pub(crate) struct KmemCache {
    pub(crate) obj_size: usize,
    pub(crate) obj_stride: usize,
    pub(crate) objs_per_slab: usize,
    pub(crate) partial: *mut SlabHeader,
    pub(crate) full: *mut SlabHeader,
}

impl KmemCache {
    fn push_partial(&mut self, slab: *mut SlabHeader) {
        // SAFETY: slab points at a live header owned by this cache.
        unsafe { (*slab).next = self.partial };
        self.partial = slab;
    }

    fn push_full(&mut self, slab: *mut SlabHeader) {
        unsafe { (*slab).next = self.full };
        self.full = slab;
    }

    fn pop_partial(&mut self) -> Option<*mut SlabHeader> {
        if self.partial.is_null() {
            return None;
        }
        let slab = self.partial;
        unsafe {
            self.partial = (*slab).next;
            (*slab).next = ptr::null_mut();
        }
        Some(slab)
    }

    /// Removes `slab` from whichever list currently holds it.
    fn unlink(&mut self, slab: *mut SlabHeader) {
        unsafe {
            if !unlink_from(&mut self.partial, slab) {
                unlink_from(&mut self.full, slab);
            }
        }
    }
}

/// Unlinks `slab` from the list rooted at `head`, C-style through a pointer
/// to the incoming link.
///
/// # Safety
/// Every `next` pointer reachable from `head` must point at a live header.
unsafe fn unlink_from(head: &mut *mut SlabHeader, slab: *mut SlabHeader) -> bool {
    let mut pp: *mut *mut SlabHeader = head;
    while !(*pp).is_null() {
        if *pp == slab {
            *pp = (*slab).next;
            (*slab).next = ptr::null_mut();
            return true;
        }
        pp = &mut (**pp).next;
    }
    false
}

/// First object slot of a slab: header end rounded up to `SLUB_ALIGN`.
unsafe fn obj_base(slab: *mut SlabHeader) -> *mut u8 {
    (align_up(slab as usize + mem::size_of::<SlabHeader>(), SLUB_ALIGN)) as *mut u8
}

unsafe fn slot_ptr(slab: *mut SlabHeader, stride: usize, idx: u32) -> *mut u8 {
    obj_base(slab).add(stride * idx as usize)
}

unsafe fn ptr_to_index(slab: *mut SlabHeader, stride: usize, p: *mut u8) -> u32 {
    ((p as usize - obj_base(slab) as usize) / stride) as u32
}

/// Rethreads the whole free list 0 -> 1 -> ... -> NIL and zeroes `inuse`.
/// Used both at slab creation and as the self-heal path when the list head
/// has been clobbered.
unsafe fn rebuild_free_list(slab: *mut SlabHeader, stride: usize) {
    let n = (*slab).total as u32;
    for i in 0..n {
        let next = if i + 1 < n { i + 1 } else { SLOT_NIL };
        ptr::write(slot_ptr(slab, stride, i).cast::<u32>(), next);
    }
    (*slab).free_head = 0;
    (*slab).inuse = 0;
}

/// The object allocator: size-class caches over a physical page allocator.
pub struct SlubAllocator<'a> {
    pmm: PhysAllocator<'a>,
    caches: [KmemCache; NUM_CLASSES],
}

// SAFETY: all raw pointers target the arena the inner PhysAllocator owns
// exclusively; callers serialize access.
unsafe impl Send for SlubAllocator<'_> {}

impl<'a> SlubAllocator<'a> {
    pub fn new(pmm: PhysAllocator<'a>) -> Self {
        let caches = SIZE_CLASSES.map(|size| KmemCache {
            obj_size: size,
            obj_stride: align_up(size.max(mem::size_of::<u32>()), SLUB_ALIGN),
            objs_per_slab: 0,
            partial: ptr::null_mut(),
            full: ptr::null_mut(),
        });
        log::info!("slub: {} caches ready (8..2048 bytes)", NUM_CLASSES);
        Self { pmm, caches }
    }

    pub fn pmm(&self) -> &PhysAllocator<'a> {
        &self.pmm
    }

    pub fn pmm_mut(&mut self) -> &mut PhysAllocator<'a> {
        &mut self.pmm
    }

    pub fn nr_free_pages(&self) -> usize {
        self.pmm.nr_free_pages()
    }

    pub(crate) fn caches(&self) -> &[KmemCache; NUM_CLASSES] {
        &self.caches
    }

    /// Smallest class covering `n` bytes, or `None` for the big-block path.
    fn class_index(n: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&size| n <= size)
    }

    /// Allocates `n` bytes. Returns `None` when the page allocator is
    /// exhausted; the result is aligned to [`SLUB_ALIGN`] and not zeroed.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        let n = n.max(1);
        let Some(class) = Self::class_index(n) else {
            return self.allocate_big(n);
        };

        let slab = match self.caches[class].pop_partial() {
            Some(slab) => slab,
            None => self.slab_create(class)?,
        };
        let stride = self.caches[class].obj_stride;

        // SAFETY: slab came from this cache (or was just created); its
        // header and slots live in a page we own.
        unsafe {
            if (*slab).free_head == SLOT_NIL {
                // A slab with space must have a free slot; the list head was
                // clobbered. Rebuild rather than fail: total stays accurate.
                log::warn!(
                    "slub: free list lost on a class-{} slab, rebuilding",
                    self.caches[class].obj_size
                );
                rebuild_free_list(slab, stride);
            }

            let idx = (*slab).free_head;
            let obj = slot_ptr(slab, stride, idx);
            (*slab).free_head = ptr::read(obj.cast::<u32>());
            (*slab).inuse += 1;

            if (*slab).inuse < (*slab).total {
                self.caches[class].push_partial(slab);
            } else {
                self.caches[class].push_full(slab);
            }
            NonNull::new(obj)
        }
    }

    /// [`Self::allocate`] followed by zero-filling the `n` requested bytes.
    pub fn allocate_zeroed(&mut self, n: usize) -> Option<NonNull<u8>> {
        let p = self.allocate(n)?;
        // SAFETY: the allocation covers at least n bytes.
        unsafe { ptr::write_bytes(p.as_ptr(), 0, n.max(1)) };
        Some(p)
    }

    /// Frees an allocation previously returned by [`Self::allocate`].
    ///
    /// Classifies the pointer by signature: the mirror big-block header just
    /// before it (checked first; it is the hot path for awkward pointers),
    /// then the slab magic at its page base, then a big-block header at the
    /// page base. A pointer matching none of these is fatal corruption.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let p = ptr.as_ptr();
        let Some(page) = self.pmm.table().page_of(ptr) else {
            panic!("slub: free {:p}: {}", p, CorruptionKind::Classify);
        };
        let page_base = self.pmm.table().page_addr(page).as_ptr();
        let arena_off = self.pmm.table().arena_offset(ptr).unwrap_or(0);

        // SAFETY: p and its page base lie inside the arena; header reads
        // stay within it because of the arena_off bound.
        unsafe {
            if arena_off >= BIG_HDR_SIZE {
                let mirror = p.sub(BIG_HDR_SIZE).cast::<BigHeader>();
                if (*mirror).magic == BIG_MAGIC && (*mirror).guard == BIG_GUARD {
                    self.free_big(mirror);
                    return;
                }
            }

            let slab = page_base.cast::<SlabHeader>();
            if (*slab).magic == SLAB_MAGIC {
                self.free_small(slab, p);
                return;
            }

            let head = page_base.cast::<BigHeader>();
            if (*head).magic == BIG_MAGIC && (*head).guard == BIG_GUARD {
                self.free_big(head);
                return;
            }
        }
        panic!("slub: free {:p}: {}", p, CorruptionKind::Classify);
    }

    /// Diagnostic self-test over both tiers. Not authoritative.
    pub fn check(&mut self) {
        self.pmm.check();
        let a = self.allocate(64);
        let b = self.allocate(64);
        debug_assert!(a.is_some() && b.is_some() && a != b);
        if let Some(b) = b {
            self.free(b);
        }
        if let Some(a) = a {
            self.free(a);
        }
        debug_assert!(self.check_invariants(true));
        log::info!("slub: self-check passed");
    }

    fn slab_create(&mut self, class: usize) -> Option<*mut SlabHeader> {
        let stride = self.caches[class].obj_stride;
        let page = self.pmm.alloc_pages(1)?;
        let base = self.pmm.table().page_addr(page).as_ptr();

        // SAFETY: the page is exclusively ours; header plus slot array fit
        // in PAGE_SIZE for every size class.
        unsafe {
            let slab = base.cast::<SlabHeader>();
            ptr::write(
                slab,
                SlabHeader {
                    magic: SLAB_MAGIC,
                    cache: class as u32,
                    total: 0,
                    inuse: 0,
                    free_head: 0,
                    next: ptr::null_mut(),
                },
            );
            let header = obj_base(slab) as usize - slab as usize;
            let nobj = (PAGE_SIZE - header) / stride;
            if nobj == 0 {
                self.pmm.free_pages(page, 1);
                return None;
            }
            (*slab).total = nobj as u16;
            rebuild_free_list(slab, stride);

            if self.caches[class].objs_per_slab == 0 {
                self.caches[class].objs_per_slab = nobj;
            }
            log::debug!(
                "slub: new slab class={} stride={} objs={}",
                self.caches[class].obj_size,
                stride,
                nobj
            );
            Some(slab)
        }
    }

    /// Returns a slab's page to the physical allocator. The magic is
    /// cleared first so a later double free classifies as corruption
    /// instead of resurrecting the slab.
    fn slab_destroy(&mut self, slab: *mut SlabHeader) {
        // SAFETY: slab points at the base of a page we allocated.
        unsafe {
            debug_assert_eq!((*slab).magic, SLAB_MAGIC);
            (*slab).magic = 0;
        }
        let addr = NonNull::new(slab.cast::<u8>()).unwrap_or_else(|| {
            panic!("slub: {}", CorruptionKind::Classify);
        });
        match self.pmm.table().page_of(addr) {
            Some(page) => self.pmm.free_pages(page, 1),
            None => panic!("slub: slab header outside arena: {}", CorruptionKind::Classify),
        }
    }

    /// # Safety
    /// `slab` must be a live slab header and `p` an object pointer inside
    /// its page.
    unsafe fn free_small(&mut self, slab: *mut SlabHeader, p: *mut u8) {
        let class = (*slab).cache as usize;
        if class >= NUM_CLASSES {
            panic!("slub: free {:p}: {}", p, CorruptionKind::Classify);
        }
        let stride = self.caches[class].obj_stride;
        self.caches[class].unlink(slab);

        let idx = ptr_to_index(slab, stride, p);
        if idx >= (*slab).total as u32 {
            panic!("slub: free {:p}: {}", p, CorruptionKind::FreeIndex);
        }
        if (*slab).inuse == 0 {
            panic!("slub: free {:p}: {}", p, CorruptionKind::CountMismatch);
        }

        ptr::write(p.cast::<u32>(), (*slab).free_head);
        (*slab).free_head = idx;
        (*slab).inuse -= 1;

        if (*slab).inuse == 0 {
            self.slab_destroy(slab);
        } else {
            self.caches[class].push_partial(slab);
        }
    }

    /// Big-block path: whole page runs with redundant headers.
    fn allocate_big(&mut self, n: usize) -> Option<NonNull<u8>> {
        let need = n + 2 * BIG_HDR_SIZE;
        let npages = need.div_ceil(PAGE_SIZE);
        let page = self.pmm.alloc_pages(npages)?;
        let base = self.pmm.table().page_addr(page).as_ptr();

        let header = BigHeader {
            magic: BIG_MAGIC,
            npages: npages as u32,
            guard: BIG_GUARD,
            _pad: 0,
        };
        // SAFETY: the run is exclusively ours and covers both header slots
        // plus n bytes of payload.
        unsafe {
            ptr::write(base.cast::<BigHeader>(), header);
            let ret = base.add(2 * BIG_HDR_SIZE);
            ptr::write(ret.sub(BIG_HDR_SIZE).cast::<BigHeader>(), header);
            NonNull::new(ret)
        }
    }

    /// # Safety
    /// `hdr` must point inside the arena at a header whose magic pair was
    /// just validated (it is re-validated here for direct callers).
    unsafe fn free_big(&mut self, hdr: *mut BigHeader) {
        if (*hdr).magic != BIG_MAGIC || (*hdr).guard != BIG_GUARD {
            // The run's origin and extent cannot be trusted; freeing
            // anything here risks unrelated memory.
            panic!("slub: {}", CorruptionKind::BigHeader);
        }
        let npages = (*hdr).npages as usize;
        let addr = NonNull::new_unchecked(hdr.cast::<u8>());
        let Some(page) = self.pmm.table().page_of(addr) else {
            panic!("slub: {}", CorruptionKind::BigHeader);
        };
        if npages == 0 || page + npages > self.pmm.table().len() {
            panic!("slub: {}", CorruptionKind::BigHeader);
        }

        // Zero both headers so a double free cannot re-validate stale
        // magics, then give the run back.
        let base = self.pmm.table().page_addr(page).as_ptr();
        let zero = BigHeader {
            magic: 0,
            npages: 0,
            guard: 0,
            _pad: 0,
        };
        ptr::write(base.cast::<BigHeader>(), zero);
        ptr::write(base.add(BIG_HDR_SIZE).cast::<BigHeader>(), zero);
        self.pmm.free_pages(page, npages);
    }
}
