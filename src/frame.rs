//! Physical page descriptor table.
//!
//! One [`PageFrame`] record per physical page, indexed by page number. Both
//! allocation strategies thread their free lists through the `link` field of
//! these records instead of writing link pointers into page memory, so a
//! stray write through a stale allocation cannot take the allocator's
//! bookkeeping down with it.

use core::ptr::NonNull;

use bitflags::bitflags;

/// Fixed page size managed by the allocators.
pub const PAGE_SIZE: usize = 4096;

/// Free-list link sentinel ("no next page").
pub const NIL: u32 = u32::MAX;

bitflags! {
    /// Per-page state bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Page is reserved and must never enter a free list.
        const RESERVED = 1 << 0;
        /// Page is the head of a free run; its `property` is meaningful.
        const PROPERTY = 1 << 1;
    }
}

/// Descriptor for one physical page.
#[derive(Clone, Copy, Debug)]
pub struct PageFrame {
    pub flags: PageFlags,
    pub ref_count: u32,
    /// Size in pages of the free run this page heads. Valid only while
    /// `PROPERTY` is set.
    pub property: u32,
    /// Index of the next free-run head in whatever list this page is on.
    pub link: u32,
}

impl PageFrame {
    /// Boot-time state: every page starts out reserved until an
    /// `init_memmap` releases it.
    pub const fn reserved() -> Self {
        Self {
            flags: PageFlags::RESERVED,
            ref_count: 0,
            property: 0,
            link: NIL,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.flags.contains(PageFlags::RESERVED)
    }

    pub fn is_property_head(&self) -> bool {
        self.flags.contains(PageFlags::PROPERTY)
    }

    /// Clears flags, reference count and run size.
    pub fn reset(&mut self) {
        self.flags = PageFlags::empty();
        self.ref_count = 0;
        self.property = 0;
    }

    pub fn set_property_head(&mut self, run_pages: u32) {
        self.property = run_pages;
        self.flags.insert(PageFlags::PROPERTY);
    }

    pub fn clear_property_head(&mut self) {
        self.property = 0;
        self.flags.remove(PageFlags::PROPERTY);
    }
}

/// The page descriptor table plus the base address of the page arena it
/// describes. Owns all page-index arithmetic and the index-linked free-list
/// primitives shared by both strategies.
pub struct FrameTable<'a> {
    frames: &'a mut [PageFrame],
    arena: NonNull<u8>,
}

// SAFETY: the table has exclusive access to its descriptor slice and arena;
// callers serialize use of the allocator that owns it.
unsafe impl Send for FrameTable<'_> {}

impl<'a> FrameTable<'a> {
    /// Builds a table over `frames.len()` pages of memory starting at
    /// `arena`. Every page starts out reserved.
    ///
    /// # Safety
    /// `arena` must point to `frames.len() * PAGE_SIZE` bytes of writable
    /// memory, aligned to at least 8 bytes, that nothing else accesses for
    /// the lifetime of the table.
    pub unsafe fn new(frames: &'a mut [PageFrame], arena: NonNull<u8>) -> Self {
        debug_assert!(frames.len() < NIL as usize);
        for frame in frames.iter_mut() {
            *frame = PageFrame::reserved();
        }
        Self { frames, arena }
    }

    /// Number of pages described by this table.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, idx: usize) -> &PageFrame {
        &self.frames[idx]
    }

    pub fn frame_mut(&mut self, idx: usize) -> &mut PageFrame {
        &mut self.frames[idx]
    }

    /// Page index -> address of the page's first byte.
    pub fn page_addr(&self, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < self.frames.len());
        // SAFETY: idx is in bounds, so the offset stays inside the arena.
        unsafe { NonNull::new_unchecked(self.arena.as_ptr().add(idx * PAGE_SIZE)) }
    }

    /// Address -> index of the containing page, or `None` if the address is
    /// outside the arena.
    pub fn page_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.arena.as_ptr() as usize)?;
        let idx = offset / PAGE_SIZE;
        if idx < self.frames.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Byte offset of `ptr` from the start of the arena, if inside it.
    pub fn arena_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.arena.as_ptr() as usize)?;
        if offset < self.frames.len() * PAGE_SIZE {
            Some(offset)
        } else {
            None
        }
    }

    /// Inserts `idx` into the address-sorted list rooted at `head` and
    /// returns the index of its new predecessor (`NIL` if it became the
    /// head). Walks are capped at the table length so a corrupted chain
    /// cannot spin forever.
    pub fn list_insert_sorted(&mut self, head: &mut u32, idx: usize) -> u32 {
        let mut prev = NIL;
        let mut cur = *head;
        let mut guard = self.frames.len() + 1;
        while cur != NIL && (cur as usize) < idx {
            guard -= 1;
            if guard == 0 {
                log::error!("frame: free-list walk exceeded table length, truncating");
                break;
            }
            prev = cur;
            cur = self.frames[cur as usize].link;
        }
        self.frames[idx].link = cur;
        if prev == NIL {
            *head = idx as u32;
        } else {
            self.frames[prev as usize].link = idx as u32;
        }
        prev
    }

    /// Pops the lowest-address entry of the list rooted at `head`.
    pub fn list_pop(&mut self, head: &mut u32) -> Option<usize> {
        if *head == NIL {
            return None;
        }
        let idx = *head as usize;
        *head = self.frames[idx].link;
        self.frames[idx].link = NIL;
        Some(idx)
    }

    /// Unlinks `idx` from the list rooted at `head`. Returns false if the
    /// entry was not found within the iteration ceiling.
    pub fn list_remove(&mut self, head: &mut u32, idx: usize) -> bool {
        let mut prev = NIL;
        let mut cur = *head;
        let mut guard = self.frames.len() + 1;
        while cur != NIL {
            guard -= 1;
            if guard == 0 {
                log::error!("frame: free-list walk exceeded table length, truncating");
                return false;
            }
            if cur as usize == idx {
                let next = self.frames[idx].link;
                if prev == NIL {
                    *head = next;
                } else {
                    self.frames[prev as usize].link = next;
                }
                self.frames[idx].link = NIL;
                return true;
            }
            prev = cur;
            cur = self.frames[cur as usize].link;
        }
        false
    }

    /// Calls `visit` for every entry of the list rooted at `head`, in list
    /// order. Returns false if the walk hit the iteration ceiling (a
    /// corruption signal), true otherwise.
    pub fn list_walk(&self, head: u32, mut visit: impl FnMut(usize, &PageFrame)) -> bool {
        let mut cur = head;
        let mut guard = self.frames.len() + 1;
        while cur != NIL {
            guard -= 1;
            if guard == 0 {
                return false;
            }
            let idx = cur as usize;
            visit(idx, &self.frames[idx]);
            cur = self.frames[idx].link;
        }
        true
    }
}
