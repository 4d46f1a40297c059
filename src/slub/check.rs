//! Consistency checking and fragmentation reporting for the slab tier.
//!
//! Every walk here is cycle-safe: sibling lists get a tortoise-and-hare
//! pass before traversal plus a hard iteration ceiling, and intra-slab free
//! lists are bounded by the slab's own slot count, so a corrupted list can
//! report but never hang the checker.

use core::fmt;

use crate::error::CorruptionKind;

use super::{slot_ptr, SlabHeader, SlubAllocator, NUM_CLASSES, SLOT_NIL};

/// Hard ceiling on sibling-list walks.
const GUARD_MAX: usize = 100_000;

/// Per-class usage snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheUsage {
    pub obj_size: usize,
    pub obj_stride: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub inuse: usize,
    pub total: usize,
}

impl CacheUsage {
    /// Bytes the callers asked for across live objects.
    pub fn bytes_requested(&self) -> usize {
        self.inuse * self.obj_size
    }

    /// Bytes of object capacity currently held in slabs.
    pub fn bytes_capacity(&self, objs_per_slab: usize) -> usize {
        (self.partial_slabs + self.full_slabs) * objs_per_slab * self.obj_stride
    }
}

/// Floyd cycle detection over a slab sibling list.
fn has_cycle(head: *const SlabHeader) -> bool {
    let mut slow = head;
    let mut fast = head;
    // SAFETY: next pointers are followed read-only; the two-pointer scheme
    // terminates on any finite or cyclic chain.
    unsafe {
        while !fast.is_null() && !(*fast).next.is_null() {
            slow = (*slow).next;
            fast = (*(*fast).next).next;
            if slow == fast {
                return true;
            }
        }
    }
    false
}

fn report(fatal: bool, ok: &mut bool, kind: CorruptionKind, class_size: usize) {
    if fatal {
        panic!("slub: {} (class={})", kind, class_size);
    }
    log::error!("slub: {} (class={})", kind, class_size);
    *ok = false;
}

impl SlubAllocator<'_> {
    /// Verifies the slab tier's invariants for every size class.
    ///
    /// With `fatal` set, the first violation panics (test-time strict
    /// verification); otherwise every violation is logged and `false`
    /// returned (production self-defense).
    pub fn check_invariants(&self, fatal: bool) -> bool {
        let mut ok = true;
        for cache in self.caches() {
            if has_cycle(cache.partial) || has_cycle(cache.full) {
                report(fatal, &mut ok, CorruptionKind::ListCycle, cache.obj_size);
                continue;
            }

            let mut guard = 0;
            let mut slab = cache.partial;
            // SAFETY: the list is cycle-free (checked above) and every node
            // is a live slab header.
            unsafe {
                while !slab.is_null() {
                    guard += 1;
                    if guard > GUARD_MAX {
                        report(fatal, &mut ok, CorruptionKind::ListOverrun, cache.obj_size);
                        break;
                    }
                    if (*slab).inuse > (*slab).total {
                        report(fatal, &mut ok, CorruptionKind::CountMismatch, cache.obj_size);
                    }
                    // Walk the free-slot chain: indices in range, no loops,
                    // length bounded by total.
                    let mut seen = 0;
                    let mut idx = (*slab).free_head;
                    while idx != SLOT_NIL {
                        if idx >= (*slab).total as u32 {
                            report(fatal, &mut ok, CorruptionKind::FreeIndex, cache.obj_size);
                            break;
                        }
                        idx = *slot_ptr(slab, cache.obj_stride, idx).cast::<u32>();
                        seen += 1;
                        if seen > (*slab).total {
                            report(fatal, &mut ok, CorruptionKind::ListCycle, cache.obj_size);
                            break;
                        }
                    }
                    slab = (*slab).next;
                }

                guard = 0;
                slab = cache.full;
                while !slab.is_null() {
                    guard += 1;
                    if guard > GUARD_MAX {
                        report(fatal, &mut ok, CorruptionKind::ListOverrun, cache.obj_size);
                        break;
                    }
                    if (*slab).inuse != (*slab).total {
                        report(fatal, &mut ok, CorruptionKind::CountMismatch, cache.obj_size);
                    }
                    slab = (*slab).next;
                }
            }
        }
        if ok {
            log::debug!("slub: invariants ok");
        }
        ok
    }

    /// Per-class usage totals, in size-class order.
    pub fn usage(&self) -> [CacheUsage; NUM_CLASSES] {
        let mut out = [CacheUsage::default(); NUM_CLASSES];
        for (cache, usage) in self.caches().iter().zip(out.iter_mut()) {
            usage.obj_size = cache.obj_size;
            usage.obj_stride = cache.obj_stride;
            // SAFETY: sibling lists are live headers; walks are bounded.
            unsafe {
                let mut slab = cache.partial;
                let mut guard = 0;
                while !slab.is_null() && guard <= GUARD_MAX {
                    usage.partial_slabs += 1;
                    usage.inuse += (*slab).inuse as usize;
                    usage.total += (*slab).total as usize;
                    slab = (*slab).next;
                    guard += 1;
                }
                let mut slab = cache.full;
                guard = 0;
                while !slab.is_null() && guard <= GUARD_MAX {
                    usage.full_slabs += 1;
                    usage.inuse += (*slab).total as usize;
                    usage.total += (*slab).total as usize;
                    slab = (*slab).next;
                    guard += 1;
                }
            }
        }
        out
    }

    /// Writes the per-class fragmentation report to `out`. `verbose` adds a
    /// line per partial slab.
    pub fn dump_stats_to(&self, out: &mut dyn fmt::Write, verbose: bool) -> fmt::Result {
        writeln!(out, "[slub] stats")?;
        for (cache, usage) in self.caches().iter().zip(self.usage()) {
            let requested = usage.bytes_requested();
            let capacity = usage.bytes_capacity(cache.objs_per_slab);
            writeln!(
                out,
                "  class={:<4} stride={:<4} slabs(partial={}, full={}) objs={}/{} frag={}B",
                usage.obj_size,
                usage.obj_stride,
                usage.partial_slabs,
                usage.full_slabs,
                usage.inuse,
                usage.total,
                capacity.saturating_sub(requested)
            )?;
            if verbose {
                // SAFETY: bounded walk over live headers.
                unsafe {
                    let mut slab = cache.partial;
                    let mut guard = 0;
                    while !slab.is_null() && guard <= GUARD_MAX {
                        writeln!(
                            out,
                            "    [partial] inuse={} total={} free_head={}",
                            (*slab).inuse,
                            (*slab).total,
                            (*slab).free_head
                        )?;
                        slab = (*slab).next;
                        guard += 1;
                    }
                }
            }
        }
        writeln!(out, "[slub] stats end")
    }

    /// [`Self::dump_stats_to`] into a fixed-capacity buffer; output past the
    /// buffer's end is dropped.
    pub fn dump_stats(&self, verbose: bool) -> heapless::String<4096> {
        let mut text = heapless::String::new();
        let _ = self.dump_stats_to(&mut text, verbose);
        text
    }
}
