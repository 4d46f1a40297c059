//! Buddy-system page allocator.
//!
//! Free blocks are powers of two in size, each aligned to its own size in
//! page-index space, and live on one address-sorted free list per order.
//! Allocation pops the smallest sufficient order and halves the block down;
//! freeing peels maximal aligned chunks off the range and coalesces each
//! chunk with its XOR buddy as far up the orders as it will go.

use core::fmt;

use crate::frame::{FrameTable, NIL};

use super::PmmStrategy;

/// Largest block order: blocks span `2^order` pages, order 0..=14.
pub const MAX_ORDER: usize = 14;
const ORDER_COUNT: usize = MAX_ORDER + 1;

const fn order_pages(k: usize) -> usize {
    1 << k
}

fn ilog2_floor(x: usize) -> usize {
    debug_assert!(x > 0);
    x.ilog2() as usize
}

fn ilog2_ceil(x: usize) -> usize {
    let k = ilog2_floor(x);
    if 1usize << k == x {
        k
    } else {
        k + 1
    }
}

/// Snapshot of the buddy allocator's free lists and event counters.
#[derive(Clone, Copy, Debug)]
pub struct BuddyStats {
    /// Free block count per order.
    pub free_counts: [usize; ORDER_COUNT],
    pub total_free_pages: usize,
    pub alloc_calls: usize,
    pub free_calls: usize,
    pub coalesce_events: usize,
}

pub struct BuddyPmm {
    free_heads: [u32; ORDER_COUNT],
    free_counts: [usize; ORDER_COUNT],
    total_free: usize,
    alloc_calls: usize,
    free_calls: usize,
    coalesce_events: usize,
}

impl BuddyPmm {
    pub const fn new() -> Self {
        Self {
            free_heads: [NIL; ORDER_COUNT],
            free_counts: [0; ORDER_COUNT],
            total_free: 0,
            alloc_calls: 0,
            free_calls: 0,
            coalesce_events: 0,
        }
    }

    pub fn stats(&self) -> BuddyStats {
        BuddyStats {
            free_counts: self.free_counts,
            total_free_pages: self.total_free,
            alloc_calls: self.alloc_calls,
            free_calls: self.free_calls,
            coalesce_events: self.coalesce_events,
        }
    }

    fn area_push(&mut self, table: &mut FrameTable<'_>, k: usize, idx: usize) {
        table.list_insert_sorted(&mut self.free_heads[k], idx);
        self.free_counts[k] += 1;
        self.total_free += order_pages(k);
    }

    fn area_pop(&mut self, table: &mut FrameTable<'_>, k: usize) -> Option<usize> {
        let idx = table.list_pop(&mut self.free_heads[k])?;
        self.free_counts[k] -= 1;
        self.total_free -= order_pages(k);
        Some(idx)
    }

    fn area_remove(&mut self, table: &mut FrameTable<'_>, k: usize, idx: usize) -> bool {
        if !table.list_remove(&mut self.free_heads[k], idx) {
            return false;
        }
        self.free_counts[k] -= 1;
        self.total_free -= order_pages(k);
        true
    }

    /// Largest order usable for a block at page index `idx` covering at most
    /// `limit` pages: capped by `floor(log2(limit))` and by the index's own
    /// alignment.
    fn greedy_order(idx: usize, limit: usize) -> usize {
        let mut k = ilog2_floor(limit).min(MAX_ORDER);
        while k > 0 && idx & (order_pages(k) - 1) != 0 {
            k -= 1;
        }
        k
    }
}

impl Default for BuddyPmm {
    fn default() -> Self {
        Self::new()
    }
}

impl PmmStrategy for BuddyPmm {
    fn name(&self) -> &'static str {
        "buddy"
    }

    fn init(&mut self) {
        self.free_heads = [NIL; ORDER_COUNT];
        self.free_counts = [0; ORDER_COUNT];
        self.total_free = 0;
    }

    fn init_memmap(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize) {
        debug_assert!(n >= 1);
        debug_assert!(base + n <= table.len());
        for i in 0..n {
            let frame = table.frame_mut(base + i);
            debug_assert!(frame.is_reserved());
            frame.reset();
        }

        // Greedy decomposition into maximal aligned power-of-two blocks.
        let mut cur = base;
        let mut left = n;
        while left > 0 {
            let k = Self::greedy_order(cur, left);
            let size = order_pages(k);
            table.frame_mut(cur).set_property_head(size as u32);
            self.area_push(table, k, cur);
            cur += size;
            left -= size;
        }
    }

    fn alloc_pages(&mut self, table: &mut FrameTable<'_>, n: usize) -> Option<usize> {
        debug_assert!(n >= 1);
        if n > self.total_free {
            return None;
        }
        self.alloc_calls += 1;

        let need_k = ilog2_ceil(n);
        if need_k > MAX_ORDER {
            return None;
        }
        let mut k = (need_k..=MAX_ORDER).find(|&k| self.free_heads[k] != NIL)?;
        let blk = self.area_pop(table, k)?;
        let mut blk_sz = order_pages(k);

        // Halve while the upper half still satisfies the request.
        while k > 0 {
            let half = blk_sz >> 1;
            if half < n {
                break;
            }
            let right = blk + half;
            table.frame_mut(right).set_property_head(half as u32);
            self.area_push(table, k - 1, right);
            k -= 1;
            blk_sz = half;
        }

        table.frame_mut(blk).clear_property_head();

        // The block may still exceed n; return the exact excess as maximal
        // aligned sub-blocks.
        let mut cur = blk + n;
        let mut remain = blk_sz - n;
        while remain > 0 {
            let k = Self::greedy_order(cur, remain);
            let size = order_pages(k);
            table.frame_mut(cur).set_property_head(size as u32);
            self.area_push(table, k, cur);
            cur += size;
            remain -= size;
        }
        Some(blk)
    }

    fn free_pages(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize) {
        debug_assert!(n >= 1);
        debug_assert!(base + n <= table.len());
        self.free_calls += 1;

        // A freed range need not be a power of two or aligned, so peel
        // maximal aligned chunks off the front and coalesce each on its own.
        let mut cur = base;
        let mut left = n;
        while left > 0 {
            let k = Self::greedy_order(cur, left);
            let part = order_pages(k);

            for i in 0..part {
                let frame = table.frame_mut(cur + i);
                debug_assert!(!frame.is_reserved());
                frame.reset();
            }

            let mut head = cur;
            let mut size = part;
            let mut ok = k;
            table.frame_mut(head).set_property_head(size as u32);
            while ok < MAX_ORDER {
                let bidx = head ^ size;
                if bidx >= table.len() {
                    break;
                }
                let buddy = table.frame(bidx);
                if !buddy.is_property_head() || buddy.property as usize != size {
                    break;
                }
                self.area_remove(table, ok, bidx);
                table.frame_mut(bidx).clear_property_head();
                table.frame_mut(head).clear_property_head();
                head = head.min(bidx);
                size <<= 1;
                ok += 1;
                table.frame_mut(head).set_property_head(size as u32);
                self.coalesce_events += 1;
            }
            self.area_push(table, ok, head);

            // Next chunk starts right after the part just processed;
            // recompute from base because coalescing may have moved `head`
            // below it.
            cur = base + (n - (left - part));
            left -= part;
        }
    }

    fn nr_free_pages(&self) -> usize {
        self.total_free
    }

    fn check(&mut self, table: &mut FrameTable<'_>) {
        let before = self.total_free;
        let a = self.alloc_pages(table, 1);
        let b = self.alloc_pages(table, 1);
        debug_assert!(a.is_some() && b.is_some() && a != b);
        if let Some(a) = a {
            self.free_pages(table, a, 1);
        }
        if let Some(b) = b {
            self.free_pages(table, b, 1);
        }
        debug_assert_eq!(self.total_free, before);
        debug_assert!(self.check_invariants(table));
        log::info!("buddy: self-check passed, {} pages free", self.total_free);
    }

    fn check_invariants(&self, table: &FrameTable<'_>) -> bool {
        let mut total = 0;
        for k in 0..ORDER_COUNT {
            let size = order_pages(k);
            let mut count = 0;
            let mut last = None;
            let mut bad = false;
            let complete = table.list_walk(self.free_heads[k], |idx, frame| {
                if !frame.is_property_head() || frame.property as usize != size {
                    log::error!("buddy: order {} block at {} has bad head mark", k, idx);
                    bad = true;
                }
                if idx & (size - 1) != 0 || idx + size > table.len() {
                    log::error!("buddy: order {} block at {} misaligned or out of range", k, idx);
                    bad = true;
                }
                if last.is_some_and(|prev| prev >= idx) {
                    log::error!("buddy: order {} list not address-sorted at {}", k, idx);
                    bad = true;
                }
                last = Some(idx);
                count += 1;
            });
            if !complete {
                log::error!("buddy: order {} list exceeds table length", k);
                return false;
            }
            if bad {
                return false;
            }
            if count != self.free_counts[k] {
                log::error!(
                    "buddy: order {} holds {} blocks, counter says {}",
                    k,
                    count,
                    self.free_counts[k]
                );
                return false;
            }
            total += count * size;
        }
        if total != self.total_free {
            log::error!(
                "buddy: lists sum to {} pages, counter says {}",
                total,
                self.total_free
            );
            return false;
        }
        true
    }

    fn dump_free(&self, table: &FrameTable<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "[buddy] {} pages free", self.total_free)?;
        for k in 0..ORDER_COUNT {
            if self.free_counts[k] == 0 {
                continue;
            }
            writeln!(
                out,
                "  order={:<2} blocks={:<4} pages={}",
                k,
                self.free_counts[k],
                self.free_counts[k] * order_pages(k)
            )?;
            let mut line = Ok(());
            table.list_walk(self.free_heads[k], |idx, frame| {
                if line.is_ok() {
                    line = writeln!(
                        out,
                        "    head={:<6} size={} addr={:p}",
                        idx,
                        frame.property,
                        table.page_addr(idx)
                    );
                }
            });
            line?;
        }
        Ok(())
    }
}
