//! Best-fit page allocator.
//!
//! One address-ordered free list of variable-length runs. Allocation scans
//! the whole list for the smallest run that satisfies the request (first
//! found wins ties) and splits it in place; freeing reinserts the run in
//! address order and merges with its immediate neighbours when they are
//! strictly adjacent. No power-of-two rounding, but allocation is O(list
//! length).

use core::fmt;

use crate::frame::{FrameTable, NIL};

use super::PmmStrategy;

pub struct BestFitPmm {
    head: u32,
    nr_free: usize,
    alloc_calls: usize,
    free_calls: usize,
}

impl BestFitPmm {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            nr_free: 0,
            alloc_calls: 0,
            free_calls: 0,
        }
    }
}

impl Default for BestFitPmm {
    fn default() -> Self {
        Self::new()
    }
}

impl PmmStrategy for BestFitPmm {
    fn name(&self) -> &'static str {
        "best-fit"
    }

    fn init(&mut self) {
        self.head = NIL;
        self.nr_free = 0;
    }

    fn init_memmap(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize) {
        debug_assert!(n >= 1);
        debug_assert!(base + n <= table.len());
        for i in 0..n {
            let frame = table.frame_mut(base + i);
            debug_assert!(frame.is_reserved());
            frame.reset();
        }
        table.frame_mut(base).set_property_head(n as u32);
        self.nr_free += n;
        table.list_insert_sorted(&mut self.head, base);
    }

    fn alloc_pages(&mut self, table: &mut FrameTable<'_>, n: usize) -> Option<usize> {
        debug_assert!(n >= 1);
        if n > self.nr_free {
            return None;
        }
        self.alloc_calls += 1;

        // Full scan for the smallest run >= n; first found keeps ties.
        let mut best: Option<(usize, u32)> = None; // (run head, its predecessor)
        let mut best_size = usize::MAX;
        let mut prev = NIL;
        let mut cur = self.head;
        let mut guard = table.len() + 1;
        while cur != NIL {
            guard -= 1;
            if guard == 0 {
                log::error!("best-fit: free-list walk exceeded table length");
                return None;
            }
            let idx = cur as usize;
            let size = table.frame(idx).property as usize;
            if size >= n && size < best_size {
                best = Some((idx, prev));
                best_size = size;
            }
            prev = cur;
            cur = table.frame(idx).link;
        }
        let (run, run_prev) = best?;

        // Unlink the chosen run.
        let next = table.frame(run).link;
        if run_prev == NIL {
            self.head = next;
        } else {
            table.frame_mut(run_prev as usize).link = next;
        }
        table.frame_mut(run).link = NIL;

        // Split: the remainder stays where the run was.
        if best_size > n {
            let rest = run + n;
            table.frame_mut(rest).set_property_head((best_size - n) as u32);
            table.frame_mut(rest).link = next;
            if run_prev == NIL {
                self.head = rest as u32;
            } else {
                table.frame_mut(run_prev as usize).link = rest as u32;
            }
        }

        self.nr_free -= n;
        table.frame_mut(run).clear_property_head();
        Some(run)
    }

    fn free_pages(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize) {
        debug_assert!(n >= 1);
        debug_assert!(base + n <= table.len());
        self.free_calls += 1;

        for i in 0..n {
            let frame = table.frame_mut(base + i);
            debug_assert!(!frame.is_reserved() && !frame.is_property_head());
            frame.reset();
        }
        table.frame_mut(base).set_property_head(n as u32);
        self.nr_free += n;
        let prev = table.list_insert_sorted(&mut self.head, base);

        // Merge with the immediate predecessor if strictly adjacent.
        let mut run = base;
        if prev != NIL {
            let pidx = prev as usize;
            if pidx + table.frame(pidx).property as usize == run {
                let absorbed = table.frame(run).property;
                let next = table.frame(run).link;
                table.frame_mut(run).clear_property_head();
                table.frame_mut(run).link = NIL;
                table.frame_mut(pidx).link = next;
                table.frame_mut(pidx).property += absorbed;
                run = pidx;
            }
        }

        // Then with the immediate successor.
        let next = table.frame(run).link;
        if next != NIL {
            let nidx = next as usize;
            if run + table.frame(run).property as usize == nidx {
                let absorbed = table.frame(nidx).property;
                let next = table.frame(nidx).link;
                table.frame_mut(nidx).clear_property_head();
                table.frame_mut(nidx).link = NIL;
                table.frame_mut(run).link = next;
                table.frame_mut(run).property += absorbed;
            }
        }
    }

    fn nr_free_pages(&self) -> usize {
        self.nr_free
    }

    fn check(&mut self, table: &mut FrameTable<'_>) {
        let before = self.nr_free;
        let a = self.alloc_pages(table, 1);
        let b = self.alloc_pages(table, 1);
        debug_assert!(a.is_some() && b.is_some() && a != b);
        if let Some(a) = a {
            self.free_pages(table, a, 1);
        }
        if let Some(b) = b {
            self.free_pages(table, b, 1);
        }
        debug_assert_eq!(self.nr_free, before);
        debug_assert!(self.check_invariants(table));
        log::info!("best-fit: self-check passed, {} pages free", self.nr_free);
    }

    fn check_invariants(&self, table: &FrameTable<'_>) -> bool {
        let mut total = 0;
        let mut last_end = 0;
        let mut bad = false;
        let complete = table.list_walk(self.head, |idx, frame| {
            if !frame.is_property_head() || frame.property == 0 {
                log::error!("best-fit: run at {} has bad head mark", idx);
                bad = true;
            }
            if idx < last_end {
                log::error!("best-fit: run at {} overlaps or breaks address order", idx);
                bad = true;
            }
            last_end = idx + frame.property as usize;
            if last_end > table.len() {
                log::error!("best-fit: run at {} exceeds the table", idx);
                bad = true;
            }
            total += frame.property as usize;
        });
        if !complete {
            log::error!("best-fit: free list exceeds table length");
            return false;
        }
        if bad {
            return false;
        }
        if total != self.nr_free {
            log::error!(
                "best-fit: runs sum to {} pages, counter says {}",
                total,
                self.nr_free
            );
            return false;
        }
        true
    }

    fn dump_free(&self, table: &FrameTable<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "[best-fit] {} pages free", self.nr_free)?;
        let mut line = Ok(());
        table.list_walk(self.head, |idx, frame| {
            if line.is_ok() {
                line = writeln!(
                    out,
                    "  run head={:<6} pages={:<6} addr={:p}",
                    idx,
                    frame.property,
                    table.page_addr(idx)
                );
            }
        });
        line
    }
}
