//! Physical page allocation.
//!
//! Two interchangeable strategies implement one contract: the buddy system
//! ([`buddy::BuddyPmm`]) and an address-ordered best-fit list
//! ([`best_fit::BestFitPmm`]). A [`PhysAllocator`] binds the strategy chosen
//! at construction to a [`FrameTable`] and never mixes strategies afterwards.

pub mod best_fit;
pub mod buddy;

#[cfg(test)]
mod buddy_test;

use core::fmt;

use crate::frame::FrameTable;

pub use best_fit::BestFitPmm;
pub use buddy::BuddyPmm;

/// Contract implemented identically by every page-allocation strategy.
///
/// `alloc_pages` never returns a partial run: it yields the head page index
/// of exactly `n` contiguous pages or `None` on exhaustion. Callers own the
/// obligation that `n >= 1` and that freed ranges were previously allocated;
/// violations are contract bugs, not recoverable errors.
pub trait PmmStrategy {
    fn name(&self) -> &'static str;

    /// Resets all free-list state and the free-page counter.
    fn init(&mut self);

    /// Releases `n` reserved pages starting at `base` into the free
    /// structure.
    fn init_memmap(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize);

    /// Allocates a run of exactly `n` pages, returning its head page index.
    fn alloc_pages(&mut self, table: &mut FrameTable<'_>, n: usize) -> Option<usize>;

    /// Returns the run `[base, base + n)` to the free structure, merging
    /// where possible.
    fn free_pages(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize);

    /// Running total of free pages.
    fn nr_free_pages(&self) -> usize;

    /// Diagnostic self-test: allocate/free round trips plus a state dump.
    /// Not authoritative for correctness.
    fn check(&mut self, table: &mut FrameTable<'_>);

    /// Verifies the free structure's invariants; logs and returns false on
    /// the first violation.
    fn check_invariants(&self, table: &FrameTable<'_>) -> bool;

    /// Writes a human-readable dump of the free structure to `out`.
    fn dump_free(&self, table: &FrameTable<'_>, out: &mut dyn fmt::Write) -> fmt::Result;
}

/// Strategy selector, fixed at [`PhysAllocator::new`] time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Buddy,
    BestFit,
}

/// The closed set of strategy implementations.
pub enum PmmBackend {
    Buddy(BuddyPmm),
    BestFit(BestFitPmm),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            PmmBackend::Buddy($inner) => $body,
            PmmBackend::BestFit($inner) => $body,
        }
    };
}

impl PmmStrategy for PmmBackend {
    fn name(&self) -> &'static str {
        delegate!(self, s => s.name())
    }

    fn init(&mut self) {
        delegate!(self, s => s.init())
    }

    fn init_memmap(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize) {
        delegate!(self, s => s.init_memmap(table, base, n))
    }

    fn alloc_pages(&mut self, table: &mut FrameTable<'_>, n: usize) -> Option<usize> {
        delegate!(self, s => s.alloc_pages(table, n))
    }

    fn free_pages(&mut self, table: &mut FrameTable<'_>, base: usize, n: usize) {
        delegate!(self, s => s.free_pages(table, base, n))
    }

    fn nr_free_pages(&self) -> usize {
        delegate!(self, s => s.nr_free_pages())
    }

    fn check(&mut self, table: &mut FrameTable<'_>) {
        delegate!(self, s => s.check(table))
    }

    fn check_invariants(&self, table: &FrameTable<'_>) -> bool {
        delegate!(self, s => s.check_invariants(table))
    }

    fn dump_free(&self, table: &FrameTable<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        delegate!(self, s => s.dump_free(table, out))
    }
}

/// Physical page allocator: a frame table plus the strategy managing it.
pub struct PhysAllocator<'a> {
    table: FrameTable<'a>,
    backend: PmmBackend,
}

impl<'a> PhysAllocator<'a> {
    pub fn new(table: FrameTable<'a>, kind: StrategyKind) -> Self {
        let mut backend = match kind {
            StrategyKind::Buddy => PmmBackend::Buddy(BuddyPmm::new()),
            StrategyKind::BestFit => PmmBackend::BestFit(BestFitPmm::new()),
        };
        backend.init();
        log::info!("pmm: using {} over {} pages", backend.name(), table.len());
        Self { table, backend }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn init_memmap(&mut self, base: usize, n: usize) {
        self.backend.init_memmap(&mut self.table, base, n);
    }

    pub fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        self.backend.alloc_pages(&mut self.table, n)
    }

    pub fn free_pages(&mut self, base: usize, n: usize) {
        self.backend.free_pages(&mut self.table, base, n);
    }

    pub fn nr_free_pages(&self) -> usize {
        self.backend.nr_free_pages()
    }

    pub fn check(&mut self) {
        self.backend.check(&mut self.table);
    }

    pub fn check_invariants(&self) -> bool {
        self.backend.check_invariants(&self.table)
    }

    pub fn dump_free(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.backend.dump_free(&self.table, out)
    }

    pub fn table(&self) -> &FrameTable<'a> {
        &self.table
    }
}
