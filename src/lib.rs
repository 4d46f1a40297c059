//! Two-tier kernel memory allocator.
//!
//! The lower tier hands out physical page runs through one of two
//! interchangeable strategies selected at initialization time:
//! - **Buddy**: order-indexed free lists (orders 0..=14), power-of-two
//!   splitting on allocation and XOR-buddy coalescing on free.
//! - **Best-fit**: a single address-ordered list of variable-length runs,
//!   smallest sufficient run wins, adjacent runs merge on free.
//!
//! The upper tier is a slab allocator that carves single pages into
//! fixed-size object pools for nine size classes (8..2048 bytes) and routes
//! larger requests straight to the page tier as magic-tagged big blocks.
//!
//! All bookkeeping links between pages live in a side table of page
//! descriptors ([`frame::FrameTable`]); the only data written into page
//! memory itself are the slab/big-block headers and the intra-slab free-slot
//! indices. The core is single-threaded by contract; the optional [`global`]
//! front wraps one instance in a spinlock for kernel-wide use.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod frame;
pub mod global;
pub mod pmm;
pub mod slub;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::CorruptionKind;
pub use frame::{FrameTable, PageFlags, PageFrame, PAGE_SIZE};
pub use pmm::{PhysAllocator, PmmStrategy, StrategyKind};
pub use slub::SlubAllocator;
