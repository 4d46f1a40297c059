//! Corruption taxonomy for the allocator's defensive checks.
//!
//! Exhaustion is not an error here: allocation paths report it as a plain
//! `None`. These variants name the detected-corruption cases, which are
//! either self-healed (logged) or fatal (carried in the panic message).

use core::fmt;

/// What kind of metadata damage a check detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    /// A big-block integrity header failed its magic pair.
    BigHeader,
    /// A freed pointer matched neither the slab nor the big-block signature.
    Classify,
    /// A slab sibling list or intra-slab free list loops.
    ListCycle,
    /// `inuse`/`total` accounting is inconsistent for a slab.
    CountMismatch,
    /// An intra-slab free-list index is out of range.
    FreeIndex,
    /// A list walk exceeded its hard iteration ceiling.
    ListOverrun,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CorruptionKind::BigHeader => "big-block header magic mismatch",
            CorruptionKind::Classify => "pointer matches no allocation signature",
            CorruptionKind::ListCycle => "cycle in slab list",
            CorruptionKind::CountMismatch => "slab inuse/total mismatch",
            CorruptionKind::FreeIndex => "free-slot index out of range",
            CorruptionKind::ListOverrun => "slab list exceeds iteration ceiling",
        };
        f.write_str(msg)
    }
}
