//! Opaque 64-bit object handles shared by every rank in the offload core.
//!
//! A [`Handle`] is never a pointer: ranks that receive one must go through
//! their local registry to resolve it (see `dp-registry`). Bit layout, low to
//! high: a 32-bit per-rank allocation counter, a 16-bit owning-rank tag, and
//! 16 reserved bits kept zero for now.

use std::fmt;

/// Reserved value that must never be assigned to a live object.
pub const NULL_HANDLE: Handle = Handle(0);

/// Opaque identifier for a managed object, stable across ranks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    const COUNTER_BITS: u32 = 32;
    const RANK_BITS: u32 = 16;

    /// Build a handle from an owning rank and a per-rank allocation counter.
    ///
    /// Panics if `counter` does not fit in 32 bits; callers are expected to
    /// allocate from a monotonic per-rank counter so this should never trip.
    pub fn new(owning_rank: u16, counter: u32) -> Self {
        let raw = (counter as u64) | ((owning_rank as u64) << Self::COUNTER_BITS);
        Handle(raw)
    }

    /// Reinterpret a raw wire value (as decoded off the command stream) as a handle.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// The wire representation of this handle (`u64`, little-endian on the wire).
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// The rank that allocated this handle.
    pub fn owning_rank(self) -> u16 {
        ((self.0 >> Self::COUNTER_BITS) & ((1 << Self::RANK_BITS) - 1)) as u16
    }

    /// The per-rank allocation counter this handle was minted with.
    pub fn counter(self) -> u32 {
        (self.0 & ((1u64 << Self::COUNTER_BITS) - 1)) as u32
    }

    pub const fn is_null(self) -> bool {
        self.0 == NULL_HANDLE.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        NULL_HANDLE
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(NULL)")
        } else {
            write!(
                f,
                "Handle(rank={}, counter={})",
                self.owning_rank(),
                self.counter()
            )
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Per-rank monotonic handle allocator. Only ever used on the host: workers
/// materialize handles they are told about, never mint their own.
///
/// Invariant: a handle minted by one `HandleAllocator` is never reused for
/// the lifetime of the process, matching the registry's "no handle collides
/// with a prior allocation" contract.
#[derive(Debug)]
pub struct HandleAllocator {
    owning_rank: u16,
    next: u32,
}

impl HandleAllocator {
    pub fn new(owning_rank: u16) -> Self {
        Self {
            owning_rank,
            next: 1, // 0 is reserved so NULL_HANDLE can never be allocated
        }
    }

    /// Mint a fresh handle. Panics on exhaustion of the 32-bit counter space,
    /// which would require over four billion live allocations on one rank.
    pub fn allocate(&mut self) -> Handle {
        let counter = self.next;
        self.next = self
            .next
            .checked_add(1)
            .expect("handle counter space exhausted");
        Handle::new(self.owning_rank, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_zero_and_never_allocated() {
        assert_eq!(NULL_HANDLE.to_raw(), 0);
        let mut alloc = HandleAllocator::new(0);
        for _ in 0..1000 {
            assert!(!alloc.allocate().is_null());
        }
    }

    #[test]
    fn round_trips_rank_and_counter() {
        let h = Handle::new(7, 42);
        assert_eq!(h.owning_rank(), 7);
        assert_eq!(h.counter(), 42);
        assert_eq!(Handle::from_raw(h.to_raw()), h);
    }

    #[test]
    fn allocations_are_unique_and_monotonic() {
        let mut alloc = HandleAllocator::new(3);
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
        assert_eq!(a.owning_rank(), 3);
        assert_eq!(b.owning_rank(), 3);
        assert!(b.counter() > a.counter());
    }

    #[test]
    fn distinct_ranks_cannot_collide() {
        let mut a0 = HandleAllocator::new(0);
        let mut a1 = HandleAllocator::new(1);
        for _ in 0..256 {
            assert_ne!(a0.allocate(), a1.allocate());
        }
    }
}
