/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
//! Indirect descriptor table allocation.
//!
//! An indirect chain occupies a single ring descriptor that points at a
//! separately allocated, contiguous table of [`Descriptor`]s. The tables must
//! live in memory the device can read, so they are carved out of a
//! caller-supplied region by a [`BufferProvider`].
//!
//! [`IndirectPool`] is the provider shipped with the crate: a [`Slab`] with
//! power-of-two slot size `N`, tracked in a flat bitmap (`FixedBitSet`).
//! Allocation is a linear scan for a run of free bits, done with
//! `fixedbitset`'s word-at-a-time zero iteration. The most recently freed run
//! is cached and handed out first, so a steady submit/reclaim cycle keeps
//! reusing the same few tables.
//!
//! [`NoIndirect`] stands in when `INDIRECT_DESC` was not negotiated; it never
//! has memory to give.

use atomic_refcell::AtomicRefCell;
use fixedbitset::FixedBitSet;
use thiserror::Error;

use super::Descriptor;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Invalid region addr {0:#x}")]
    InvalidAlign(u64),
    #[error("Invalid free addr {0:#x} and size {1}")]
    InvalidFree(u64, usize),
    #[error("Invalid argument")]
    InvalidArg,
    #[error("Empty region")]
    EmptyRegion,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Overflow")]
    Overflow,
}

/// A table's worth of device-visible memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Guest physical address of the first byte
    pub addr: u64,
    /// Bytes reserved, a whole number of slots
    pub len: usize,
}

/// Source of device-visible memory for indirect descriptor tables.
pub trait BufferProvider {
    /// Allocate at least `len` bytes, aligned for [`Descriptor`].
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError>;

    /// Return a table once its chain has been reclaimed.
    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError>;
}

/// Hands an [`Allocation`] back through `cleanup` on drop, unless the chain
/// that uses it was queued and [`dismiss`](Self::dismiss) was called.
pub struct AllocGuard<F: FnOnce(Allocation)> {
    alloc: Allocation,
    cleanup: Option<F>,
}

impl<F: FnOnce(Allocation)> AllocGuard<F> {
    pub fn new(alloc: Allocation, cleanup: F) -> Self {
        Self {
            alloc,
            cleanup: Some(cleanup),
        }
    }

    /// Keep the allocation; the cleanup will not run.
    pub fn dismiss(mut self) -> Allocation {
        self.cleanup = None;
        self.alloc
    }
}

impl<F: FnOnce(Allocation)> core::ops::Deref for AllocGuard<F> {
    type Target = Allocation;

    fn deref(&self) -> &Allocation {
        &self.alloc
    }
}

impl<F: FnOnce(Allocation)> Drop for AllocGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(self.alloc)
        }
    }
}

/// Bitmap allocator handing out runs of `N`-byte slots from one region.
#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    base: u64,
    /// one bit per slot, set while the slot belongs to a live table
    in_use: FixedBitSet,
    /// most recently freed run, tried before scanning
    recycled: Option<Allocation>,
}

impl<const N: usize> Slab<N> {
    /// Manage `[base, base + region_len)`. A tail shorter than `N` is unused.
    pub fn new(base: u64, region_len: usize) -> Result<Self, AllocError> {
        const { assert!(N.is_power_of_two() && N >= Descriptor::SIZE) };

        if !base.is_multiple_of(N as u64) {
            return Err(AllocError::InvalidAlign(base));
        }

        let slots = region_len / N;
        if slots == 0 {
            return Err(AllocError::EmptyRegion);
        }
        if base.checked_add((slots * N) as u64).is_none() {
            return Err(AllocError::Overflow);
        }

        Ok(Self {
            base,
            in_use: FixedBitSet::with_capacity(slots),
            recycled: None,
        })
    }

    #[inline]
    fn slot_addr(&self, slot: usize) -> Option<u64> {
        let off = (slot as u64).checked_mul(N as u64)?;
        self.base.checked_add(off)
    }

    fn overlaps_recycled(&self, alloc: &Allocation) -> bool {
        self.recycled.is_some_and(|run| {
            alloc.addr < run.addr + run.len as u64 && run.addr < alloc.addr + alloc.len as u64
        })
    }

    /// Index of the first slot of a free run of `count` slots.
    pub fn find_slots(&mut self, count: usize) -> Option<usize> {
        debug_assert!(count > 0);

        if let Some(run) = self.recycled.take() {
            if run.len >= count * N {
                return Some(((run.addr - self.base) as usize) / N);
            }
            self.recycled = Some(run);
        }

        let total = self.in_use.len();
        self.in_use.zeroes().find(|&first| {
            first + count <= total && self.in_use.count_zeroes(first..first + count) == count
        })
    }

    /// Reserve enough whole slots for `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidArg);
        }

        let count = len.div_ceil(N);
        if count > self.in_use.len() {
            return Err(AllocError::OutOfMemory);
        }

        let first = self.find_slots(count).ok_or(AllocError::OutOfMemory)?;
        let addr = self.slot_addr(first).ok_or(AllocError::Overflow)?;
        self.in_use.insert_range(first..first + count);

        let alloc = Allocation {
            addr,
            len: count * N,
        };
        if self.overlaps_recycled(&alloc) {
            self.recycled = None;
        }
        Ok(alloc)
    }

    /// Give back a run returned by [`alloc`](Self::alloc). Anything else,
    /// including a second free of the same run, is rejected.
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        let bad = AllocError::InvalidFree(alloc.addr, alloc.len);
        if alloc.len == 0 || !alloc.len.is_multiple_of(N) || alloc.addr < self.base {
            return Err(bad);
        }

        let off = (alloc.addr - self.base) as usize;
        if !off.is_multiple_of(N) {
            return Err(bad);
        }

        let slots = off / N..off / N + alloc.len / N;
        if slots.end > self.in_use.len() || !self.in_use.contains_all_in_range(slots.clone()) {
            return Err(bad);
        }

        self.in_use.remove_range(slots);
        self.recycled = Some(alloc);
        Ok(())
    }

    pub fn free_bytes(&self) -> usize {
        self.in_use.count_zeroes(..) * N
    }

    pub fn capacity(&self) -> usize {
        self.in_use.len() * N
    }

    /// Addresses this slab hands out.
    pub fn range(&self) -> core::ops::Range<u64> {
        self.base..self.base + self.capacity() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range().contains(&addr)
    }

    pub const fn slot_size() -> usize {
        N
    }
}

/// Indirect descriptor table pool over a fixed, device-visible region.
///
/// `N` is the slot size in bytes; a table of `k` descriptors takes
/// `ceil(16 * k / N)` contiguous slots. The default fits 8 descriptors per slot.
#[derive(Debug)]
pub struct IndirectPool<const N: usize = 128> {
    inner: AtomicRefCell<Slab<N>>,
}

impl<const N: usize> IndirectPool<N> {
    /// Create a pool over `[base_addr, base_addr + region_len)`.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        let slab = Slab::<N>::new(base_addr, region_len)?;
        Ok(Self { inner: slab.into() })
    }

    /// Bytes needed to hold a table of `entries` descriptors.
    pub const fn table_bytes(entries: usize) -> usize {
        entries * Descriptor::SIZE
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity()
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.borrow().free_bytes()
    }

    pub fn range(&self) -> core::ops::Range<u64> {
        self.inner.borrow().range()
    }
}

impl<const N: usize> BufferProvider for IndirectPool<N> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        self.inner.borrow_mut().alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        self.inner.borrow_mut().dealloc(alloc)
    }
}

/// Provider for queues without `INDIRECT_DESC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndirect;

impl BufferProvider for NoIndirect {
    fn alloc(&self, _len: usize) -> Result<Allocation, AllocError> {
        Err(AllocError::OutOfMemory)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        Err(AllocError::InvalidFree(alloc.addr, alloc.len))
    }
}

impl<P: BufferProvider + ?Sized> BufferProvider for alloc::sync::Arc<P> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        (**self).alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        (**self).dealloc(alloc)
    }
}
