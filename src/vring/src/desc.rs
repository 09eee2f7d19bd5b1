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

//! Split Virtqueue Descriptor Types
//!
//! This module defines the descriptor format for split virtqueues and the
//! free-list arena that hands descriptor indices out to chains. Each descriptor
//! represents one memory segment of a scatter-gather list that the device will
//! read from or write to.
//!
//! # Free list
//!
//! Unused descriptors are linked through their `next` field, the same field a
//! chain uses to link its segments. Allocating `n` descriptors takes the first
//! `n` entries of the free list as-is, so the chain is already linked in the
//! right order; freeing a chain splices it back in front of the list. The
//! links live in a private shadow ([`DescArena`]) so that nothing the device
//! can write to is ever trusted for bookkeeping.

use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::{MemOps, RingError};

bitflags! {
    /// Descriptor flags as defined by VIRTIO specification.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// This marks a buffer as continuing via the next field.
        const NEXT     = 1 << 0;
        /// This marks a buffer as device write-only (otherwise device read-only).
        const WRITE    = 1 << 1;
        /// This means the buffer contains a table of buffer descriptors.
        const INDIRECT = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE, INDIRECT).
    pub flags: u16,
    /// Index of the next descriptor in the chain when NEXT is set.
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);
const _: () = assert!(Descriptor::ADDR_OFFSET == 0);
const _: () = assert!(Descriptor::LEN_OFFSET == 8);
const _: () = assert!(Descriptor::FLAGS_OFFSET == 12);
const _: () = assert!(Descriptor::NEXT_OFFSET == 14);
const _: () = assert!(Descriptor::ALIGN >= core::mem::align_of::<Descriptor>());

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Required alignment of a descriptor table in guest memory.
    pub const ALIGN: usize = 16;

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);
    pub const NEXT_OFFSET: usize = core::mem::offset_of!(Self, next);

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    /// Get flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Is this descriptor writeable by the device?
    #[inline]
    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    /// Does this descriptor point to a next descriptor in the chain?
    #[inline]
    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    /// Does this descriptor point to an indirect table?
    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }
}

/// A table of descriptors stored in shared memory.
#[derive(Debug, Clone, Copy)]
pub struct DescTable {
    base_addr: u64,
    size: usize,
}

impl DescTable {
    /// Create a descriptor table view over shared memory.
    ///
    /// Returns [`RingError::InvalidLayout`] if `base_addr` is not aligned for
    /// [`Descriptor`] or `size` does not fit a `u16` index.
    pub fn from_raw_parts(base_addr: u64, size: usize) -> Result<Self, RingError> {
        if !base_addr.is_multiple_of(Descriptor::ALIGN as u64) || size > u16::MAX as usize + 1 {
            return Err(RingError::InvalidLayout);
        }

        Ok(Self { base_addr, size })
    }

    /// Address of the descriptor at `idx`, or None if out of bounds.
    pub fn desc_addr(&self, idx: u16) -> Option<u64> {
        if idx as usize >= self.size {
            return None;
        }

        Some(self.base_addr + (idx as u64 * Descriptor::SIZE as u64))
    }

    /// Write the descriptor at `idx`.
    pub fn write<M: MemOps>(&self, mem: &M, idx: u16, desc: Descriptor) -> Result<(), RingError> {
        let addr = self.desc_addr(idx).ok_or(RingError::InvalidLayout)?;
        mem.write_val(addr, desc).map_err(|_| RingError::MemError)
    }

    /// Read the descriptor at `idx`.
    pub fn read<M: MemOps>(&self, mem: &M, idx: u16) -> Result<Descriptor, RingError> {
        let addr = self.desc_addr(idx).ok_or(RingError::InvalidLayout)?;
        mem.read_val(addr).map_err(|_| RingError::MemError)
    }

    /// Get number of descriptors in table
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Index-based free list over the descriptor table.
///
/// Invariant: the first `num_free` entries reachable from `free_head` are
/// exactly the descriptors not owned by any chain, each appearing once.
#[derive(Debug, Clone)]
pub struct DescArena {
    next: Vec<u16>,
    free_head: u16,
    num_free: usize,
}

impl DescArena {
    pub fn new(size: usize) -> Self {
        let next = (0..size).map(|i| ((i + 1) % size) as u16).collect();

        Self {
            next,
            free_head: 0,
            num_free: size,
        }
    }

    /// Take `n` descriptors off the free list, returning the head of the
    /// already-linked run. Nothing is taken when fewer than `n` are free.
    pub fn take(&mut self, n: usize) -> Result<u16, RingError> {
        if n == 0 {
            return Err(RingError::EmptyChain);
        }

        if n > self.num_free {
            return Err(RingError::QueueFull);
        }

        let head = self.free_head;
        let mut tail = head;
        for _ in 1..n {
            tail = self.next[tail as usize];
        }

        self.free_head = self.next[tail as usize];
        self.num_free -= n;
        Ok(head)
    }

    /// Return an `n` descriptor chain starting at `head` to the free list.
    pub fn release(&mut self, head: u16, n: usize) {
        debug_assert!(n > 0 && self.num_free + n <= self.next.len());

        let mut tail = head;
        for _ in 1..n {
            tail = self.next[tail as usize];
        }

        self.next[tail as usize] = self.free_head;
        self.free_head = head;
        self.num_free += n;
    }

    /// Link following `idx`, either the next chain member or the next free entry.
    #[inline]
    pub fn next(&self, idx: u16) -> u16 {
        self.next[idx as usize]
    }

    /// Iterate the `n` indices of the run starting at `head`.
    pub fn chain(&self, head: u16, n: usize) -> impl Iterator<Item = u16> + '_ {
        let mut cur = head;
        (0..n).map(move |i| {
            if i > 0 {
                cur = self.next[cur as usize];
            }
            cur
        })
    }

    /// Iterate the free list, in allocation order.
    pub fn free_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.chain(self.free_head, self.num_free)
    }

    pub fn num_free(&self) -> usize {
        self.num_free
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}
