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

//! Split Ring Primitives
//!
//! [`SplitRing`] is the driver half of a split virtqueue over shared memory:
//! it writes descriptor chains, publishes their heads on the available ring,
//! decides when the device needs a kick, and consumes the used ring.
//!
//! # Memory ordering
//!
//! - Descriptors and the avail ring slot are plain writes; the avail index is
//!   bumped with a release store, so the device never sees an index ahead of
//!   the slot and chain it covers.
//! - The used index is read with an acquire load before the used element it
//!   covers is read.
//! - Suppression fields are sampled after a full fence (see [`Suppression`]).
//!
//! # Trust
//!
//! The device is a separate party. Nothing it writes is used for bookkeeping:
//! chain links live in the private [`DescArena`], and every used entry is
//! checked against the set of outstanding heads before anything is freed.

use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;

use smallvec::SmallVec;
use thiserror::Error;

use super::{
    Allocation, DescArena, DescFlags, DescTable, Descriptor, Layout, MemOps, Suppression,
    UsedElem,
};

/// One guest-physical memory segment of a scatter-gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    /// Guest physical address
    pub addr: u64,
    /// Length in bytes
    pub len: u32,
}

impl Segment {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

impl From<(u64, u32)> for Segment {
    fn from((addr, len): (u64, u32)) -> Self {
        Self { addr, len }
    }
}

/// A buffer returned from the ring after being used by the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsedBuffer {
    /// Head descriptor index of the completed chain
    pub id: u16,
    /// Number of bytes the device reports having written to the writable segments.
    pub len: u32,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Buffer chain is empty")]
    EmptyChain,
    #[error("Buffer chain has too many segments")]
    ChainTooLong,
    #[error("Not enough free descriptors")]
    QueueFull,
    #[error("Device returned invalid used entry id {0}")]
    BadUsedEntry(u32),
    #[error("Device used index {0} ran ahead of published buffers")]
    BadUsedIndex(u16),
    #[error("{0} chains still outstanding")]
    Busy(usize),
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Backend memory error")]
    MemError,
}

/// Type-state: Can add readable buffers
pub struct Readable;

/// Type-state: Can add writable buffers (no more readables allowed)
pub struct Writable;

/// A builder for buffer chains using type-state to enforce readable/writable order.
///
/// At least one segment must be present, and every device-readable segment
/// precedes every device-writable one.
#[derive(Debug, Default)]
pub struct BufferChainBuilder<T> {
    elems: SmallVec<[Segment; 16]>,
    split: usize,
    marker: PhantomData<T>,
}

impl BufferChainBuilder<Readable> {
    pub fn new() -> Self {
        Self {
            elems: SmallVec::new(),
            split: 0,
            marker: PhantomData,
        }
    }

    /// Add a readable buffer (device reads from this).
    pub fn readable(mut self, addr: u64, len: u32) -> Self {
        self.elems.push(Segment::new(addr, len));
        self.split += 1;
        self
    }

    pub fn readables(mut self, segs: impl IntoIterator<Item = impl Into<Segment>>) -> Self {
        for seg in segs {
            self.elems.push(seg.into());
            self.split += 1;
        }
        self
    }

    /// Add a writable buffer (device writes to this).
    ///
    /// No readable buffer can be added afterwards.
    pub fn writable(self, addr: u64, len: u32) -> BufferChainBuilder<Writable> {
        self.into_writable().writable(addr, len)
    }

    pub fn writables(
        self,
        segs: impl IntoIterator<Item = impl Into<Segment>>,
    ) -> BufferChainBuilder<Writable> {
        self.into_writable().writables(segs)
    }

    fn into_writable(self) -> BufferChainBuilder<Writable> {
        BufferChainBuilder {
            elems: self.elems,
            split: self.split,
            marker: PhantomData,
        }
    }

    /// Build a chain with only readable buffers.
    pub fn build(self) -> Result<BufferChain, RingError> {
        BufferChain::from_parts(self.elems, self.split)
    }
}

impl BufferChainBuilder<Writable> {
    pub fn writable(mut self, addr: u64, len: u32) -> Self {
        self.elems.push(Segment::new(addr, len));
        self
    }

    pub fn writables(mut self, segs: impl IntoIterator<Item = impl Into<Segment>>) -> Self {
        self.elems.extend(segs.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<BufferChain, RingError> {
        BufferChain::from_parts(self.elems, self.split)
    }
}

/// A scatter-gather list ready for submission: device-readable segments
/// followed by device-writable ones.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferChain {
    elems: SmallVec<[Segment; 16]>,
    split: usize,
}

impl BufferChain {
    fn from_parts(elems: SmallVec<[Segment; 16]>, split: usize) -> Result<Self, RingError> {
        if elems.is_empty() {
            return Err(RingError::EmptyChain);
        }

        Ok(Self { elems, split })
    }

    /// Build a chain from separate output (device-readable) and input
    /// (device-writable) segment lists.
    pub fn from_segments(out: &[Segment], inp: &[Segment]) -> Result<Self, RingError> {
        let mut elems = SmallVec::with_capacity(out.len() + inp.len());
        elems.extend_from_slice(out);
        elems.extend_from_slice(inp);
        Self::from_parts(elems, out.len())
    }

    pub fn elems(&self) -> &[Segment] {
        &self.elems
    }

    pub fn readables(&self) -> &[Segment] {
        &self.elems[..self.split]
    }

    pub fn writables(&self) -> &[Segment] {
        &self.elems[self.split..]
    }

    /// Total bytes the device may write.
    pub fn writable_len(&self) -> u64 {
        self.writables().iter().map(|s| s.len as u64).sum()
    }

    // a chain is never empty
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    fn desc_flags(&self, i: usize) -> DescFlags {
        let mut flags = DescFlags::empty();
        if i >= self.split {
            flags |= DescFlags::WRITE;
        }
        if i + 1 < self.elems.len() {
            flags |= DescFlags::NEXT;
        }
        flags
    }
}

/// Driver side of a split virtqueue.
pub struct SplitRing<M> {
    mem: M,
    layout: Layout,
    table: DescTable,
    arena: DescArena,
    /// Direct descriptors held by the chain headed at each index, 0 if not a head
    chain_len: Vec<u16>,
    /// Number of chains handed to the device and not yet returned
    outstanding: usize,
    /// Shadow of the avail index
    avail_idx: u16,
    /// Entries published since the last kick decision
    num_added: u16,
    /// Next used index to consume
    last_used: u16,
    suppression: Suppression,
}

impl<M: MemOps> SplitRing<M> {
    /// Bind to the ring memory described by `layout`, zeroing it.
    pub fn new(layout: Layout, mem: M) -> Result<Self, RingError> {
        let size = layout.size as usize;
        let table = DescTable::from_raw_parts(layout.desc_table_addr, size)?;

        mem.zero(layout.desc_table_addr, layout.total_size())
            .map_err(|_| RingError::MemError)?;

        Ok(Self {
            mem,
            layout,
            table,
            arena: DescArena::new(size),
            chain_len: vec![0; size],
            outstanding: 0,
            avail_idx: 0,
            num_added: 0,
            last_used: 0,
            suppression: Suppression::new(layout),
        })
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.layout.size - 1
    }

    /// Write `chain` as a run of linked direct descriptors.
    ///
    /// Takes all descriptors up front, so on [`RingError::QueueFull`] nothing
    /// changes.
    pub fn add_direct(&mut self, chain: &BufferChain) -> Result<u16, RingError> {
        let n = chain.len();
        if n > self.arena.len() {
            return Err(RingError::QueueFull);
        }

        let head = self.arena.take(n)?;

        if let Err(e) = self.write_direct(head, chain) {
            self.arena.release(head, n);
            return Err(e);
        }

        self.chain_len[head as usize] = n as u16;
        self.outstanding += 1;
        Ok(head)
    }

    fn write_direct(&self, head: u16, chain: &BufferChain) -> Result<(), RingError> {
        let indices = self.arena.chain(head, chain.len());

        for (i, (idx, seg)) in indices.zip(chain.elems()).enumerate() {
            let flags = chain.desc_flags(i);
            let next = if flags.contains(DescFlags::NEXT) {
                self.arena.next(idx)
            } else {
                0
            };

            self.table
                .write(&self.mem, idx, Descriptor::new(seg.addr, seg.len, flags, next))?;
        }

        Ok(())
    }

    /// Write `chain` into the indirect table at `table` and point a single ring
    /// descriptor at it.
    ///
    /// `table` must hold at least `16 * chain.len()` bytes of device-visible
    /// memory; the caller owns it until the chain is reclaimed.
    pub fn add_indirect(
        &mut self,
        chain: &BufferChain,
        table: Allocation,
    ) -> Result<u16, RingError> {
        let n = chain.len();
        let bytes = n * Descriptor::SIZE;
        if n > u16::MAX as usize || bytes > u32::MAX as usize {
            return Err(RingError::ChainTooLong);
        }

        if table.len < bytes || !table.addr.is_multiple_of(Descriptor::ALIGN as u64) {
            return Err(RingError::InvalidLayout);
        }

        let head = self.arena.take(1)?;

        if let Err(e) = self.write_indirect(head, chain, table.addr) {
            self.arena.release(head, 1);
            return Err(e);
        }

        self.chain_len[head as usize] = 1;
        self.outstanding += 1;
        Ok(head)
    }

    fn write_indirect(&self, head: u16, chain: &BufferChain, addr: u64) -> Result<(), RingError> {
        let ind = DescTable::from_raw_parts(addr, chain.len())?;

        for (i, seg) in chain.elems().iter().enumerate() {
            let flags = chain.desc_flags(i);
            let next = if flags.contains(DescFlags::NEXT) {
                (i + 1) as u16
            } else {
                0
            };

            ind.write(&self.mem, i as u16, Descriptor::new(seg.addr, seg.len, flags, next))?;
        }

        let len = (chain.len() * Descriptor::SIZE) as u32;
        self.table.write(
            &self.mem,
            head,
            Descriptor::new(addr, len, DescFlags::INDIRECT, 0),
        )
    }

    /// Make the chain at `head` visible to the device.
    ///
    /// Returns true when 65535 entries were published without a kick decision;
    /// the caller must then kick so the device's view of `old` never falls a
    /// full index wrap behind.
    pub fn publish(&mut self, head: u16) -> Result<bool, RingError> {
        let slot = self.avail_idx & self.mask();
        self.mem
            .write_val(self.layout.avail_slot_addr(slot), head)
            .map_err(|_| RingError::MemError)?;

        let next = self.avail_idx.wrapping_add(1);
        self.mem
            .store_release(self.layout.avail_idx_addr(), next)
            .map_err(|_| RingError::MemError)?;

        self.avail_idx = next;
        self.num_added = self.num_added.wrapping_add(1);

        Ok(self.num_added == u16::MAX)
    }

    /// Decide whether the device must be notified about entries published
    /// since the previous call.
    pub fn kick_prepare(&mut self) -> Result<bool, RingError> {
        let new = self.avail_idx;
        let old = new.wrapping_sub(self.num_added);
        self.num_added = 0;

        self.suppression.should_kick(&self.mem, old, new)
    }

    fn used_idx(&self) -> Result<u16, RingError> {
        self.mem
            .load_acquire(self.layout.used_idx_addr())
            .map_err(|_| RingError::MemError)
    }

    /// True if the device has used entries not yet consumed.
    pub fn more_used(&self) -> Result<bool, RingError> {
        Ok(self.used_idx()? != self.last_used)
    }

    /// Consume one used entry, free its descriptors and return it.
    ///
    /// Returns `Ok(None)` if the device has not used anything new. An entry
    /// naming anything but an outstanding head, or a used index further ahead
    /// than the number of outstanding chains, is a device error and leaves the
    /// ring untouched.
    pub fn poll_used(&mut self) -> Result<Option<UsedBuffer>, RingError> {
        let used_idx = self.used_idx()?;
        let ready = used_idx.wrapping_sub(self.last_used);
        if ready == 0 {
            return Ok(None);
        }

        if ready as usize > self.outstanding {
            return Err(RingError::BadUsedIndex(used_idx));
        }

        let slot = self.last_used & self.mask();
        let elem: UsedElem = self
            .mem
            .read_val(self.layout.used_elem_addr(slot))
            .map_err(|_| RingError::MemError)?;

        let id = u16::try_from(elem.id)
            .ok()
            .filter(|&id| self.is_head(id))
            .ok_or(RingError::BadUsedEntry(elem.id))?;

        self.free_chain(id)?;
        self.last_used = self.last_used.wrapping_add(1);
        self.suppression.after_reclaim(&self.mem, self.last_used)?;

        Ok(Some(UsedBuffer { id, len: elem.len }))
    }

    /// Is `id` the head of an outstanding chain?
    #[inline]
    pub fn is_head(&self, id: u16) -> bool {
        self.chain_len.get(id as usize).is_some_and(|&n| n > 0)
    }

    /// Return the descriptors of the outstanding chain at `head` to the free
    /// list. Returns the number of direct descriptors released.
    pub fn free_chain(&mut self, head: u16) -> Result<usize, RingError> {
        if !self.is_head(head) {
            return Err(RingError::BadUsedEntry(head as u32));
        }

        let n = core::mem::take(&mut self.chain_len[head as usize]) as usize;
        self.arena.release(head, n);
        self.outstanding -= 1;
        Ok(n)
    }

    /// Free the first outstanding chain without consulting the used ring.
    ///
    /// Only meaningful once the device has stopped touching the ring.
    pub fn detach_unused(&mut self) -> Option<u16> {
        let head = self.chain_len.iter().position(|&n| n > 0)? as u16;
        self.free_chain(head).ok()?;
        Some(head)
    }

    /// Ask the device to interrupt on the next used entry. Returns true if
    /// entries are already waiting, in which case the caller must drain again.
    pub fn enable_interrupts(&mut self) -> Result<bool, RingError> {
        self.suppression.enable(&self.mem, self.last_used)?;
        self.more_used()
    }

    /// Ask the device to hold interrupts. Returns true if entries are waiting.
    pub fn disable_interrupts(&mut self) -> Result<bool, RingError> {
        self.suppression.disable(&self.mem)?;
        self.more_used()
    }

    /// Re-enable interrupts, but only ask for one once three quarters of the
    /// currently outstanding entries have been used.
    ///
    /// Returns true if more than that many are already used.
    pub fn enable_interrupts_delayed(&mut self) -> Result<bool, RingError> {
        let pending = self.avail_idx.wrapping_sub(self.last_used) as u32;
        let bufs = (pending * 3 / 4) as u16;

        self.suppression
            .enable(&self.mem, self.last_used.wrapping_add(bufs))?;

        Ok(self.used_idx()?.wrapping_sub(self.last_used) > bufs)
    }

    #[inline]
    pub fn is_interrupt_enabled(&self) -> bool {
        self.suppression.interrupts_enabled()
    }

    /// Return an idle ring to its freshly created state.
    pub fn reset(&mut self) -> Result<(), RingError> {
        if self.outstanding != 0 {
            return Err(RingError::Busy(self.outstanding));
        }

        self.mem
            .zero(self.layout.desc_table_addr, self.layout.total_size())
            .map_err(|_| RingError::MemError)?;

        self.arena = DescArena::new(self.layout.size as usize);
        self.chain_len.fill(0);
        self.avail_idx = 0;
        self.num_added = 0;
        self.last_used = 0;
        self.suppression.reset();
        Ok(())
    }

    /// Number of free descriptors in the ring.
    #[inline]
    pub fn num_free(&self) -> usize {
        self.arena.num_free()
    }

    /// Number of chains the device owns.
    #[inline]
    pub fn num_inflight(&self) -> usize {
        self.outstanding
    }

    /// Number of descriptors in the ring.
    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[inline]
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    #[inline]
    pub fn last_used(&self) -> u16 {
        self.last_used
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }
}


#[cfg(test)]
mod fuzz {
    use std::collections::VecDeque;

    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::tests::{make_ring, make_split};
    use super::*;
    use crate::Features;

    const MAX_OPS: usize = 64;

    #[derive(Clone, Debug)]
    enum Op {
        Add { out: u8, inp: u8 },
        Complete(usize),
        Reclaim,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 3 {
                0 => Op::Add {
                    out: u8::arbitrary(g) % 4,
                    inp: u8::arbitrary(g) % 4,
                },
                1 => Op::Complete(usize::arbitrary(g)),
                _ => Op::Reclaim,
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        size_log2: u8,
        event_idx: bool,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
            Scenario {
                size_log2: u8::arbitrary(g) % 5,
                event_idx: bool::arbitrary(g),
                ops: (0..num_ops).map(|_| Op::arbitrary(g)).collect(),
            }
        }
    }

    /// Every published head comes back exactly once, in the order the
    /// device completed it, and descriptor accounting always balances.
    fn run_scenario(s: Scenario) -> bool {
        let size = 1u16 << s.size_log2;
        let features = if s.event_idx {
            Features::EVENT_IDX
        } else {
            Features::empty()
        };
        let ring = make_ring(size, features);
        let mut split = make_split(&ring);

        // heads the device has been given but not completed, and a length per head
        let mut device: Vec<(u16, usize)> = Vec::new();
        let mut completed: VecDeque<u16> = VecDeque::new();

        for op in &s.ops {
            match *op {
                Op::Add { out, inp } => {
                    let n = (out + inp) as usize;
                    let c = match BufferChain::from_segments(
                        &vec![Segment::new(0x1000, 8); out as usize],
                        &vec![Segment::new(0x2000, 8); inp as usize],
                    ) {
                        Ok(c) => c,
                        Err(RingError::EmptyChain) => continue,
                        Err(_) => return false,
                    };

                    match split.add_direct(&c) {
                        Ok(head) => {
                            if split.publish(head).is_err() {
                                return false;
                            }
                            device.push((head, n));
                        }
                        Err(RingError::QueueFull) => {
                            if n <= split.num_free() {
                                return false;
                            }
                        }
                        Err(_) => return false,
                    }
                }
                Op::Complete(pick) => {
                    if device.is_empty() {
                        continue;
                    }
                    let (head, n) = device.remove(pick % device.len());
                    ring.push_used(head as u32, n as u32);
                    completed.push_back(head);
                }
                Op::Reclaim => loop {
                    match split.poll_used() {
                        Ok(Some(used)) => {
                            if completed.pop_front() != Some(used.id) {
                                return false;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => return false,
                    }
                },
            }

            // only reclaimed chains have their descriptors back
            let held: usize = device.iter().map(|(_, n)| n).sum::<usize>()
                + completed
                    .iter()
                    .map(|h| split.chain_len[*h as usize] as usize)
                    .sum::<usize>();
            if held + split.num_free() != size as usize {
                return false;
            }
        }

        completed.is_empty() || split.more_used().unwrap_or(false)
    }

    #[test]
    fn prop_ring_invariants() {
        #[cfg(miri)]
        let tests = 10;
        #[cfg(not(miri))]
        let tests = 500;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}
