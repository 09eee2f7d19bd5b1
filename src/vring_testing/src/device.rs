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

use anyhow::{Result, bail, ensure};
use log::trace;
use vring::{AvailFlags, Descriptor, Layout, MemOps, Segment, UsedElem, UsedFlags, need_event};

/// A chain popped off the available ring, already flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChain {
    /// Head index to report back in the used ring.
    pub head: u16,
    /// Device-readable segments, in chain order.
    pub readable: Vec<Segment>,
    /// Device-writable segments, in chain order.
    pub writable: Vec<Segment>,
    /// Whether the head pointed at an indirect table.
    pub indirect: bool,
}

impl DeviceChain {
    /// Total bytes the device may write.
    pub fn writable_len(&self) -> usize {
        self.writable.iter().map(|s| s.len as usize).sum()
    }
}

/// Device half of a split ring, driven by hand from tests.
///
/// Only trusts what a real device could: the avail ring and descriptor
/// contents in shared memory. Malformed chains are reported as errors.
pub struct SimDevice<M> {
    layout: Layout,
    mem: M,
    last_avail: u16,
    used_idx: u16,
    /// used index at the last interrupt decision
    signalled: u16,
    interrupts: usize,
}

impl<M: MemOps<Error = anyhow::Error>> SimDevice<M> {
    pub fn new(layout: Layout, mem: M) -> Self {
        Self {
            layout,
            mem,
            last_avail: 0,
            used_idx: 0,
            signalled: 0,
            interrupts: 0,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// Number of interrupts the device decided to raise so far.
    pub fn interrupts(&self) -> usize {
        self.interrupts
    }

    pub fn last_avail(&self) -> u16 {
        self.last_avail
    }

    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// Number of published chains not yet popped.
    pub fn pending(&self) -> Result<u16> {
        let idx = self.mem.load_acquire(self.layout.avail_idx_addr())?;
        Ok(idx.wrapping_sub(self.last_avail))
    }

    /// Take the next published chain, if any.
    pub fn pop(&mut self) -> Result<Option<DeviceChain>> {
        if self.pending()? == 0 {
            return Ok(None);
        }

        let slot = self.last_avail % self.layout.size;
        let head: u16 = self.mem.read_val(self.layout.avail_slot_addr(slot))?;
        ensure!(head < self.layout.size, "avail entry {head} out of range");

        let chain = self.walk(head)?;
        self.last_avail = self.last_avail.wrapping_add(1);
        trace!(
            "device: popped head {head}, {} segments",
            chain.readable.len() + chain.writable.len()
        );
        Ok(Some(chain))
    }

    /// Pop everything currently published.
    pub fn pop_all(&mut self) -> Result<Vec<DeviceChain>> {
        let mut out = Vec::new();
        while let Some(chain) = self.pop()? {
            out.push(chain);
        }
        Ok(out)
    }

    fn desc_at(&self, table: u64, idx: u16) -> Result<Descriptor> {
        self.mem.read_val(table + idx as u64 * Descriptor::SIZE as u64)
    }

    fn walk(&self, head: u16) -> Result<DeviceChain> {
        let first = self.desc_at(self.layout.desc_table_addr, head)?;

        let (table, count, start, indirect) = if first.is_indirect() {
            ensure!(!first.is_next(), "indirect head {head} also chained");
            ensure!(
                first.len as usize % Descriptor::SIZE == 0 && first.len > 0,
                "indirect table length {} not a multiple of descriptor size",
                first.len
            );
            (first.addr, first.len as usize / Descriptor::SIZE, 0u16, true)
        } else {
            (self.layout.desc_table_addr, self.layout.size as usize, head, false)
        };

        let mut chain = DeviceChain {
            head,
            readable: Vec::new(),
            writable: Vec::new(),
            indirect,
        };

        let mut idx = start;
        for _ in 0..count {
            ensure!((idx as usize) < count, "next index {idx} out of table");
            let desc = self.desc_at(table, idx)?;
            if indirect {
                ensure!(!desc.is_indirect(), "nested indirect table");
            }

            let seg = Segment::new(desc.addr, desc.len);
            if desc.is_writeable() {
                chain.writable.push(seg);
            } else {
                ensure!(chain.writable.is_empty(), "readable segment after writable one");
                chain.readable.push(seg);
            }

            if !desc.is_next() {
                return Ok(chain);
            }
            idx = desc.next;
        }

        bail!("chain at head {head} loops")
    }

    /// Concatenate the readable bytes of `chain`.
    pub fn read_chain(&self, chain: &DeviceChain) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for seg in &chain.readable {
            let start = out.len();
            out.resize(start + seg.len as usize, 0);
            self.mem.read(seg.addr, &mut out[start..])?;
        }
        Ok(out)
    }

    /// Scatter `data` into the writable segments of `chain` and complete it
    /// with the number of bytes that fit. Returns that number.
    pub fn complete(&mut self, chain: &DeviceChain, data: &[u8]) -> Result<u32> {
        let mut rest = data;
        let mut written = 0usize;
        for seg in &chain.writable {
            if rest.is_empty() {
                break;
            }
            let n = rest.len().min(seg.len as usize);
            self.mem.write(seg.addr, &rest[..n])?;
            rest = &rest[n..];
            written += n;
        }

        let written = u32::try_from(written)?;
        self.push_used(chain.head as u32, written)?;
        Ok(written)
    }

    /// Append a raw used element and publish it. The id is not checked, so
    /// tests can play a misbehaving device.
    pub fn push_used(&mut self, id: u32, len: u32) -> Result<()> {
        let slot = self.used_idx % self.layout.size;
        self.mem
            .write_val(self.layout.used_elem_addr(slot), UsedElem { id, len })?;
        self.used_idx = self.used_idx.wrapping_add(1);
        self.mem
            .store_release(self.layout.used_idx_addr(), self.used_idx)?;
        Ok(())
    }

    /// Overwrite the shared used index without writing elements.
    pub fn force_used_idx(&mut self, idx: u16) -> Result<()> {
        self.used_idx = idx;
        self.mem.store_release(self.layout.used_idx_addr(), idx)
    }

    /// Decide whether to interrupt for everything used since the last call,
    /// following the driver's suppression settings.
    pub fn signal(&mut self) -> Result<bool> {
        let old = self.signalled;
        let new = self.used_idx;
        if old == new {
            return Ok(false);
        }
        self.signalled = new;

        let fire = match self.layout.used_event_addr() {
            Some(addr) => need_event(self.mem.load_acquire(addr)?, new, old),
            None => {
                let flags = self.mem.load_acquire(self.layout.avail_flags_addr())?;
                !AvailFlags::from_bits_truncate(flags).contains(AvailFlags::NO_INTERRUPT)
            }
        };

        if fire {
            self.interrupts += 1;
        }
        Ok(fire)
    }

    /// Ask the driver to kick once the avail index passes `idx`.
    pub fn set_avail_event(&self, idx: u16) -> Result<()> {
        let Some(addr) = self.layout.avail_event_addr() else {
            bail!("EVENT_IDX not negotiated");
        };
        self.mem.store_release(addr, idx)
    }

    /// Toggle NO_NOTIFY in the used ring flags.
    pub fn set_no_notify(&self, on: bool) -> Result<()> {
        let flags = if on {
            UsedFlags::NO_NOTIFY
        } else {
            UsedFlags::empty()
        };
        self.mem
            .store_release(self.layout.used_flags_addr(), flags.bits())
    }

    /// Read the driver's `used_event`, if negotiated.
    pub fn used_event(&self) -> Result<Option<u16>> {
        self.layout
            .used_event_addr()
            .map(|addr| self.mem.load_acquire(addr))
            .transpose()
    }

    /// Whether the driver currently asks not to be interrupted.
    pub fn interrupts_suppressed(&self) -> Result<bool> {
        let flags = self.mem.load_acquire(self.layout.avail_flags_addr())?;
        Ok(AvailFlags::from_bits_truncate(flags).contains(AvailFlags::NO_INTERRUPT))
    }

    /// Forget device-side progress, as a device reset does.
    pub fn reset(&mut self) {
        self.last_avail = 0;
        self.used_idx = 0;
        self.signalled = 0;
    }
}
