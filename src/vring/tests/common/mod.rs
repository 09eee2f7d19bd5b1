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
#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use vring::{
    BufferProvider, Features, IndirectPool, Layout, MemRegion, NoIndirect, Notifier,
    QueueConfig, QueueStats, Segment, Virtqueue,
};
use vring_testing::{DEFAULT_GPA_BASE, GuestMemory, SimDevice};

pub const RING_ALIGN: usize = 4096;
pub const POOL_LEN: usize = 16 * 1024;
pub const SLOT_LEN: u32 = 256;
pub const NUM_SLOTS: u64 = 256;

pub type Mem = Rc<GuestMemory>;

#[derive(Clone, Default)]
pub struct KickCounter(pub Rc<Cell<usize>>);

impl Notifier for KickCounter {
    fn notify(&self, _stats: QueueStats) {
        self.0.set(self.0.get() + 1);
    }
}

/// A queue, the device on the other end, and the memory they share.
pub struct Harness<P = NoIndirect> {
    pub mem: Mem,
    pub queue: Virtqueue<u32, Mem, KickCounter, P>,
    pub device: SimDevice<Mem>,
    pub kicks: Rc<Cell<usize>>,
    pub pool_base: u64,
    pub data_base: u64,
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

pub fn config(size: u16, features: Features) -> QueueConfig {
    QueueConfig::new(0, size)
        .with_max_size(1024)
        .with_align(RING_ALIGN)
        .with_features(features)
}

/// Guest memory with room for a ring of `size`, an indirect pool and data
/// slots. Returns the memory and the ring, pool and data bases.
pub fn guest_memory(size: u16, features: Features) -> (Mem, MemRegion, u64, u64) {
    let ring_len = Layout::query_size(size, RING_ALIGN, features);
    let ring_base = DEFAULT_GPA_BASE;
    let pool_base = align_up(ring_base + ring_len as u64, RING_ALIGN as u64);
    let data_base = pool_base + POOL_LEN as u64;
    let end = data_base + NUM_SLOTS * SLOT_LEN as u64;

    let mem = Rc::new(GuestMemory::new(ring_base, (end - ring_base) as usize));
    (mem, MemRegion::new(ring_base, ring_len), pool_base, data_base)
}

impl Harness<NoIndirect> {
    pub fn new(size: u16, features: Features) -> Self {
        Self::with_provider(size, features, |_| NoIndirect)
    }
}

impl Harness<IndirectPool<128>> {
    pub fn indirect(size: u16, features: Features) -> Self {
        Self::with_provider(size, features | Features::INDIRECT_DESC, |base| {
            IndirectPool::new(base, POOL_LEN).unwrap()
        })
    }
}

impl<P: BufferProvider> Harness<P> {
    pub fn with_provider(size: u16, features: Features, pool: impl FnOnce(u64) -> P) -> Self {
        let (mem, region, pool_base, data_base) = guest_memory(size, features);
        let notifier = KickCounter::default();
        let kicks = notifier.0.clone();

        let queue = Virtqueue::create(
            config(size, features),
            region,
            mem.clone(),
            notifier,
            pool(pool_base),
        )
        .unwrap();
        let device = SimDevice::new(queue.layout(), mem.clone());

        Self {
            mem,
            queue,
            device,
            kicks,
            pool_base,
            data_base,
        }
    }

    /// A full data slot, `i` wrapping around the data area.
    pub fn slot(&self, i: u64) -> Segment {
        Segment::new(self.data_base + (i % NUM_SLOTS) * SLOT_LEN as u64, SLOT_LEN)
    }

    /// Fill slot `i` with `data` and return the segment covering it.
    pub fn request(&self, i: u64, data: &[u8]) -> Segment {
        let seg = self.slot(i);
        self.mem.write_bytes(seg.addr, data).unwrap();
        Segment::new(seg.addr, data.len() as u32)
    }

    /// Device completes everything published, writing `reply` into each.
    pub fn serve_all(&mut self, reply: &[u8]) -> usize {
        let chains = self.device.pop_all().unwrap();
        for chain in &chains {
            self.device.complete(chain, reply).unwrap();
        }
        chains.len()
    }

    /// Reclaim until the used ring is empty, returning cookies in order.
    pub fn reclaim_all(&mut self) -> Vec<u32> {
        let mut cookies = Vec::new();
        while let Some(c) = self.queue.reclaim().unwrap() {
            cookies.push(c.cookie);
        }
        cookies
    }

    pub fn kicks(&self) -> usize {
        self.kicks.get()
    }
}
