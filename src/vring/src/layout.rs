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

//! Split ring memory layout.
//!
//! ```text
//! descriptor[size]   : { addr:u64, len:u32, flags:u16, next:u16 }   (16 bytes each)
//! <padding to alignment>
//! available_ring     : { flags:u16, idx:u16, ring[size]:u16, used_event:u16 }
//! <padding to alignment>
//! used_ring          : { flags:u16, idx:u16, ring[size]:{id:u32, len:u32}, avail_event:u16 }
//! ```
//!
//! The trailing `used_event` / `avail_event` words only exist when
//! [`Features::EVENT_IDX`] was negotiated. All fields are in guest byte order.

use bytemuck::{Pod, Zeroable};

use super::{Descriptor, Features, RingError};

/// One used ring element, written by the device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct UsedElem {
    /// Head index of the completed chain (u32 for padding reasons).
    pub id: u32,
    /// Total bytes written by the device into the chain's writable segments.
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

/// Layout of a split virtqueue in shared memory.
///
/// Use [`from_base`](Self::from_base) to compute the layout from a base
/// address, or [`query_size`](Self::query_size) to determine memory requirements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Descriptor table base.
    pub desc_table_addr: u64,
    /// Available (driver) ring base.
    pub avail_addr: u64,
    /// Used (device) ring base.
    pub used_addr: u64,
    /// Number of descriptors (ring size, power of 2).
    pub size: u16,
    /// Whether the event index words are part of the layout.
    pub event_idx: bool,
}

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

impl Layout {
    const HEADER: usize = 2 * core::mem::size_of::<u16>();
    const EVENT: usize = core::mem::size_of::<u16>();

    /// Bytes taken by the descriptor table.
    pub const fn desc_table_size(size: u16) -> usize {
        size as usize * Descriptor::SIZE
    }

    /// Bytes taken by the available ring.
    pub const fn avail_ring_size(size: u16, event_idx: bool) -> usize {
        Self::HEADER + size as usize * 2 + if event_idx { Self::EVENT } else { 0 }
    }

    /// Bytes taken by the used ring.
    pub const fn used_ring_size(size: u16, event_idx: bool) -> usize {
        Self::HEADER
            + size as usize * core::mem::size_of::<UsedElem>()
            + if event_idx { Self::EVENT } else { 0 }
    }

    /// Offset of the used ring from the start of the region.
    pub const fn used_offset(size: u16, align: usize, event_idx: bool) -> usize {
        align_up(
            Self::desc_table_size(size) + Self::avail_ring_size(size, event_idx),
            align,
        )
    }

    /// Calculate the memory size needed for a ring of `size` descriptors,
    /// accounting for alignment requirements. `align` must be a power of two.
    pub const fn query_size(size: u16, align: usize, features: Features) -> usize {
        let event_idx = features.contains(Features::EVENT_IDX);
        Self::used_offset(size, align, event_idx) + Self::used_ring_size(size, event_idx)
    }

    /// Create a Layout from a base address.
    ///
    /// The base must be aligned to `align` (itself a power of two of at least
    /// [`Descriptor::ALIGN`]); the caller checks that the region is at least
    /// [`query_size`](Self::query_size) bytes.
    pub const fn from_base(
        base: u64,
        size: u16,
        align: usize,
        features: Features,
    ) -> Result<Self, RingError> {
        if size == 0 || !align.is_power_of_two() || align < Descriptor::ALIGN {
            return Err(RingError::InvalidLayout);
        }

        if !base.is_multiple_of(align as u64) {
            return Err(RingError::InvalidLayout);
        }

        let event_idx = features.contains(Features::EVENT_IDX);
        let avail_off = Self::desc_table_size(size);
        let used_off = Self::used_offset(size, align, event_idx);

        Ok(Self {
            desc_table_addr: base,
            avail_addr: base + avail_off as u64,
            used_addr: base + used_off as u64,
            size,
            event_idx,
        })
    }

    /// Total bytes covered by this layout.
    pub const fn total_size(&self) -> usize {
        (self.used_addr - self.desc_table_addr) as usize
            + Self::used_ring_size(self.size, self.event_idx)
    }

    #[inline]
    pub const fn avail_flags_addr(&self) -> u64 {
        self.avail_addr
    }

    #[inline]
    pub const fn avail_idx_addr(&self) -> u64 {
        self.avail_addr + 2
    }

    /// Address of avail ring slot `slot` (already reduced modulo size).
    #[inline]
    pub const fn avail_slot_addr(&self, slot: u16) -> u64 {
        self.avail_addr + Self::HEADER as u64 + slot as u64 * 2
    }

    /// `used_event`, written by the driver. Only present with EVENT_IDX.
    #[inline]
    pub const fn used_event_addr(&self) -> Option<u64> {
        if self.event_idx {
            Some(self.avail_slot_addr(self.size))
        } else {
            None
        }
    }

    #[inline]
    pub const fn used_flags_addr(&self) -> u64 {
        self.used_addr
    }

    #[inline]
    pub const fn used_idx_addr(&self) -> u64 {
        self.used_addr + 2
    }

    /// Address of used ring element `slot` (already reduced modulo size).
    #[inline]
    pub const fn used_elem_addr(&self, slot: u16) -> u64 {
        self.used_addr + Self::HEADER as u64 + slot as u64 * core::mem::size_of::<UsedElem>() as u64
    }

    /// `avail_event`, written by the device. Only present with EVENT_IDX.
    #[inline]
    pub const fn avail_event_addr(&self) -> Option<u64> {
        if self.event_idx {
            Some(self.used_elem_addr(self.size))
        } else {
            None
        }
    }
}

const _: () = {
    const fn verify_layout(size: u16, align: usize, features: Features) {
        let base = 0x10_0000u64;

        let layout = match Layout::from_base(base, size, align, features) {
            Ok(l) => l,
            Err(_) => panic!("from_base failed"),
        };

        let event_idx = features.contains(Features::EVENT_IDX);
        let expected_size = Layout::query_size(size, align, features);

        assert!(layout.desc_table_addr == base);
        assert!(layout.avail_addr == base + (size as u64) * 16);
        assert!(layout.used_addr.is_multiple_of(align as u64));

        // Rings don't overlap
        let avail_end = layout.avail_addr + Layout::avail_ring_size(size, event_idx) as u64;
        assert!(layout.used_addr >= avail_end);

        // Total size from query_size covers entire layout
        assert!(layout.total_size() == expected_size);
    }

    let ev = Features::EVENT_IDX;
    let none = Features::empty();

    verify_layout(1, 16, none);
    verify_layout(4, 16, ev);
    verify_layout(8, 64, none);
    verify_layout(16, 4096, ev);
    verify_layout(256, 4096, none);
    verify_layout(256, 4096, ev);
    verify_layout(1024, 4096, ev);
    verify_layout(32768, 4096, ev);
};
