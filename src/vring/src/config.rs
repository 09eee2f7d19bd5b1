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

//! Creation-time queue configuration and negotiated ring features.

use bitflags::bitflags;

use super::VirtqError;

bitflags! {
    /// Ring features negotiated with the device.
    ///
    /// Only the transport bits the ring engine cares about are named here; any
    /// other negotiated bit is carried along untouched.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Features: u64 {
        /// VIRTIO_RING_F_INDIRECT_DESC: descriptors may point at indirect tables.
        const INDIRECT_DESC = 1 << 28;
        /// VIRTIO_RING_F_EVENT_IDX: `used_event` / `avail_event` suppression.
        const EVENT_IDX = 1 << 29;

        const _ = !0;
    }
}

/// A caller-supplied region of shared memory the ring is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    /// Guest physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub len: usize,
}

impl MemRegion {
    pub const fn new(base: u64, len: usize) -> Self {
        Self { base, len }
    }
}

/// The complete set of parameters needed to create a [`Virtqueue`](super::Virtqueue).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Zero-based queue ordinal on the device.
    pub index: u16,
    /// Number of descriptors. Must be a power of two no larger than `max_size`.
    pub size: u16,
    /// Maximum queue size reported by the device.
    pub max_size: u16,
    /// Alignment of the used ring, relative to the region base.
    pub align: usize,
    /// Negotiated ring features.
    pub features: Features,
    /// Chains with more segments than this go through an indirect table when
    /// [`Features::INDIRECT_DESC`] is negotiated.
    pub indirect_threshold: u16,
}

impl QueueConfig {
    /// Largest queue size the split ring format allows.
    pub const MAX_QUEUE_SIZE: u16 = 32768;
    /// Legacy PCI ring alignment.
    pub const DEFAULT_ALIGN: usize = 4096;
    /// Smallest legal alignment, the descriptor table alignment.
    pub const MIN_ALIGN: usize = 16;
    /// Any chain of two or more segments goes indirect by default.
    pub const DEFAULT_INDIRECT_THRESHOLD: u16 = 1;

    /// Create a configuration with default alignment, no features, and
    /// `max_size` equal to the split ring maximum.
    pub const fn new(index: u16, size: u16) -> Self {
        Self {
            index,
            size,
            max_size: Self::MAX_QUEUE_SIZE,
            align: Self::DEFAULT_ALIGN,
            features: Features::empty(),
            indirect_threshold: Self::DEFAULT_INDIRECT_THRESHOLD,
        }
    }

    pub const fn with_max_size(mut self, max_size: u16) -> Self {
        self.max_size = max_size;
        self
    }

    pub const fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub const fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub const fn with_indirect_threshold(mut self, threshold: u16) -> Self {
        self.indirect_threshold = threshold;
        self
    }

    #[inline]
    pub fn event_idx(&self) -> bool {
        self.features.contains(Features::EVENT_IDX)
    }

    #[inline]
    pub fn indirect(&self) -> bool {
        self.features.contains(Features::INDIRECT_DESC)
    }

    /// Check size and alignment constraints.
    ///
    /// # Errors
    ///
    /// - [`VirtqError::InvalidSize`] - size is zero, not a power of two, or
    ///   exceeds `max_size` / [`Self::MAX_QUEUE_SIZE`]
    /// - [`VirtqError::InvalidAlignment`] - alignment is not a power of two
    ///   or is below [`Self::MIN_ALIGN`]
    pub fn validate(&self) -> Result<(), VirtqError> {
        let size = self.size;
        if size == 0
            || !size.is_power_of_two()
            || size > self.max_size
            || size > Self::MAX_QUEUE_SIZE
        {
            return Err(VirtqError::InvalidSize(size));
        }

        if !self.align.is_power_of_two() || self.align < Self::MIN_ALIGN {
            return Err(VirtqError::InvalidAlignment(self.align));
        }

        Ok(())
    }
}
