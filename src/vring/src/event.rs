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

//! Notification Suppression for Split Virtqueues
//!
//! Both sides of a split ring can ask the other not to bother them:
//!
//! - The driver sets [`AvailFlags::NO_INTERRUPT`] (or, with `EVENT_IDX`,
//!   writes `used_event`) to control when the device interrupts it.
//! - The device sets [`UsedFlags::NO_NOTIFY`] (or, with `EVENT_IDX`, writes
//!   `avail_event`) to control when the driver kicks it.
//!
//! With `EVENT_IDX` the decision is the wrap-safe comparison in
//! [`need_event`]: notify if the event index lies in the half-open window
//! `[old, new)` of entries published since the last notification.

use core::sync::atomic::{Ordering, fence};

use bitflags::bitflags;

use super::{Layout, MemOps, RingError};

bitflags! {
    /// Flags the driver writes into the available ring header.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AvailFlags: u16 {
        /// Ask the device not to interrupt when it consumes a buffer.
        const NO_INTERRUPT = 1 << 0;
    }
}

bitflags! {
    /// Flags the device writes into the used ring header.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UsedFlags: u16 {
        /// Ask the driver not to kick when it adds a buffer.
        const NO_NOTIFY = 1 << 0;
    }
}

/// Returns true if `event_idx` lies in `[old, new)` modulo 2^16.
///
/// `old` is the index at the last notification and `new` the index now.
/// Correct as long as fewer than 2^16 entries were published in between.
#[inline]
pub fn need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}

/// Driver side of notification suppression for one ring.
///
/// Keeps a shadow of the avail flags so the driver never has to read back a
/// field it owns.
#[derive(Debug, Clone)]
pub struct Suppression {
    layout: Layout,
    avail_flags: AvailFlags,
}

impl Suppression {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            avail_flags: AvailFlags::empty(),
        }
    }

    /// Whether `EVENT_IDX` was negotiated for this ring.
    #[inline]
    pub fn event_idx(&self) -> bool {
        self.layout.event_idx
    }

    /// True unless the driver asked the device to hold interrupts.
    #[inline]
    pub fn interrupts_enabled(&self) -> bool {
        !self.avail_flags.contains(AvailFlags::NO_INTERRUPT)
    }

    /// Decide whether the device must be kicked after the avail index moved
    /// from `old` to `new`.
    ///
    /// The avail index store must be visible before the device's suppression
    /// fields are sampled, hence the full fence.
    pub fn should_kick<M: MemOps>(&self, mem: &M, old: u16, new: u16) -> Result<bool, RingError> {
        fence(Ordering::SeqCst);

        match self.layout.avail_event_addr() {
            Some(addr) => {
                let avail_event = mem.load_acquire(addr).map_err(|_| RingError::MemError)?;
                Ok(need_event(avail_event, new, old))
            }
            None => {
                let raw = mem
                    .load_acquire(self.layout.used_flags_addr())
                    .map_err(|_| RingError::MemError)?;
                Ok(!UsedFlags::from_bits_truncate(raw).contains(UsedFlags::NO_NOTIFY))
            }
        }
    }

    /// Ask the device to stop interrupting.
    ///
    /// Best effort: the device may already be past the point of reading the
    /// flag, so a late interrupt must still be tolerated.
    pub fn disable<M: MemOps>(&mut self, mem: &M) -> Result<(), RingError> {
        if self.avail_flags.contains(AvailFlags::NO_INTERRUPT) {
            return Ok(());
        }

        self.avail_flags.insert(AvailFlags::NO_INTERRUPT);
        self.write_flags(mem)
    }

    /// Ask the device to interrupt once it has used the entry at `used_event`.
    ///
    /// Callers re-check the used index afterwards; the trailing fence orders
    /// this store before that load.
    pub fn enable<M: MemOps>(&mut self, mem: &M, used_event: u16) -> Result<(), RingError> {
        if self.avail_flags.contains(AvailFlags::NO_INTERRUPT) {
            self.avail_flags.remove(AvailFlags::NO_INTERRUPT);
            self.write_flags(mem)?;
        }

        self.write_used_event(mem, used_event)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Keep `used_event` trailing the consumer after a reclaim, so the next
    /// completion interrupts while interrupts are enabled.
    pub fn after_reclaim<M: MemOps>(&self, mem: &M, last_used: u16) -> Result<(), RingError> {
        if !self.interrupts_enabled() {
            return Ok(());
        }

        self.write_used_event(mem, last_used)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Forget the shadow flags after the ring memory was re-zeroed.
    pub fn reset(&mut self) {
        self.avail_flags = AvailFlags::empty();
    }

    fn write_flags<M: MemOps>(&self, mem: &M) -> Result<(), RingError> {
        mem.store_release(self.layout.avail_flags_addr(), self.avail_flags.bits())
            .map_err(|_| RingError::MemError)
    }

    fn write_used_event<M: MemOps>(&self, mem: &M, idx: u16) -> Result<(), RingError> {
        match self.layout.used_event_addr() {
            Some(addr) => mem
                .store_release(addr, idx)
                .map_err(|_| RingError::MemError),
            None => Ok(()),
        }
    }
}
