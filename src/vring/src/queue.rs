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

//! Driver-facing virtqueue.
//!
//! [`Virtqueue`] wraps a [`SplitRing`] with what a device driver needs on top
//! of the raw ring: a cookie per outstanding chain, indirect table ownership,
//! the device notification callback and the queue lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! Created --add--> Active --begin_drain--> Draining --last chain back--> Destroyed
//!    \________________________begin_drain / destroy (idle)_______________/
//! ```
//!
//! `reset` returns an idle queue to `Created`, rezeroing the ring. This
//! includes a `Destroyed` queue: every other operation on it fails fast, and
//! `reset` is the one way to bring it back, for a driver that re-initializes
//! the device and wants the same ring memory again.
//!
//! # Draining
//!
//! Once draining, submissions fail with [`VirtqError::BrokenQueue`] while
//! [`Virtqueue::reclaim`] keeps working. Chains the device will never complete
//! (because it was reset) are handed back by [`Virtqueue::detach_unused`].

use alloc::vec::Vec;

use log::{debug, error, trace, warn};
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{
    AllocError, AllocGuard, Allocation, BufferChain, BufferProvider, Descriptor, Layout,
    MemOps, MemRegion, NoIndirect, QueueConfig, RingError, Segment, SplitRing,
};

/// A trait for notifying the device about new buffers.
pub trait Notifier {
    fn notify(&self, stats: QueueStats);
}

impl<F: Fn(QueueStats)> Notifier for F {
    fn notify(&self, stats: QueueStats) {
        self(stats)
    }
}

/// Snapshot of queue occupancy, handed to the [`Notifier`] with each kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Queue ordinal on the device.
    pub index: u16,
    /// Number of free descriptor slots available.
    pub num_free: usize,
    /// Number of chains currently owned by the device.
    pub num_inflight: usize,
}

/// Lifecycle state of a [`Virtqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// Bound to its memory, nothing submitted yet.
    Created,
    /// At least one buffer has been submitted.
    Active,
    /// Detach requested: no new submissions, completions still drained.
    Draining,
    /// Nothing outstanding and no further use possible.
    Destroyed,
}

/// A reclaimed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion<C> {
    /// Head descriptor index the chain was submitted under.
    pub head: u16,
    /// The cookie passed to [`Virtqueue::add_buffer`].
    pub cookie: C,
    /// Bytes the device reports having written into the chain.
    pub written: u32,
}

/// Errors that can occur in the virtqueue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    #[error("Not enough free descriptors for the chain")]
    QueueFull,
    #[error("Invalid queue size {0}")]
    InvalidSize(u16),
    #[error("Invalid ring alignment {0}")]
    InvalidAlignment(usize),
    #[error("Ring base {0:#x} is not aligned to the ring alignment")]
    MisalignedRegion(u64),
    #[error("Region too small: need {required} bytes, got {actual}")]
    ShortBuffer { required: usize, actual: usize },
    #[error("Queue is broken, draining or destroyed")]
    BrokenQueue,
    #[error("{0} chains still outstanding")]
    ChainsOutstanding(usize),
    #[error("Queue is not draining")]
    NotDraining,
    #[error("Ring error: {0}")]
    Ring(RingError),
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
}

impl From<RingError> for VirtqError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::QueueFull => VirtqError::QueueFull,
            RingError::Busy(n) => VirtqError::ChainsOutstanding(n),
            e => VirtqError::Ring(e),
        }
    }
}

#[derive(Debug)]
struct Inflight<C> {
    cookie: C,
    table: Option<Allocation>,
}

/// Guest-side split virtqueue.
///
/// - `C`: per-chain cookie returned on completion
/// - `M`: shared memory access
/// - `N`: device notification
/// - `P`: indirect table provider ([`NoIndirect`] when not negotiated)
///
/// Submission (`add_*`, `kick*`) and completion (`reclaim`, interrupt
/// toggling) touch disjoint ring cursors, but both take `&mut self`: callers
/// that run them from different contexts serialize access themselves.
pub struct Virtqueue<C, M, N, P = NoIndirect> {
    ring: SplitRing<M>,
    config: QueueConfig,
    notifier: N,
    pool: P,
    inflight: Vec<Option<Inflight<C>>>,
    state: QueueState,
    broken: bool,
}

impl<C, M, N, P> Virtqueue<C, M, N, P>
where
    M: MemOps,
    N: Notifier,
    P: BufferProvider,
{
    /// Bind a queue to `region` and zero the ring.
    ///
    /// # Errors
    ///
    /// - [`VirtqError::InvalidSize`], [`VirtqError::InvalidAlignment`] - see
    ///   [`QueueConfig::validate`]
    /// - [`VirtqError::MisalignedRegion`] - region base not aligned to `config.align`
    /// - [`VirtqError::ShortBuffer`] - region smaller than [`Layout::query_size`]
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn create(
        config: QueueConfig,
        region: MemRegion,
        mem: M,
        notifier: N,
        pool: P,
    ) -> Result<Self, VirtqError> {
        config.validate()?;

        let required = Layout::query_size(config.size, config.align, config.features);
        if region.len < required {
            return Err(VirtqError::ShortBuffer {
                required,
                actual: region.len,
            });
        }

        let layout = Layout::from_base(region.base, config.size, config.align, config.features)
            .map_err(|_| VirtqError::MisalignedRegion(region.base))?;

        let ring = SplitRing::new(layout, mem)?;
        let inflight = core::iter::repeat_with(|| None)
            .take(config.size as usize)
            .collect();

        debug!(
            "virtqueue {}: created size {} at {:#x} ({} bytes), features {:?}",
            config.index, config.size, region.base, required, config.features
        );

        Ok(Self {
            ring,
            config,
            notifier,
            pool,
            inflight,
            state: QueueState::Created,
            broken: false,
        })
    }

    /// Submit a chain of `out` (device-readable) then `inp` (device-writable)
    /// segments. Returns the head descriptor index.
    ///
    /// Either the whole chain is queued or nothing is: on error no descriptor
    /// or indirect table stays allocated.
    pub fn add_buffer(
        &mut self,
        out: &[Segment],
        inp: &[Segment],
        cookie: C,
    ) -> Result<u16, VirtqError> {
        let chain = BufferChain::from_segments(out, inp)?;
        self.add_chain(&chain, cookie)
    }

    /// Submit a pre-built chain. See [`add_buffer`](Self::add_buffer).
    pub fn add_chain(&mut self, chain: &BufferChain, cookie: C) -> Result<u16, VirtqError> {
        self.check_submit()?;

        let (head, table) = match self.add_to_ring(chain) {
            Ok(added) => added,
            Err(VirtqError::QueueFull) => {
                warn!(
                    "virtqueue {}: full, {} segments wanted, {} free",
                    self.config.index,
                    chain.len(),
                    self.ring.num_free()
                );
                // let the device catch up on what is already queued
                if !chain.readables().is_empty() {
                    self.notify();
                }
                return Err(VirtqError::QueueFull);
            }
            Err(e) => return Err(e),
        };

        let forced = match self.ring.publish(head) {
            Ok(forced) => forced,
            Err(e) => {
                self.unwind(head, table);
                return Err(e.into());
            }
        };
        self.inflight[head as usize] = Some(Inflight { cookie, table });

        if forced {
            trace!(
                "virtqueue {}: forced kick after a full index batch",
                self.config.index
            );
            if self.ring.kick_prepare()? {
                self.notify();
            }
        }

        if self.state == QueueState::Created {
            debug!("virtqueue {}: active", self.config.index);
            self.state = QueueState::Active;
        }

        trace!(
            "virtqueue {}: added head {} ({} segments{})",
            self.config.index,
            head,
            chain.len(),
            if table.is_some() { ", indirect" } else { "" }
        );

        Ok(head)
    }

    /// Take back a chain that was written but never made visible.
    fn unwind(&mut self, head: u16, table: Option<Allocation>) {
        if let Err(e) = self.ring.free_chain(head) {
            error!(
                "virtqueue {}: failed to release unpublished head {}: {}",
                self.config.index, head, e
            );
        }
        if let Some(table) = table {
            self.release_table(table);
        }
    }

    fn release_table(&self, table: Allocation) {
        if let Err(e) = self.pool.dealloc(table) {
            error!(
                "virtqueue {}: failed to free indirect table {:#x}: {}",
                self.config.index, table.addr, e
            );
        }
    }

    fn use_indirect(&self, chain: &BufferChain) -> bool {
        self.config.indirect()
            && chain.len() > 1
            && chain.len() > self.config.indirect_threshold as usize
    }

    fn add_to_ring(
        &mut self,
        chain: &BufferChain,
    ) -> Result<(u16, Option<Allocation>), VirtqError> {
        if self.use_indirect(chain) {
            let bytes = chain.len() * Descriptor::SIZE;

            match self.pool.alloc(bytes) {
                Ok(alloc) => {
                    let pool = &self.pool;
                    let guard = AllocGuard::new(alloc, |a| {
                        let _ = pool.dealloc(a);
                    });

                    let head = self.ring.add_indirect(chain, *guard)?;
                    return Ok((head, Some(guard.dismiss())));
                }
                // fall back to a direct chain
                Err(AllocError::OutOfMemory) => {
                    trace!("virtqueue {}: indirect pool exhausted", self.config.index);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok((self.ring.add_direct(chain)?, None))
    }

    fn check_submit(&self) -> Result<(), VirtqError> {
        match self.state {
            _ if self.broken => Err(VirtqError::BrokenQueue),
            QueueState::Created | QueueState::Active => Ok(()),
            QueueState::Draining | QueueState::Destroyed => Err(VirtqError::BrokenQueue),
        }
    }

    fn check_live(&self) -> Result<(), VirtqError> {
        if self.broken || self.state == QueueState::Destroyed {
            return Err(VirtqError::BrokenQueue);
        }
        Ok(())
    }

    /// Take one completed chain back from the device.
    ///
    /// Returns `Ok(None)` when nothing new has been used. Safe to call again
    /// at any time; it only ever consumes entries the device has published.
    ///
    /// A device that names a descriptor that is not an outstanding head
    /// breaks the queue: this and every later call fails.
    pub fn reclaim(&mut self) -> Result<Option<Completion<C>>, VirtqError> {
        self.check_live()?;

        let used = match self.ring.poll_used() {
            Ok(Some(used)) => used,
            Ok(None) => return Ok(None),
            Err(e @ (RingError::BadUsedEntry(_) | RingError::BadUsedIndex(_))) => {
                return Err(self.mark_broken(e));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(inf) = self
            .inflight
            .get_mut(used.id as usize)
            .and_then(Option::take)
        else {
            return Err(self.mark_broken(RingError::BadUsedEntry(used.id as u32)));
        };

        if let Some(table) = inf.table {
            self.release_table(table);
        }

        trace!(
            "virtqueue {}: reclaimed head {}, {} bytes written",
            self.config.index, used.id, used.len
        );

        self.maybe_finish_drain();

        Ok(Some(Completion {
            head: used.id,
            cookie: inf.cookie,
            written: used.len,
        }))
    }

    fn mark_broken(&mut self, err: RingError) -> VirtqError {
        error!(
            "virtqueue {}: device protocol violation: {}",
            self.config.index, err
        );
        self.broken = true;
        err.into()
    }

    fn maybe_finish_drain(&mut self) {
        if self.state == QueueState::Draining && self.ring.num_inflight() == 0 {
            debug!("virtqueue {}: drained", self.config.index);
            self.state = QueueState::Destroyed;
        }
    }

    /// Notify the device if its suppression settings ask for it.
    /// Returns whether the notifier was invoked.
    pub fn kick(&mut self) -> Result<bool, VirtqError> {
        let needed = self.kick_prepare()?;
        if needed {
            self.notify();
        }
        Ok(needed)
    }

    /// First half of [`kick`](Self::kick): decide, without notifying.
    pub fn kick_prepare(&mut self) -> Result<bool, VirtqError> {
        self.check_live()?;
        Ok(self.ring.kick_prepare()?)
    }

    /// Second half of [`kick`](Self::kick): unconditionally invoke the notifier.
    pub fn notify(&self) {
        self.notifier.notify(self.stats());
    }

    /// Re-enable device interrupts.
    ///
    /// Returns true if used entries are already waiting; the caller must then
    /// drain again, or the completion that raced the enable is missed.
    pub fn enable_interrupts(&mut self) -> Result<bool, VirtqError> {
        self.check_live()?;
        Ok(self.ring.enable_interrupts()?)
    }

    /// Suppress device interrupts. Returns true if used entries are waiting.
    pub fn disable_interrupts(&mut self) -> Result<bool, VirtqError> {
        self.check_live()?;
        Ok(self.ring.disable_interrupts()?)
    }

    /// Re-enable interrupts, deferring the next one until most outstanding
    /// buffers are used. Returns true if that point has already passed.
    pub fn enable_interrupts_delayed(&mut self) -> Result<bool, VirtqError> {
        self.check_live()?;
        Ok(self.ring.enable_interrupts_delayed()?)
    }

    pub fn is_interrupt_enabled(&self) -> bool {
        self.ring.is_interrupt_enabled()
    }

    /// Stop accepting submissions. Completions keep flowing until nothing is
    /// outstanding, at which point the queue is destroyed.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn begin_drain(&mut self) {
        match self.state {
            QueueState::Created | QueueState::Active => {
                debug!(
                    "virtqueue {}: draining, {} chains outstanding",
                    self.config.index,
                    self.ring.num_inflight()
                );
                self.state = QueueState::Draining;
                self.maybe_finish_drain();
            }
            QueueState::Draining | QueueState::Destroyed => {}
        }
    }

    /// Hand back the cookie of a chain the device will never complete.
    ///
    /// Only valid while draining, after the device has been reset. The avail
    /// index is left where it is.
    pub fn detach_unused(&mut self) -> Result<Option<C>, VirtqError> {
        if self.state != QueueState::Draining {
            return Err(VirtqError::NotDraining);
        }

        let Some(head) = self.ring.detach_unused() else {
            return Ok(None);
        };

        let inf = self.inflight[head as usize]
            .take()
            .ok_or(VirtqError::Ring(RingError::BadUsedEntry(head as u32)))?;

        if let Some(table) = inf.table {
            self.release_table(table);
        }

        trace!("virtqueue {}: detached head {}", self.config.index, head);
        self.maybe_finish_drain();
        Ok(Some(inf.cookie))
    }

    /// Release the queue. Fails while chains are outstanding.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn destroy(&mut self) -> Result<(), VirtqError> {
        let outstanding = self.ring.num_inflight();
        if outstanding != 0 {
            error!(
                "virtqueue {}: destroy with {} chains outstanding",
                self.config.index, outstanding
            );
            return Err(VirtqError::ChainsOutstanding(outstanding));
        }

        if self.state != QueueState::Destroyed {
            debug!("virtqueue {}: destroyed", self.config.index);
            self.state = QueueState::Destroyed;
        }

        Ok(())
    }

    /// Return an idle queue to the state [`create`](Self::create) left it in.
    ///
    /// Works from any state, `Destroyed` and broken included, as long as no
    /// chain is outstanding. Fails with [`VirtqError::ChainsOutstanding`]
    /// otherwise; drain or detach first.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace"))]
    pub fn reset(&mut self) -> Result<(), VirtqError> {
        self.ring.reset()?;
        self.state = QueueState::Created;
        self.broken = false;
        debug!("virtqueue {}: reset", self.config.index);
        Ok(())
    }

    pub fn size(&self) -> u16 {
        self.config.size
    }

    pub fn index(&self) -> u16 {
        self.config.index
    }

    pub fn num_free(&self) -> usize {
        self.ring.num_free()
    }

    pub fn num_inflight(&self) -> usize {
        self.ring.num_inflight()
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// True once the device violated the ring protocol.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn layout(&self) -> Layout {
        self.ring.layout()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The indirect table provider the queue was created with.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            index: self.config.index,
            num_free: self.ring.num_free(),
            num_inflight: self.ring.num_inflight(),
        }
    }
}
