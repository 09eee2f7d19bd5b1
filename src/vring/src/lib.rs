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

//! Split Virtqueue Engine
//!
//! This crate implements the driver (guest) side of the VIRTIO split virtqueue:
//! the shared-memory ring protocol every paravirtualized device driver uses to
//! hand buffers to a device backend and take them back once the device is done.
//!
//! # Architecture
//!
//! The implementation is split into layers:
//!
//! - **Queue API** ([`Virtqueue`]): lifecycle state machine, per-chain cookies,
//!   indirect table management, notifier invocation. This is what drivers use.
//!
//! - **Ring primitives** ([`SplitRing`]): descriptor chain construction over the
//!   free-list arena, avail ring publication, used ring reclamation.
//!
//! - **Layout and wire types** ([`Layout`], [`Descriptor`], [`UsedElem`]): the
//!   bit-exact binary contract shared with the device.
//!
//! - **Notification suppression** ([`Suppression`], [`need_event`]): the
//!   `EVENT_IDX` and flag based kick/interrupt suppression.
//!
//! # Quick Start
//!
//! ```ignore
//! let config = QueueConfig::new(0, 256).with_features(Features::EVENT_IDX);
//! let region = MemRegion::new(ring_base, ring_len);
//! let mut vq = Virtqueue::create(config, region, mem, notifier, NoIndirect)?;
//!
//! vq.add_buffer(&[Segment::new(req_addr, req_len)], &[Segment::new(resp_addr, 512)], cookie)?;
//! vq.kick()?;
//!
//! // interrupt / DPC context
//! loop {
//!     vq.disable_interrupts()?;
//!     while let Some(done) = vq.reclaim()? {
//!         complete(done.cookie, done.written);
//!     }
//!     if !vq.enable_interrupts()? {
//!         break;
//!     }
//! }
//! ```
//!
//! The engine never blocks and owns no threads. Waiting for the device is the
//! caller's business (interrupt, deferred procedure or polling).

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod access;
mod config;
mod desc;
mod event;
mod indirect;
mod layout;
mod queue;
mod ring;

pub use access::*;
pub use config::*;
pub use desc::*;
pub use event::*;
pub use indirect::*;
pub use layout::*;
pub use queue::*;
pub use ring::*;
