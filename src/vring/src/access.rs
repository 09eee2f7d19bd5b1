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

//! Memory Access Traits for Ring Operations
//!
//! This module defines the [`MemOps`] trait that abstracts every access the
//! engine makes to the shared ring memory. The engine itself never dereferences
//! a pointer: the backend decides how a guest physical address maps to
//! something it can touch (identity mapping in a kernel, a DMA window, or a
//! heap buffer in tests).

use alloc::rc::Rc;
use alloc::sync::Arc;

use bytemuck::Pod;

/// Backend-provided memory access for the split ring.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Addresses handed out by the ring layout are valid for the duration of the call
/// - `load_acquire` / `store_release` are real atomic accesses with the named ordering,
///   since they are the only synchronization shared with the device
/// - Reads and writes don't cause undefined behavior (alignment, validity)
pub trait MemOps {
    type Error;

    /// Read bytes from shared memory.
    ///
    /// # Arguments
    ///
    /// * `addr` - Guest physical address to read from
    /// * `dst` - Destination buffer to fill
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to shared memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// `addr` must translate to a valid, aligned `AtomicU16` in shared memory.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// `addr` must translate to a valid, aligned `AtomicU16` in shared memory.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }

    /// Zero `len` bytes starting at `addr`.
    fn zero(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
        const CHUNK: usize = 256;
        let zeros = [0u8; CHUNK];

        let mut off = 0;
        while off < len {
            let n = CHUNK.min(len - off);
            self.write(addr + off as u64, &zeros[..n])?;
            off += n;
        }

        Ok(())
    }
}

macro_rules! forward_mem_ops {
    ($($ptr:ty),*) => {$(
        impl<T: MemOps + ?Sized> MemOps for $ptr {
            type Error = T::Error;

            #[inline]
            fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
                (**self).read(addr, dst)
            }

            #[inline]
            fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
                (**self).write(addr, src)
            }

            #[inline]
            fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
                (**self).load_acquire(addr)
            }

            #[inline]
            fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
                (**self).store_release(addr, val)
            }

            #[inline]
            fn read_val<V: Pod>(&self, addr: u64) -> Result<V, Self::Error> {
                (**self).read_val(addr)
            }

            #[inline]
            fn write_val<V: Pod>(&self, addr: u64, val: V) -> Result<(), Self::Error> {
                (**self).write_val(addr, val)
            }
        }
    )*};
}

forward_mem_ops!(&T, Rc<T>, Arc<T>);
