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

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{Result, bail};
use bytemuck::Pod;
use vring::MemOps;

/// A block of "guest physical" memory backed by the host heap.
///
/// Addresses handed to [`MemOps`] are guest physical addresses in
/// `[gpa_base, gpa_base + len)`; they are translated to offsets into the
/// backing buffer, so rings built over this memory never see host pointers.
/// Out of range accesses are reported as errors rather than touching memory.
///
/// Not `Sync`: driver and simulated device share it through an `Rc` on one
/// thread.
pub struct GuestMemory {
    /// u64 words keep the backing store 8-byte aligned
    storage: UnsafeCell<Vec<u64>>,
    gpa_base: u64,
    len: usize,
}

impl GuestMemory {
    /// `gpa_base` must be 8-byte aligned.
    pub fn new(gpa_base: u64, len: usize) -> Self {
        assert!(gpa_base.is_multiple_of(8), "unaligned guest base");
        Self {
            storage: UnsafeCell::new(vec![0u64; len.div_ceil(8)]),
            gpa_base,
            len,
        }
    }

    pub fn gpa_base(&self) -> u64 {
        self.gpa_base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First address past the end of the memory.
    pub fn gpa_end(&self) -> u64 {
        self.gpa_base + self.len as u64
    }

    /// Checked translation to a host pointer with the storage's provenance.
    fn host_ptr(&self, addr: u64, len: usize) -> Result<*mut u8> {
        let Some(off) = addr.checked_sub(self.gpa_base) else {
            bail!("address {addr:#x} below guest memory base {:#x}", self.gpa_base);
        };
        let off = off as usize;
        match off.checked_add(len) {
            Some(end) if end <= self.len => {}
            _ => bail!("access {addr:#x}+{len} past end of guest memory"),
        }

        // SAFETY: offset checked to lie within the allocation above
        let base = unsafe { (*self.storage.get()).as_mut_ptr().cast::<u8>() };
        Ok(base.wrapping_add(off))
    }

    fn atomic_u16(&self, addr: u64) -> Result<&AtomicU16> {
        if !addr.is_multiple_of(2) {
            bail!("unaligned u16 atomic at {addr:#x}");
        }
        let ptr = self.host_ptr(addr, 2)?.cast::<AtomicU16>();
        // SAFETY: in bounds, 2-byte aligned, and lives as long as self
        Ok(unsafe { &*ptr })
    }

    /// Copy `data` in at `addr`.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.write(addr, data).map(|_| ())
    }

    /// Copy `len` bytes out from `addr`.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(addr, &mut out)?;
        Ok(out)
    }
}

impl MemOps for GuestMemory {
    type Error = anyhow::Error;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize> {
        let src = self.host_ptr(addr, dst.len())?;
        // SAFETY: src is valid for dst.len() bytes, and dst is a distinct buffer
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize> {
        let dst = self.host_ptr(addr, src.len())?;
        // SAFETY: dst is valid for src.len() bytes, and src is a distinct buffer
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn read_val<T: Pod>(&self, addr: u64) -> Result<T> {
        let ptr = self.host_ptr(addr, size_of::<T>())?.cast::<T>();
        // SAFETY: in bounds; T is Pod so any bit pattern is valid
        Ok(unsafe { ptr::read_unaligned(ptr) })
    }

    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<()> {
        let ptr = self.host_ptr(addr, size_of::<T>())?.cast::<T>();
        // SAFETY: in bounds; T is Pod
        unsafe { ptr::write_unaligned(ptr, val) };
        Ok(())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16> {
        Ok(self.atomic_u16(addr)?.load(Ordering::Acquire))
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<()> {
        self.atomic_u16(addr)?.store(val, Ordering::Release);
        Ok(())
    }
}
