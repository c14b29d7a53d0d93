// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::mem::size_of;
use core::slice;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::fence::{clean_dcache_range, dma_wmb};
use crate::PhysAddr;

/// Whether a device snoops CPU caches when accessing memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coherency {
    /// Device accesses are cache coherent; a barrier suffices to publish stores.
    Coherent,
    /// Device accesses bypass CPU caches; stores must be cleaned to the point of coherency.
    NonCoherent,
}

/// A window of device-visible memory accessed as 64-bit words.
///
/// Every access is a single atomic 64-bit load or store so that neither the device nor another
/// CPU can observe a torn word. Ordering against the device is established explicitly with
/// `publish` and the barriers in `fence`.
#[derive(Clone, Copy)]
pub struct DmaWords<'a> {
    words: &'a [AtomicU64],
    phys: PhysAddr,
}

impl<'a> DmaWords<'a> {
    /// Creates a view of `len` words starting at `ptr`, which devices see at `phys`.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned and valid for reads and writes of `len` words for `'a`, and
    /// the memory must only be accessed atomically for that lifetime.
    pub unsafe fn from_raw(ptr: *mut u64, len: usize, phys: PhysAddr) -> Self {
        Self {
            words: slice::from_raw_parts(ptr as *const AtomicU64, len),
            phys,
        }
    }

    /// Returns the number of words in the view.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Returns true if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns the device address of the first word.
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// Returns the sub-view of `len` words starting at word `start`.
    pub fn subslice(&self, start: usize, len: usize) -> DmaWords<'a> {
        DmaWords {
            words: &self.words[start..start + len],
            phys: PhysAddr::new(self.phys.bits() + (start * size_of::<u64>()) as u64),
        }
    }

    /// Loads word `index`.
    pub fn load(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Acquire)
    }

    /// Stores `val` to word `index`.
    pub fn store(&self, index: usize, val: u64) {
        self.words[index].store(val, Ordering::Release)
    }

    /// Stores `new` to word `index` if it still holds `current`. Returns the previous value.
    pub fn compare_exchange(&self, index: usize, current: u64, new: u64) -> Result<u64, u64> {
        self.words[index].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Makes prior stores to the view observable by the device.
    pub fn publish(&self, coherency: Coherency) {
        match coherency {
            Coherency::Coherent => dma_wmb(),
            Coherency::NonCoherent => self.clean(),
        }
    }

    /// Makes prior stores to the view observable by the device ahead of a command submission.
    /// Submitting a command already orders memory on coherent systems, so only non-coherent
    /// systems need to do anything here.
    pub fn publish_before_doorbell(&self, coherency: Coherency) {
        if coherency == Coherency::NonCoherent {
            self.clean();
        }
    }

    fn clean(&self) {
        clean_dcache_range(
            self.words.as_ptr() as usize,
            self.words.len() * size_of::<u64>(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn stub_words(len: usize) -> DmaWords<'static> {
        let mem = Vec::leak(vec![0u64; len]);
        let phys = PhysAddr::new(mem.as_ptr() as u64);
        // Not safe - just a test.
        unsafe { DmaWords::from_raw(mem.as_mut_ptr(), len, phys) }
    }

    #[test]
    fn atomic_access() {
        let words = stub_words(8);
        words.store(3, 0x55);
        assert_eq!(words.load(3), 0x55);
        assert_eq!(words.compare_exchange(3, 0, 1), Err(0x55));
        assert_eq!(words.compare_exchange(3, 0x55, 1), Ok(0x55));
        assert_eq!(words.load(3), 1);
        assert!((0..8).filter(|&i| i != 3).all(|i| words.load(i) == 0));
        words.publish(Coherency::Coherent);
        words.publish(Coherency::NonCoherent);
    }

    #[test]
    fn subslice_addresses() {
        let words = stub_words(8);
        let sub = words.subslice(2, 4);
        assert_eq!(sub.len(), 4);
        assert_eq!(sub.phys_addr().bits(), words.phys_addr().bits() + 16);
        sub.store(0, 9);
        assert_eq!(words.load(2), 9);
    }
}
