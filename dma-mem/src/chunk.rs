// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{DmaWords, PhysAddr};

/// A physically contiguous block of zero-initialized memory that may be handed to a device.
///
/// A `DmaChunk` is never freed on drop: devices may still hold its physical address, so the
/// memory is leaked unless it is explicitly returned with `DmaAllocator::free`.
#[derive(Debug)]
pub struct DmaChunk {
    virt: NonNull<u8>,
    phys: PhysAddr,
    size: usize,
    align: usize,
}

// Safety: A `DmaChunk` uniquely owns its memory, which is only accessed through atomic views.
unsafe impl Send for DmaChunk {}
unsafe impl Sync for DmaChunk {}

impl DmaChunk {
    /// Creates a chunk from its raw parts.
    ///
    /// # Safety
    ///
    /// `virt` must point to `size` bytes of initialized memory, aligned to `align`, that is
    /// mapped at `phys` for devices and is uniquely owned by the returned chunk.
    pub unsafe fn from_raw_parts(
        virt: NonNull<u8>,
        phys: PhysAddr,
        size: usize,
        align: usize,
    ) -> Self {
        Self {
            virt,
            phys,
            size,
            align,
        }
    }

    /// Returns the address devices use to access this chunk.
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// Returns the size of this chunk in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the alignment this chunk was allocated with.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Returns the CPU pointer to the start of this chunk.
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Returns a word-granular view of this chunk.
    pub fn words(&self) -> DmaWords<'_> {
        assert!(self.align >= size_of::<u64>());
        // Safety: The chunk is 8-byte aligned, uniquely owned and lives at least as long as the
        // returned view. All accesses through the view are atomic.
        unsafe {
            DmaWords::from_raw(
                self.virt.as_ptr() as *mut u64,
                self.size / size_of::<u64>(),
                self.phys,
            )
        }
    }
}

/// Source of memory that is accessible by DMA.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` bytes of zeroed memory aligned to `align`. Returns `None` if the memory
    /// couldn't be allocated.
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<DmaChunk>;

    /// Returns `chunk` to the allocator. The caller must ensure no device still accesses it.
    fn free(&self, chunk: DmaChunk);
}

/// A `DmaAllocator` for hosted environments where physical and virtual addresses coincide.
/// Keeps allocation statistics and optionally caps the number of bytes outstanding.
pub struct HeapDmaAllocator {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    outstanding: AtomicUsize,
    limit: usize,
}

impl HeapDmaAllocator {
    /// Creates an allocator without a size limit.
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Creates an allocator that fails allocations once `limit` bytes are outstanding.
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            limit,
        }
    }

    /// Returns the number of successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Returns the number of chunks returned so far.
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes currently allocated.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<DmaChunk> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        let prev = self.outstanding.fetch_add(size, Ordering::Relaxed);
        if prev.checked_add(size).map_or(true, |total| total > self.limit) {
            self.outstanding.fetch_sub(size, Ordering::Relaxed);
            log::debug!("DMA allocation of {size:#x} bytes exceeds limit");
            return None;
        }
        // Safety: `layout` has a non-zero size.
        let Some(virt) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
            self.outstanding.fetch_sub(size, Ordering::Relaxed);
            return None;
        };
        self.allocations.fetch_add(1, Ordering::Relaxed);
        // Safety: The memory was just allocated with `layout` and is identity mapped.
        let phys = PhysAddr::new(virt.as_ptr() as u64);
        Some(unsafe { DmaChunk::from_raw_parts(virt, phys, size, align) })
    }

    fn free(&self, chunk: DmaChunk) {
        // Unwrap ok: the layout was validated when the chunk was allocated.
        let layout = Layout::from_size_align(chunk.size(), chunk.align()).unwrap();
        self.outstanding.fetch_sub(chunk.size(), Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
        // Safety: Chunks handed out by this allocator come from `alloc_zeroed` with this layout.
        unsafe { dealloc(chunk.as_ptr(), layout) };
    }
}
