// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # DMA memory
//!
//! Memory that is shared between the CPU and a DMA-capable device such as an IOMMU.
//!
//! - `PhysAddr` is the address a device uses to reach a buffer.
//! - `DmaChunk` is a physically contiguous, zero-initialized buffer obtained from a
//!   `DmaAllocator`. Chunks are never freed implicitly; ownership returns to the allocator only
//!   through `DmaAllocator::free`.
//! - `DmaWords` views a chunk as an array of 64-bit words that are only ever accessed
//!   atomically, which is how hardware-visible tables are read and written.
//! - `fence` holds the barriers used to order those accesses against device observers.

#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod addr;
mod chunk;
/// Memory barriers ordering CPU accesses with respect to devices and other CPUs.
pub mod fence;
mod words;

pub use addr::PhysAddr;
pub use chunk::{DmaAllocator, DmaChunk, HeapDmaAllocator};
pub use words::{Coherency, DmaWords};
