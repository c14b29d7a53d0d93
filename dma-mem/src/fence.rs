// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use core::arch::asm;
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
use core::sync::atomic::{fence, Ordering};

// Data cache line size assumed for cache maintenance by virtual address.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const CACHE_LINE_SIZE: usize = 64;

// Safety: The barrier instructions below do not access memory; their only side-effect is to
// enforce ordering of surrounding load/store instructions with respect to the barrier.

/// Orders preceding memory stores with respect to succeeding memory stores, as observed by
/// devices in the outer-shareable domain.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn dma_wmb() {
    unsafe { asm!("dmb oshst", options(nostack, preserves_flags)) };
}

/// Orders preceding memory loads with respect to succeeding memory loads of device-written data.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn dma_rmb() {
    unsafe { asm!("dmb oshld", options(nostack, preserves_flags)) };
}

/// Orders preceding memory stores with respect to succeeding IO stores.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn mmio_wmb() {
    unsafe { asm!("dsb st", options(nostack, preserves_flags)) };
}

/// Orders preceding memory stores with respect to succeeding stores seen by other CPUs.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn smp_wmb() {
    unsafe { asm!("dmb ishst", options(nostack, preserves_flags)) };
}

/// Orders preceding memory loads with respect to succeeding loads of data written by other CPUs.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn smp_rmb() {
    unsafe { asm!("dmb ishld", options(nostack, preserves_flags)) };
}

/// Hint that the CPU's rate of instruction retirement should be temporarily paused or reduced.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn pause() {
    unsafe { asm!("yield", options(nomem, nostack, preserves_flags)) };
}

/// Waits for an event, e.g. one signalled by a device completing a command.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn wfe() {
    unsafe { asm!("wfe", options(nomem, nostack, preserves_flags)) };
}

/// Cleans the data cache lines covering `[addr, addr + len)` to the point of coherency so that a
/// non-coherent device observes the current contents.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn clean_dcache_range(addr: usize, len: usize) {
    let end = addr + len;
    let mut line = addr & !(CACHE_LINE_SIZE - 1);
    while line < end {
        // Safety: Cleaning a line writes back its contents without changing them.
        unsafe { asm!("dc cvac, {}", in(reg) line, options(nostack, preserves_flags)) };
        line += CACHE_LINE_SIZE;
    }
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
}

// In hosted builds the "device" is another thread, so fall back to atomic fences.
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn dma_wmb() {
    fence(Ordering::Release);
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn dma_rmb() {
    fence(Ordering::Acquire);
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn mmio_wmb() {
    fence(Ordering::SeqCst);
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn smp_wmb() {
    fence(Ordering::Release);
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn smp_rmb() {
    fence(Ordering::Acquire);
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn pause() {
    core::hint::spin_loop();
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn wfe() {
    core::hint::spin_loop();
}
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn clean_dcache_range(_addr: usize, _len: usize) {
    fence(Ordering::SeqCst);
}
