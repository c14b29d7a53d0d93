// SPDX-FileCopyrightText: 2025 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Tag that separates one domain's translations from another's in the SMMU TLBs. An ASID with
/// stage 1 translation, a VMID with stage 2. Always at most 16 bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DomainTag(u16);

impl DomainTag {
    /// Creates a `DomainTag` from the raw `id`.
    pub(super) fn new(id: u16) -> Self {
        DomainTag(id)
    }

    /// Returns the raw bits of this `DomainTag`.
    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for DomainTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// Storage value for "no tag". One past the largest 16-bit tag.
const INVALID_TAG: u32 = 1 << 16;

/// Atomic storage for a lazily allocated `DomainTag`.
pub struct TagSlot(AtomicU32);

impl TagSlot {
    /// Creates an empty slot.
    pub const fn new() -> Self {
        Self(AtomicU32::new(INVALID_TAG))
    }

    /// Returns the tag held in the slot, if any.
    pub fn get(&self) -> Option<DomainTag> {
        to_tag(self.0.load(Ordering::Acquire))
    }
}

impl Default for TagSlot {
    fn default() -> Self {
        Self::new()
    }
}

fn to_tag(raw: u32) -> Option<DomainTag> {
    (raw < INVALID_TAG).then(|| DomainTag::new(raw as u16))
}

// We use a bitmap rather than a versioning scheme like we would for CPU ASIDs since reassigning
// tags on rollover would require us to stop DMA from every device, which is extremely
// disruptive. Running out of tags is therefore a hard allocation failure.

/// Lock-free allocator of `DomainTag`s in a fixed range, shared by all SMMUs and domains.
pub struct IdAllocator {
    bitmap: Vec<AtomicU64>,
    first: u32,
    count: u32,
}

impl IdAllocator {
    /// Creates an allocator handing out tags `first..=last`. `last` must fit in 16 bits.
    pub fn new(first: u32, last: u32) -> Self {
        assert!(first <= last && last < INVALID_TAG);
        let count = last - first + 1;
        let words = (count as usize + 63) / 64;
        let mut bitmap = Vec::with_capacity(words);
        bitmap.resize_with(words, || AtomicU64::new(0));
        Self {
            bitmap,
            first,
            count,
        }
    }

    /// Returns the number of tags this allocator manages.
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Allocates the lowest free tag. Returns `None` if all tags are in use.
    pub fn alloc(&self) -> Option<DomainTag> {
        for (w, word) in self.bitmap.iter().enumerate() {
            let mut cur = word.load(Ordering::Relaxed);
            loop {
                let bit = (!cur).trailing_zeros();
                let offset = w as u32 * 64 + bit;
                if bit == 64 || offset >= self.count {
                    break;
                }
                let mask = 1u64 << bit;
                let prev = word.fetch_or(mask, Ordering::AcqRel);
                if prev & mask == 0 {
                    return Some(DomainTag::new((self.first + offset) as u16));
                }
                cur = prev | mask;
            }
        }
        None
    }

    /// Returns `tag` to the allocator. Freeing an unallocated tag only logs a warning.
    pub fn free(&self, tag: DomainTag) {
        let Some(offset) = (tag.bits() as u32)
            .checked_sub(self.first)
            .filter(|&o| o < self.count)
        else {
            log::warn!("Freeing tag {tag} outside of the allocator range");
            return;
        };
        let mask = 1u64 << (offset % 64);
        let prev = self.bitmap[(offset / 64) as usize].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            log::warn!("Freeing tag {tag} which isn't allocated");
        }
    }

    /// Returns the tag stored in `slot`, allocating and storing a new one if the slot is empty.
    /// If another caller fills the slot concurrently, its tag wins and ours is freed.
    pub fn get_or_alloc(&self, slot: &TagSlot) -> Option<DomainTag> {
        if let Some(tag) = slot.get() {
            return Some(tag);
        }
        let tag = self.alloc()?;
        match slot.0.compare_exchange(
            INVALID_TAG,
            tag.bits() as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(tag),
            Err(winner) => {
                self.free(tag);
                to_tag(winner)
            }
        }
    }

    /// Empties `slot`, returning the tag it held. Only one of several racing callers gets the tag.
    pub fn reset_if_valid(&self, slot: &TagSlot) -> Option<DomainTag> {
        to_tag(slot.0.swap(INVALID_TAG, Ordering::AcqRel))
    }

    /// Empties `slot` and frees the tag it held, if any.
    pub fn free_if_valid(&self, slot: &TagSlot) {
        if let Some(tag) = self.reset_if_valid(slot) {
            self.free(tag);
        }
    }
}
