// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;
use dma_mem::{Coherency, DmaAllocator, DmaChunk, PhysAddr};
use spin::{Mutex, Once};
use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::domain::Domain;
use super::error::*;
use super::registers::{StrtabBase, StrtabBaseCfg};
use super::ste::{Ste, STE_WORDS};

register_bitfields![u64,
    L1Descriptor [
        // log2 of the number of STEs in the L2 block, plus one. Zero means invalid.
        Span OFFSET(0) NUMBITS(5),
        L2Ptr OFFSET(6) NUMBITS(46),
    ],
];

const STE_SIZE: usize = STE_WORDS * size_of::<u64>();

/// The stream ID. Identifies the device (or function) issuing a transaction and indexes the
/// stream table. For PCI devices this is typically the requester ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    /// Creates a `StreamId` from the raw `id`.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw bits of this `StreamId`.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Layout of a stream table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamTableFormat {
    /// A single array of STEs indexed by stream ID.
    Linear,
    /// An array of L1 descriptors pointing to lazily allocated blocks of STEs.
    TwoLevel,
}

/// A contiguous block of STEs along with their shadow owners.
pub struct SteBlock {
    mem: DmaChunk,
    first: StreamId,
    owners: Vec<Mutex<Option<Domain>>>,
    coherency: Coherency,
}

impl SteBlock {
    fn new(mem: DmaChunk, first: StreamId, len: usize, coherency: Coherency) -> Self {
        let mut owners = Vec::with_capacity(len);
        owners.resize_with(len, || Mutex::new(None));
        Self {
            mem,
            first,
            owners,
            coherency,
        }
    }

    /// Returns the stream ID of the first STE in the block.
    pub fn first_stream_id(&self) -> StreamId {
        self.first
    }

    /// Returns the number of STEs in the block.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns the STE at `offset` in the block.
    pub fn entry(&self, offset: usize) -> Ste<'_> {
        Ste::new(
            StreamId::new(self.first.bits() + offset as u32),
            self.mem.words().subslice(offset * STE_WORDS, STE_WORDS),
            &self.owners[offset],
            self.coherency,
        )
    }

    /// Returns an iterator over all STEs in the block.
    pub fn entries(&self) -> impl Iterator<Item = Ste<'_>> {
        (0..self.len()).map(move |i| self.entry(i))
    }
}

/// The stream table, mapping stream IDs to STEs.
///
/// In the linear format the whole table is allocated up front and `blocks` has a single,
/// always-present entry. In the two-level format `blocks` parallels the L1 descriptor array and
/// each block is allocated the first time an STE in its range is needed. Blocks are never freed
/// while the table is alive.
pub struct StreamTable {
    base: PhysAddr,
    sid_bits: u32,
    block_bits: u32,
    l1: Option<DmaChunk>,
    blocks: Vec<Once<SteBlock>>,
    // Number of L2 blocks allocated so far. Also serializes L2 allocation.
    l2_allocated: Mutex<usize>,
    l2_limit: usize,
    allocator: &'static dyn DmaAllocator,
    coherency: Coherency,
}

impl StreamTable {
    /// Creates a linear stream table covering `sid_bits` of stream ID.
    pub fn new_linear(
        allocator: &'static dyn DmaAllocator,
        sid_bits: u32,
        coherency: Coherency,
    ) -> Result<Self> {
        let len = 1usize << sid_bits;
        let size = len * STE_SIZE;
        let mem = allocator
            .alloc_zeroed(size, size)
            .ok_or(Error::OutOfMemory)?;
        mem.words().publish(coherency);
        let base = mem.phys_addr();
        let block = Once::initialized(SteBlock::new(mem, StreamId::new(0), len, coherency));
        Ok(Self {
            base,
            sid_bits,
            block_bits: sid_bits,
            l1: None,
            blocks: alloc::vec![block],
            l2_allocated: Mutex::new(0),
            l2_limit: 0,
            allocator,
            coherency,
        })
    }

    /// Creates a two-level stream table covering `sid_bits` of stream ID, with L2 blocks of
    /// `2^split` STEs. At most `l2_limit` L2 blocks will ever be allocated.
    pub fn new_two_level(
        allocator: &'static dyn DmaAllocator,
        sid_bits: u32,
        split: u32,
        l2_limit: usize,
        coherency: Coherency,
    ) -> Result<Self> {
        assert!(split <= sid_bits);
        let l1_len = 1usize << (sid_bits - split);
        let size = l1_len * size_of::<u64>();
        let l1 = allocator
            .alloc_zeroed(size, size.max(64))
            .ok_or(Error::OutOfMemory)?;
        l1.words().publish(coherency);
        let mut blocks = Vec::with_capacity(l1_len);
        blocks.resize_with(l1_len, Once::new);
        Ok(Self {
            base: l1.phys_addr(),
            sid_bits,
            block_bits: split,
            l1: Some(l1),
            blocks,
            l2_allocated: Mutex::new(0),
            l2_limit,
            allocator,
            coherency,
        })
    }

    /// Returns the layout of the table.
    pub fn format(&self) -> StreamTableFormat {
        if self.l1.is_some() {
            StreamTableFormat::TwoLevel
        } else {
            StreamTableFormat::Linear
        }
    }

    /// Returns the number of stream ID bits covered by the table.
    pub fn stream_id_bits(&self) -> u32 {
        self.sid_bits
    }

    /// Returns the number of stream ID bits resolved within one block.
    pub fn split(&self) -> u32 {
        self.block_bits
    }

    /// Returns the physical address the SMMU starts stream table walks at.
    pub fn base_address(&self) -> PhysAddr {
        self.base
    }

    /// Returns the values for the STRTAB_BASE and STRTAB_BASE_CFG registers.
    pub fn base_registers(&self) -> (u64, u32) {
        let mut base = LocalRegisterCopy::<u64, StrtabBase::Register>::new(0);
        base.modify(StrtabBase::Addr.val(self.base_address().bits() >> 6) + StrtabBase::Ra::SET);
        let mut cfg = LocalRegisterCopy::<u32, StrtabBaseCfg::Register>::new(0);
        cfg.modify(StrtabBaseCfg::Log2Size.val(self.sid_bits));
        match self.format() {
            StreamTableFormat::Linear => cfg.modify(StrtabBaseCfg::Fmt::Linear),
            StreamTableFormat::TwoLevel => cfg.modify(
                StrtabBaseCfg::Fmt::TwoLevel + StrtabBaseCfg::Split.val(self.block_bits),
            ),
        }
        (base.get(), cfg.get())
    }

    /// Validates `raw` against the stream ID width of the table.
    pub fn stream_id(&self, raw: u32) -> Result<StreamId> {
        if (raw as u64) < (1u64 << self.sid_bits) {
            Ok(StreamId::new(raw))
        } else {
            Err(Error::InvalidRange(raw))
        }
    }

    fn block_index(&self, id: StreamId) -> (usize, usize) {
        let bits = id.bits() as usize;
        (bits >> self.block_bits, bits & ((1 << self.block_bits) - 1))
    }

    /// Returns the STE for `id`, or `None` if its L2 block hasn't been allocated.
    pub fn entry(&self, id: StreamId) -> Option<Ste<'_>> {
        let (index, offset) = self.block_index(id);
        self.blocks
            .get(index)
            .and_then(Once::get)
            .map(|block| block.entry(offset))
    }

    /// Returns the STE for `id`, allocating its L2 block if needed.
    pub fn entry_or_alloc(&self, id: StreamId) -> Result<Ste<'_>> {
        if let Some(ste) = self.entry(id) {
            return Ok(ste);
        }
        let (index, offset) = self.block_index(id);
        let l1 = self.l1.as_ref().ok_or(Error::InvalidRange(id.bits()))?;
        let slot = self.blocks.get(index).ok_or(Error::InvalidRange(id.bits()))?;

        let mut allocated = self.l2_allocated.lock();
        if let Some(block) = slot.get() {
            return Ok(block.entry(offset));
        }
        if *allocated >= self.l2_limit {
            return Err(Error::StreamTableLimit);
        }
        let len = 1usize << self.block_bits;
        let size = len * STE_SIZE;
        let mem = self
            .allocator
            .alloc_zeroed(size, size)
            .ok_or(Error::OutOfMemory)?;
        *allocated += 1;
        // The zeroed block must be visible before the descriptor pointing to it.
        mem.words().publish(self.coherency);
        let mut desc = LocalRegisterCopy::<u64, L1Descriptor::Register>::new(0);
        desc.modify(
            L1Descriptor::Span.val(self.block_bits as u64 + 1)
                + L1Descriptor::L2Ptr.val(mem.phys_addr().bits() >> 6),
        );
        let first = StreamId::new((index << self.block_bits) as u32);
        let l1_words = l1.words();
        // A single 64-bit store, so the SMMU never sees a torn descriptor.
        l1_words.store(index, desc.get());
        l1_words
            .subslice(index, 1)
            .publish_before_doorbell(self.coherency);
        // Other CPUs only find the block once the descriptor is in place.
        let block = slot.call_once(|| SteBlock::new(mem, first, len, self.coherency));
        Ok(block.entry(offset))
    }

    /// Returns an iterator over all allocated blocks of STEs.
    pub fn blocks(&self) -> impl Iterator<Item = &SteBlock> {
        self.blocks.iter().filter_map(Once::get)
    }

    /// Returns the number of L2 blocks allocated so far.
    pub fn l2_blocks_allocated(&self) -> usize {
        *self.l2_allocated.lock()
    }
}
