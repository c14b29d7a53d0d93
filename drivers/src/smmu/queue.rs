// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::marker::PhantomData;
use core::mem::size_of;
use dma_mem::fence::{dma_rmb, mmio_wmb};
use dma_mem::{Coherency, DmaAllocator, DmaChunk, DmaWords, PhysAddr};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::LocalRegisterCopy;

use super::error::*;
use super::registers::{QueueBase, QueueIndex, QueueIndexRegisters};

/// An entry of an SMMU queue, stored as a power-of-two number of 64-bit words.
pub trait QueueItem: Copy {
    /// Size of the entry in 64-bit words.
    const WORDS: usize;

    /// Stores the entry to `slot`.
    fn write_to(&self, slot: &DmaWords);

    /// Loads an entry from `slot`.
    fn read_from(slot: &DmaWords) -> Self;
}

/// Type marker for a queue where software is the producer.
pub enum Producer {}
/// Type marker for a queue where software is the consumer.
pub enum Consumer {}

/// The side of a queue software is on.
pub trait QueueDirection {
    /// Reads the index maintained by the hardware side of the queue.
    fn peer_index(regs: &QueueIndexRegisters) -> u32;
}

impl QueueDirection for Producer {
    fn peer_index(regs: &QueueIndexRegisters) -> u32 {
        regs.cons.read(QueueIndex::Index)
    }
}

impl QueueDirection for Consumer {
    fn peer_index(regs: &QueueIndexRegisters) -> u32 {
        regs.prod.read(QueueIndex::Index)
    }
}

/// Token returned when writing to a producer queue, used to wait for the hardware to consume
/// the entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WaitToken(u64);

/// Error the SMMU reports in the consumer index when it stops processing a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerError {
    /// The command at the consumer index is malformed or unknown.
    Illegal,
    /// Fetching the command from memory aborted.
    Abort,
    /// An ATC invalidation timed out ahead of a sync.
    AtcInvSync,
    /// An error code we don't know about.
    Unknown(u32),
}

/// An SMMU queue, used to communicate between software and the SMMU hardware. The queue is a
/// naturally aligned ring buffer of `2^bits` uniformly-sized entries.
///
/// The hardware indices carry the ring index plus a wrap flag in the bit above it. We keep a
/// 64-bit logical index on our side that is never truncated, so the number of entries written
/// since any past point is always known exactly.
pub struct Queue<T: QueueItem, D> {
    mem: DmaChunk,
    regs: &'static QueueIndexRegisters,
    bits: u32,
    index: u64,
    overflow_ack: bool,
    coherency: Coherency,
    _item_type: PhantomData<T>,
    _direction: PhantomData<D>,
}

impl<T: QueueItem, D: QueueDirection> Queue<T, D> {
    /// Creates a queue of `2^bits` entries in memory from `allocator`, indexed through `regs`.
    pub fn new(
        allocator: &dyn DmaAllocator,
        bits: u32,
        regs: &'static QueueIndexRegisters,
        coherency: Coherency,
    ) -> Result<Self> {
        let item_size = T::WORDS * size_of::<u64>();
        assert!(item_size.is_power_of_two());
        let size = item_size << bits;
        // Queues are aligned to their size, and to at least 32 bytes.
        let mem = allocator
            .alloc_zeroed(size, size.max(32))
            .ok_or(Error::OutOfMemory)?;
        mem.words().publish(coherency);
        regs.prod.set(0);
        regs.cons.set(0);
        Ok(Self {
            mem,
            regs,
            bits,
            index: 0,
            overflow_ack: false,
            coherency,
            _item_type: PhantomData,
            _direction: PhantomData,
        })
    }

    /// Returns the base physical address of this queue.
    pub fn base_address(&self) -> PhysAddr {
        self.mem.phys_addr()
    }

    /// Returns the value to program into the queue's base register.
    pub fn base_register(&self) -> u64 {
        let mut base = LocalRegisterCopy::<u64, QueueBase::Register>::new(0);
        base.modify(QueueBase::Log2Size.val(self.bits as u64));
        base.modify(QueueBase::Addr.val(self.base_address().bits() >> 5));
        base.modify(QueueBase::Ra::SET);
        base.get()
    }

    /// Returns the total number of entries that can be held in the queue.
    pub fn capacity(&self) -> usize {
        1 << self.bits
    }

    /// Returns if the queue is full.
    pub fn is_full(&self) -> bool {
        self.hw_index() ^ self.peer_index() == self.wrap_flag()
    }

    fn wrap_flag(&self) -> u32 {
        1 << self.bits
    }

    // Mask covering the ring index and the wrap flag.
    fn index_mask(&self) -> u32 {
        (self.wrap_flag() << 1) - 1
    }

    fn hw_index(&self) -> u32 {
        (self.index as u32) & self.index_mask()
    }

    fn peer_index(&self) -> u32 {
        D::peer_index(self.regs) & self.index_mask()
    }

    fn slot(&self, index: u64) -> DmaWords<'_> {
        let ring_index = (index as usize) & (self.capacity() - 1);
        self.mem.words().subslice(ring_index * T::WORDS, T::WORDS)
    }
}

impl<T: QueueItem> Queue<T, Producer> {
    /// Writes `item` at the tail of the queue and rings the doorbell. Fails with `QueueFull` if
    /// the hardware hasn't consumed enough entries yet; it's up to the caller to back off.
    pub fn write(&mut self, item: T) -> Result<WaitToken> {
        if self.is_full() {
            return Err(Error::QueueFull);
        }
        let slot = self.slot(self.index);
        item.write_to(&slot);
        slot.publish_before_doorbell(self.coherency);
        self.index += 1;
        // Make sure the entry is visible before the SMMU sees the new producer index.
        mmio_wmb();
        self.regs.prod.write(QueueIndex::Index.val(self.hw_index()));
        Ok(WaitToken(self.index))
    }

    /// Returns if the entry `token` was returned for has been consumed by the hardware.
    pub fn is_complete(&self, token: WaitToken) -> bool {
        // The slot was reused since, which requires the hardware to have consumed it.
        if self.index - token.0 >= self.capacity() as u64 {
            return true;
        }
        let read = self.peer_index();
        let wait = (token.0 as u32) & self.index_mask();
        let ring_mask = self.wrap_flag() - 1;
        if wait & self.wrap_flag() == read & self.wrap_flag() {
            read >= wait
        } else {
            // The reader is a lap ahead of or behind the token.
            wait & ring_mask > read & ring_mask
        }
    }

    /// Returns the error that stopped the hardware from consuming entries, if any.
    pub fn consumer_error(&self) -> Option<ConsumerError> {
        use QueueIndex::CmdError::Value;
        let raw = self.regs.cons.read(QueueIndex::CmdError);
        match self.regs.cons.read_as_enum(QueueIndex::CmdError) {
            Some(Value::NoError) => None,
            Some(Value::Illegal) => Some(ConsumerError::Illegal),
            Some(Value::Abort) => Some(ConsumerError::Abort),
            Some(Value::AtcInvSync) => Some(ConsumerError::AtcInvSync),
            None => Some(ConsumerError::Unknown(raw)),
        }
    }

    /// Overwrites the entry at the hardware's consumer index with `item`.
    pub fn replace_at_consumer(&mut self, item: T) {
        let slot = self.slot(self.peer_index() as u64);
        item.write_to(&slot);
        slot.publish(self.coherency);
    }
}

impl<T: QueueItem> Queue<T, Consumer> {
    /// Pops the entry at the head of the queue. Calls `on_overflow` if the hardware reported a
    /// queue overflow since the last read, which means entries were lost.
    pub fn read(&mut self, mut on_overflow: impl FnMut()) -> Option<T> {
        let prod = self.regs.prod.extract();
        if self.hw_index() == prod.read(QueueIndex::Index) & self.index_mask() {
            return None;
        }
        // Don't read the entry before the producer index that covers it.
        dma_rmb();
        let item = T::read_from(&self.slot(self.index));
        self.index += 1;
        let overflow = prod.is_set(QueueIndex::Overflow);
        if overflow != self.overflow_ack {
            self.overflow_ack = overflow;
            on_overflow();
        }
        self.regs.cons.write(
            QueueIndex::Index.val(self.hw_index())
                + QueueIndex::Overflow.val(self.overflow_ack as u32),
        );
        Some(item)
    }
}
