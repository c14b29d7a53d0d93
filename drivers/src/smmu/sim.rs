// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! A simulated SMMU for tests. Register pages live in leaked heap memory and a background thread
//! plays the hardware side: it acknowledges CR0 and IRQ_CTRL writes, consumes the command queue
//! and reports illegal commands the way the real thing does.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use dma_mem::HeapDmaAllocator;
use spin::Mutex;
use std::thread::JoinHandle;

use super::command::{Command, Opcode};
use super::config::SmmuConfig;
use super::core::Smmu;
use super::registers::{SmmuMmio, PAGE1_OFFSET};
use super::registry::{SmmuIndex, SmmuRegistry};

const MMIO_SIZE: usize = 2 * PAGE1_OFFSET;

const IDR0: usize = 0x0;
const IDR1: usize = 0x4;
const IDR5: usize = 0x14;
const CR0: usize = 0x20;
const CR0ACK: usize = 0x24;
const IRQ_CTRL: usize = 0x50;
const IRQ_CTRLACK: usize = 0x54;
const GERROR: usize = 0x60;
const GERRORN: usize = 0x64;
const CMDQ_BASE: usize = 0x90;
const CMDQ_PROD: usize = 0x98;
const CMDQ_CONS: usize = 0x9c;
const EVENTQ_BASE: usize = 0xa0;
const EVENTQ_PROD: usize = PAGE1_OFFSET + 0xa8;
const EVENTQ_CONS: usize = PAGE1_OFFSET + 0xac;

const CR0_CMDQEN: u32 = 1 << 3;
const GERROR_CMDQ_ERR: u32 = 1;
const CONS_ERR_SHIFT: u32 = 24;
const CONS_ERR_ILLEGAL: u32 = 1;
const QUEUE_ADDR_MASK: u64 = ((1 << 47) - 1) << 5;

/// A leaked, zeroed register space accessed the way the SMMU would.
#[derive(Clone, Copy)]
struct RegisterSpace {
    base: *mut u8,
}

unsafe impl Send for RegisterSpace {}
unsafe impl Sync for RegisterSpace {}

impl RegisterSpace {
    fn new() -> Self {
        let mem = Box::leak(vec![0u64; MMIO_SIZE / 8].into_boxed_slice());
        Self {
            base: mem.as_mut_ptr() as *mut u8,
        }
    }

    fn reg32(&self, offset: usize) -> &AtomicU32 {
        // Not safe - just a test
        unsafe { &*(self.base.add(offset) as *const AtomicU32) }
    }

    fn reg64(&self, offset: usize) -> &AtomicU64 {
        // Not safe - just a test
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    fn read32(&self, offset: usize) -> u32 {
        self.reg32(offset).load(Ordering::SeqCst)
    }

    fn write32(&self, offset: usize, val: u32) {
        self.reg32(offset).store(val, Ordering::SeqCst)
    }

    fn read64(&self, offset: usize) -> u64 {
        self.reg64(offset).load(Ordering::SeqCst)
    }
}

// Queue memory is identity mapped by `HeapDmaAllocator`.
fn queue_word(base: u64, index: usize) -> &'static AtomicU64 {
    // Not safe - just a test
    unsafe { &*((base as *const AtomicU64).add(index)) }
}

struct SimState {
    regs: RegisterSpace,
    commands: Mutex<Vec<Command>>,
    stop: AtomicBool,
}

impl SimState {
    // One pass of the hardware side. Returns once there's nothing left to do.
    fn step(&self) {
        let regs = &self.regs;
        regs.write32(CR0ACK, regs.read32(CR0));
        regs.write32(IRQ_CTRLACK, regs.read32(IRQ_CTRL));
        if regs.read32(CR0) & CR0_CMDQEN == 0 {
            return;
        }
        // Command processing stops until software acknowledges the error.
        if (regs.read32(GERROR) ^ regs.read32(GERRORN)) & GERROR_CMDQ_ERR != 0 {
            return;
        }

        let base = regs.read64(CMDQ_BASE);
        let bits = (base & 0x1f) as u32;
        let addr = base & QUEUE_ADDR_MASK;
        let index_mask = (2u32 << bits) - 1;
        let ring_mask = (1u32 << bits) - 1;
        let prod = regs.read32(CMDQ_PROD) & index_mask;
        let mut cons = regs.read32(CMDQ_CONS) & index_mask;
        while cons != prod {
            let slot = (cons & ring_mask) as usize;
            let words = [
                queue_word(addr, slot * 2).load(Ordering::SeqCst),
                queue_word(addr, slot * 2 + 1).load(Ordering::SeqCst),
            ];
            let cmd = Command::from_raw(words);
            if cmd.opcode().is_none() {
                regs.write32(CMDQ_CONS, cons | (CONS_ERR_ILLEGAL << CONS_ERR_SHIFT));
                regs.write32(GERROR, regs.read32(GERROR) ^ GERROR_CMDQ_ERR);
                return;
            }
            self.commands.lock().push(cmd);
            cons = (cons + 1) & index_mask;
            regs.write32(CMDQ_CONS, cons);
        }
    }
}

/// Builds a `SimSmmu` with non-default ID registers.
pub struct SimSmmuBuilder {
    stage1: bool,
    stage2: bool,
    table_format: u32,
    stall_forced: bool,
    preset_tables: bool,
    two_level: bool,
    tag_bits: u32,
    sid_bits: u32,
    oas: u32,
}

impl SimSmmuBuilder {
    pub fn stages(mut self, stage1: bool, stage2: bool) -> Self {
        self.stage1 = stage1;
        self.stage2 = stage2;
        self
    }

    pub fn table_format(mut self, ttf: u32) -> Self {
        self.table_format = ttf;
        self
    }

    pub fn stall_forced(mut self) -> Self {
        self.stall_forced = true;
        self
    }

    pub fn preset_tables(mut self) -> Self {
        self.preset_tables = true;
        self
    }

    pub fn linear_only(mut self) -> Self {
        self.two_level = false;
        self
    }

    pub fn tag_bits(mut self, bits: u32) -> Self {
        self.tag_bits = bits;
        self
    }

    pub fn sid_bits(mut self, bits: u32) -> Self {
        self.sid_bits = bits;
        self
    }

    /// Sets the IDR5.OAS encoding.
    pub fn oas(mut self, encoding: u32) -> Self {
        self.oas = encoding;
        self
    }

    pub fn build(self) -> SimSmmu {
        let regs = RegisterSpace::new();
        let tag16 = self.tag_bits == 16;
        let idr0 = self.stage2 as u32
            | (self.stage1 as u32) << 1
            | self.table_format << 2
            // COHACC, BTM
            | 1 << 4
            | 1 << 5
            | (tag16 as u32) << 12
            // MSI
            | 1 << 13
            | (tag16 as u32) << 18
            | if self.stall_forced { 2 << 24 } else { 0 }
            | (self.two_level as u32) << 27;
        // 256-entry command and event queues.
        let idr1 = self.sid_bits | 8 << 16 | 8 << 21 | (self.preset_tables as u32) << 30;
        regs.write32(IDR0, idr0);
        regs.write32(IDR1, idr1);
        regs.write32(IDR5, self.oas | 1 << 4);

        let state = Arc::new(SimState {
            regs,
            commands: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });
        let hw = state.clone();
        let thread = std::thread::spawn(move || {
            while !hw.stop.load(Ordering::SeqCst) {
                hw.step();
                std::thread::yield_now();
            }
        });
        SimSmmu {
            state,
            thread: Some(thread),
        }
    }
}

/// A simulated SMMU.
pub struct SimSmmu {
    state: Arc<SimState>,
    thread: Option<JoinHandle<()>>,
}

impl SimSmmu {
    /// Creates an SMMU supporting both stages, 16-bit tags, 16 stream ID bits, two-level stream
    /// tables and a 48-bit OAS.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SimSmmuBuilder {
        SimSmmuBuilder {
            stage1: true,
            stage2: true,
            table_format: 2,
            stall_forced: false,
            preset_tables: false,
            two_level: true,
            tag_bits: 16,
            sid_bits: 16,
            oas: 5,
        }
    }

    pub fn mmio(&self) -> SmmuMmio {
        // Not safe - just a test
        unsafe { SmmuMmio::from_base(self.state.regs.base) }
    }

    /// Returns the commands consumed so far.
    pub fn commands(&self) -> Vec<Command> {
        self.state.commands.lock().clone()
    }

    pub fn clear_commands(&self) {
        self.state.commands.lock().clear();
    }

    /// Returns the number of consumed commands with opcode `op`.
    pub fn count(&self, op: Opcode) -> usize {
        self.state
            .commands
            .lock()
            .iter()
            .filter(|c| c.opcode() == Some(op))
            .count()
    }

    /// Appends a fault record of type `event_type` for `stream_id` to the event queue.
    pub fn push_event(&self, event_type: u8, stream_id: u32) {
        let regs = &self.state.regs;
        let base = regs.read64(EVENTQ_BASE);
        let bits = (base & 0x1f) as u32;
        let addr = base & QUEUE_ADDR_MASK;
        let index_mask = (2u32 << bits) - 1;
        let old = regs.read32(EVENTQ_PROD);
        let prod = old & index_mask;
        let slot = (prod & ((1 << bits) - 1)) as usize;
        queue_word(addr, slot * 4).store(
            event_type as u64 | (stream_id as u64) << 32,
            Ordering::SeqCst,
        );
        for i in 1..4 {
            queue_word(addr, slot * 4 + i).store(0, Ordering::SeqCst);
        }
        regs.write32(EVENTQ_PROD, (old & 1 << 31) | ((prod + 1) & index_mask));
    }

    /// Sets the event queue overflow flag, as if the SMMU had dropped records.
    pub fn overflow_events(&self) {
        let regs = &self.state.regs;
        regs.write32(EVENTQ_PROD, regs.read32(EVENTQ_PROD) ^ 1 << 31);
    }

    /// Returns the software consumer index of the event queue.
    pub fn event_consumer(&self) -> u32 {
        self.state.regs.read32(EVENTQ_CONS)
    }
}

impl Drop for SimSmmu {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Returns a leaked allocator for tests.
pub fn stub_allocator() -> &'static HeapDmaAllocator {
    Box::leak(Box::new(HeapDmaAllocator::new()))
}

/// A finalized registry holding one simulated SMMU.
pub struct TestSystem {
    pub smmu: Arc<Smmu>,
    pub registry: SmmuRegistry,
    pub allocator: &'static HeapDmaAllocator,
    pub sim: SimSmmu,
}

impl TestSystem {
    pub fn new(sim: SimSmmu, config: SmmuConfig) -> Self {
        let allocator = stub_allocator();
        let registry = SmmuRegistry::new(allocator);
        let index = registry.probe(sim.mmio(), config).unwrap();
        registry.finalize().unwrap();
        let smmu = registry.get(index).unwrap();
        assert_eq!(smmu.index(), SmmuIndex::new(0));
        Self {
            smmu,
            registry,
            allocator,
            sim,
        }
    }
}
