// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::cmp::min;
use dma_mem::fence::{mmio_wmb, pause, wfe};
use dma_mem::{DmaAllocator, PhysAddr};
use spin::Mutex;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::LocalRegisterCopy;

use super::command::*;
use super::config::{SmmuConfig, SmmuFeatures, TranslationStage};
use super::context::ContextParams;
use super::domain::Domain;
use super::error::*;
use super::event::EventQueue;
use super::id_alloc::DomainTag;
use super::queue::{ConsumerError, WaitToken};
use super::registers::*;
use super::registry::SmmuIndex;
use super::ste::{Ownership, Ste, SteConfig, SteIdentity, SteState, STAGE1_VMID};
use super::stream_table::{StreamId, StreamTable};

/// An Arm SMMUv3. Translates DMA from the streams bound to a domain through that domain's page
/// table.
pub struct Smmu {
    index: SmmuIndex,
    regs: &'static SmmuRegisters,
    config: SmmuConfig,
    features: SmmuFeatures,
    stream_table: StreamTable,
    cmdq: Mutex<CommandQueue>,
    eventq: Option<Mutex<EventQueue>>,
    // Serializes invalidation of valid STEs.
    invalidate_lock: Mutex<()>,
}

// Smallest input address size a 4kB granule table can translate.
const MIN_INPUT_SIZE: u8 = 25;
// Largest SL0 encoding for a 4kB granule; the first level is then level 0.
const MAX_START_LEVEL: u8 = 2;

// Spins `poll_limit` times for `done` to become true.
fn wait_for_ack(poll_limit: u64, mut done: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..poll_limit {
        if done() {
            return Ok(());
        }
        pause();
    }
    Err(Error::AckTimeout)
}

impl Smmu {
    /// Initializes the SMMU with registers at `mmio` and enables translation. Tables and queues
    /// are allocated from `allocator`.
    pub fn probe(
        index: SmmuIndex,
        mmio: SmmuMmio,
        config: SmmuConfig,
        allocator: &'static dyn DmaAllocator,
    ) -> Result<Self> {
        let regs = mmio.page0;
        let features = SmmuFeatures::probe(regs, &config, index)?;
        let coherency = config.coherency;

        if features.msi {
            // We use wired interrupts.
            regs.gerror_irq_cfg0.set(0);
            regs.eventq_irq_cfg0.set(0);
        }

        let eventq = if config.log_faults {
            let queue =
                EventQueue::new(allocator, features.eventq_bits, &mmio.page1.eventq, coherency)?;
            regs.eventq_base.set(queue.base_register());
            Some(Mutex::new(queue))
        } else {
            None
        };
        regs.irq_ctrl.write(
            IrqCtrl::GerrorIrqEn::SET + IrqCtrl::EventqIrqEn.val(config.log_faults as u32),
        );
        wait_for_ack(config.poll_limit, || {
            regs.irq_ctrlack.get() == regs.irq_ctrl.get()
        })?;

        regs.cr1.write(
            Cr1::QueueIc::WriteBack
                + Cr1::QueueOc::WriteBack
                + Cr1::QueueSh::InnerShareable
                + Cr1::TableIc::WriteBack
                + Cr1::TableOc::WriteBack
                + Cr1::TableSh::InnerShareable,
        );

        let stream_table = Self::new_stream_table(index, &config, &features, allocator)?;
        let (base, base_cfg) = stream_table.base_registers();
        regs.strtab_base.set(base);
        regs.strtab_base_cfg.set(base_cfg);

        let cmdq = CommandQueue::new(allocator, features.cmdq_bits, &regs.cmdq, coherency)?;
        regs.cmdq_base.set(cmdq.base_register());

        if features.btm {
            // Don't take part in broadcast TLB maintenance; the CPUs' TLBIs never target DMA
            // address spaces.
            regs.cr2.modify(Cr2::Ptm::SET);
        }

        // Tables and queues must be in place before the SMMU starts using them.
        mmio_wmb();
        regs.cr0.write(
            Cr0::SmmuEn::SET + Cr0::CmdqEn::SET + Cr0::EventqEn.val(config.log_faults as u32),
        );
        wait_for_ack(config.poll_limit, || regs.cr0ack.get() == regs.cr0.get())?;

        let smmu = Self {
            index,
            regs,
            config,
            features,
            stream_table,
            cmdq: Mutex::new(cmdq),
            eventq,
            invalidate_lock: Mutex::new(()),
        };
        smmu.tlb_flush();
        log::info!(
            "SMMU{index}: enabled, {:?} stream table with {} stream ID bits, {}-bit OAS",
            smmu.stream_table.format(),
            smmu.stream_table.stream_id_bits(),
            smmu.features.oas
        );
        Ok(smmu)
    }

    fn new_stream_table(
        index: SmmuIndex,
        config: &SmmuConfig,
        features: &SmmuFeatures,
        allocator: &'static dyn DmaAllocator,
    ) -> Result<StreamTable> {
        let mut sid_bits = features.stream_id_bits;
        if !features.two_level || sid_bits <= config.linear_max_bits {
            return StreamTable::new_linear(allocator, sid_bits, config.coherency);
        }
        if sid_bits > config.stream_table_max_bits {
            log::warn!(
                "SMMU{index}: limiting stream table to {} of {sid_bits} stream ID bits",
                config.stream_table_max_bits
            );
            sid_bits = config.stream_table_max_bits;
        }
        StreamTable::new_two_level(
            allocator,
            sid_bits,
            min(config.stream_table_split, sid_bits),
            config.l2_alloc_limit,
            config.coherency,
        )
    }

    /// Returns the index of this SMMU in the registry.
    pub fn index(&self) -> SmmuIndex {
        self.index
    }

    /// Returns the hardware features found at probe time.
    pub fn features(&self) -> &SmmuFeatures {
        &self.features
    }

    /// Returns the configuration this SMMU was probed with.
    pub fn config(&self) -> &SmmuConfig {
        &self.config
    }

    /// Returns the stream table.
    pub fn stream_table(&self) -> &StreamTable {
        &self.stream_table
    }

    /// Returns the state of the STE for `stream_id`, or `None` if it's out of range or not
    /// allocated.
    pub fn stream_state(&self, stream_id: u32) -> Option<SteState> {
        let id = self.stream_table.stream_id(stream_id).ok()?;
        self.stream_table.entry(id).map(|ste| ste.state())
    }

    /// Binds `stream_id` to `domain`, translating its DMA through the page table at `root`.
    /// `input_size` is the input address size of the page table in bits and `start_level` the
    /// SL0 encoding of its first level; the latter is only used for stage 2 translation.
    ///
    /// A stream that is currently bound to another domain is switched over. Fails with `Busy`
    /// if a concurrent bind or unbind of the same stream is in progress. In stage 1 mode all
    /// streams of a domain share its context descriptor, so they must use the same `root`.
    pub fn bind(
        &self,
        stream_id: u32,
        domain: &Domain,
        root: PhysAddr,
        input_size: u8,
        start_level: u8,
    ) -> Result<()> {
        let id = self.stream_table.stream_id(stream_id)?;
        self.check_table_params(input_size, start_level)?;
        let ste = self.stream_table.entry_or_alloc(id)?;
        let tag = domain.get_or_alloc_tag()?;
        let config = self.ste_config(domain, tag, root, input_size, start_level)?;

        // Count the binding before the STE points at the domain so that TLB flushes for the
        // domain include this SMMU from now on.
        domain.add_binding(self.index)?;
        match ste.acquire(&self.invalidate_lock) {
            Ownership::Busy => {
                domain.del_binding(self.index);
                return Err(Error::Busy(stream_id));
            }
            Ownership::Invalidated => {
                self.flush_ste(id);
                if let Some(previous) = ste.take_owner() {
                    self.drop_binding(&previous);
                }
            }
            Ownership::Acquired => (),
        }
        ste.set_owner(domain.clone());
        self.configure(&ste, &config);
        // Publish the new STE to `remove()` callers that check the binding count without
        // locking.
        domain.sync_with_domain_state();
        log::debug!("SMMU{}: bound stream {id} to {domain:?}", self.index);
        Ok(())
    }

    /// Unbinds `stream_id` if it is bound to `domain` through the page table at `root`. Anything
    /// else, including a stream ID that's out of range, is a no-op.
    pub fn unbind(&self, stream_id: u32, domain: &Domain, root: PhysAddr) -> Result<()> {
        let Ok(id) = self.stream_table.stream_id(stream_id) else {
            return Ok(());
        };
        let (Some(ste), Some(identity)) = (self.stream_table.entry(id), self.identity(domain, root))
        else {
            return Ok(());
        };
        if ste.acquire_if_bound(&self.invalidate_lock, identity).is_ok() {
            self.deconfigure(&ste, domain);
            log::debug!("SMMU{}: unbound stream {id} from {domain:?}", self.index);
        }
        Ok(())
    }

    /// Unbinds all streams bound to `domain` through the page table at `root` and flushes the
    /// domain's TLB entries.
    ///
    /// Bindings made concurrently with the call may be missed.
    pub fn remove(&self, domain: &Domain, root: PhysAddr) {
        domain.sync_with_domain_state();
        if !domain.is_bound(self.index) {
            return;
        }
        if let Some(identity) = self.identity(domain, root) {
            'scan: for block in self.stream_table.blocks() {
                for ste in block.entries() {
                    if !ste.references(identity)
                        || ste
                            .acquire_if_bound(&self.invalidate_lock, identity)
                            .is_err()
                    {
                        continue;
                    }
                    if self.deconfigure(&ste, domain) == 0 {
                        break 'scan;
                    }
                }
            }
        }
        // The binding count may be off from what the scan saw, so always flush.
        self.tlb_invalidate_tag(domain.tag());
    }

    /// Invalidates all TLB entries.
    pub fn tlb_flush(&self) {
        self.send_cmd_sync(Command::tlbi_nsnh_all());
    }

    /// Invalidates all TLB entries tagged with `tag`.
    pub fn tlb_invalidate_tag(&self, tag: Option<DomainTag>) {
        let Some(tag) = tag else {
            return;
        };
        let cmd = match self.config.stage {
            TranslationStage::Stage1 => Command::tlbi_nh_asid(STAGE1_VMID, tag),
            TranslationStage::Stage2 => Command::tlbi_s12_vmall(tag),
        };
        self.send_cmd_sync(cmd);
    }

    /// Logs and acknowledges active global errors. Returns the bits that were active.
    pub fn handle_global_errors(&self) -> u32 {
        let gerror = self.regs.gerror.get();
        let active = LocalRegisterCopy::<u32, Gerror::Register>::new(
            gerror ^ self.regs.gerrorn.get(),
        );
        if active.get() == 0 {
            return 0;
        }
        if active.is_set(Gerror::CmdqErr) {
            let mut cmdq = self.cmdq.lock();
            self.recover_cmdq(&mut cmdq);
        }
        for (field, name) in [
            (Gerror::EventqAbtErr, "event queue access aborted"),
            (Gerror::PriqAbtErr, "PRI queue access aborted"),
            (Gerror::MsiCmdqAbtErr, "command queue MSI aborted"),
            (Gerror::MsiEventqAbtErr, "event queue MSI aborted"),
            (Gerror::MsiPriqAbtErr, "PRI queue MSI aborted"),
            (Gerror::MsiGerrorAbtErr, "GERROR MSI aborted"),
            (Gerror::SfmErr, "entered service failure mode"),
            (Gerror::CmdqpErr, "command queue control page error"),
        ] {
            if active.is_set(field) {
                log::warn!("SMMU{}: {name}", self.index);
            }
        }
        self.regs.gerrorn.set(gerror);
        active.get()
    }

    /// Logs all pending fault records. Returns the number of records read.
    pub fn handle_events(&self) -> usize {
        let Some(eventq) = self.eventq.as_ref() else {
            return 0;
        };
        let mut eventq = eventq.lock();
        let mut count = 0;
        while let Some(event) =
            eventq.read(|| log::warn!("SMMU{}: event queue overflow", self.index))
        {
            log::info!("SMMU{}: {event:?}", self.index);
            count += 1;
        }
        count
    }

    fn ste_config(
        &self,
        domain: &Domain,
        tag: DomainTag,
        root: PhysAddr,
        input_size: u8,
        start_level: u8,
    ) -> Result<SteConfig> {
        let config = match self.config.stage {
            TranslationStage::Stage1 => {
                let params = ContextParams {
                    root,
                    input_size,
                    ias: self.features.ias,
                    asid: tag,
                    record_faults: self.config.log_faults,
                };
                let cd = domain.get_or_alloc_context(&params, self.config.coherency)?;
                if cd.root() != root {
                    return Err(Error::InvalidState);
                }
                SteConfig::Stage1 { cd: cd.phys_addr() }
            }
            TranslationStage::Stage2 => SteConfig::Stage2 {
                vmid: tag,
                root,
                input_size,
                start_level,
                output_size: self.features.oas,
                record_faults: self.config.log_faults,
            },
        };
        Ok(config)
    }

    fn check_table_params(&self, input_size: u8, start_level: u8) -> Result<()> {
        if !(MIN_INPUT_SIZE..=self.features.ias).contains(&input_size) {
            return Err(Error::InvalidAddressSize(input_size));
        }
        if self.config.stage == TranslationStage::Stage2 && start_level > MAX_START_LEVEL {
            return Err(Error::InvalidStartLevel(start_level));
        }
        Ok(())
    }

    // What an STE bound to `domain` through `root` points to.
    fn identity(&self, domain: &Domain, root: PhysAddr) -> Option<SteIdentity> {
        match self.config.stage {
            TranslationStage::Stage1 => domain
                .context_descriptor()
                .filter(|cd| cd.root() == root)
                .map(|cd| SteIdentity::ContextDescriptor(cd.phys_addr())),
            TranslationStage::Stage2 => Some(SteIdentity::TranslationTable(root)),
        }
    }

    // Fills in an exclusively owned STE and makes it valid.
    fn configure(&self, ste: &Ste, config: &SteConfig) {
        ste.write_config(config);
        // Drop any stale cached copy before the entry becomes valid, and make sure the valid
        // entry is in use once we return.
        self.flush_ste(ste.id());
        ste.set_valid();
        self.flush_ste(ste.id());
    }

    // Tears down an STE invalidated by `acquire_if_bound()`. Returns the number of bindings the
    // owner has left on this SMMU.
    fn deconfigure(&self, ste: &Ste, domain: &Domain) -> u32 {
        self.flush_ste(ste.id());
        let owner = ste.take_owner();
        ste.release();
        match owner {
            Some(owner) => self.drop_binding(&owner),
            None => {
                // Owners are recorded before an STE becomes valid.
                log::warn!(
                    "SMMU{}: stream {} had no owner, expected {domain:?}",
                    self.index,
                    ste.id()
                );
                domain.bindings(self.index)
            }
        }
    }

    // Drops a binding of `domain`, flushing its TLB entries with the last one.
    fn drop_binding(&self, domain: &Domain) -> u32 {
        let remaining = domain.del_binding(self.index);
        if remaining == 0 {
            self.tlb_invalidate_tag(domain.tag());
        }
        remaining
    }

    fn flush_ste(&self, id: StreamId) {
        self.send_cmd_sync(Command::cfgi_ste(id, true));
    }

    fn sync_signal(&self) -> CompletionSignal {
        if self.features.sev {
            CompletionSignal::Event
        } else {
            CompletionSignal::None
        }
    }

    // Submits `cmd` followed by a sync and waits for the SMMU to complete both.
    fn send_cmd_sync(&self, cmd: Command) {
        let token = {
            let mut cmdq = self.cmdq.lock();
            self.write_cmd(&mut cmdq, cmd);
            self.write_cmd(&mut cmdq, Command::sync(self.sync_signal()))
        };
        let mut polls = 0;
        loop {
            {
                let mut cmdq = self.cmdq.lock();
                if cmdq.is_complete(token) {
                    return;
                }
                self.recover_cmdq(&mut cmdq);
            }
            self.poll_wait(&mut polls, "command completion");
            if self.features.sev {
                wfe();
            } else {
                pause();
            }
        }
    }

    fn write_cmd(&self, cmdq: &mut CommandQueue, cmd: Command) -> WaitToken {
        let mut polls = 0;
        loop {
            match cmdq.write(cmd) {
                Ok(token) => return token,
                Err(_) => {
                    // Full; the SMMU may be stuck on a bad command.
                    self.recover_cmdq(cmdq);
                    self.poll_wait(&mut polls, "command queue space");
                    pause();
                }
            }
        }
    }

    // Warns once if a wait is taking unusually long. Never gives up: the queue state would be
    // out of sync with the hardware if we did.
    fn poll_wait(&self, polls: &mut u64, what: &str) {
        *polls += 1;
        if *polls == self.config.poll_limit {
            log::warn!(
                "SMMU{}: still waiting for {what} after {polls} polls",
                self.index
            );
        }
    }

    // Handles a pending CMDQ_ERR so the SMMU resumes consuming commands.
    fn recover_cmdq(&self, cmdq: &mut CommandQueue) {
        let gerror = self.regs.gerror.read(Gerror::CmdqErr);
        if gerror == self.regs.gerrorn.read(Gerror::CmdqErr) {
            return;
        }
        match cmdq.consumer_error() {
            Some(ConsumerError::Illegal) => {
                log::warn!(
                    "SMMU{}: illegal command, replacing it with a sync",
                    self.index
                );
                cmdq.replace_at_consumer(Command::sync(CompletionSignal::None));
            }
            Some(ConsumerError::Abort) => {
                // The SMMU retries the fetch once the error is acknowledged.
                log::warn!("SMMU{}: command fetch aborted", self.index);
            }
            Some(e) => log::warn!("SMMU{}: command queue error {e:?}", self.index),
            None => (),
        }
        self.regs.gerrorn.modify(Gerror::CmdqErr.val(gerror));
    }
}

// `Smmu` holds references to `UnsafeCell`s for register access. Access to these registers is
// guarded by the `Smmu` interface which allow them to be shared and sent between threads.
unsafe impl Send for Smmu {}
unsafe impl Sync for Smmu {}

#[cfg(test)]
mod tests {
    use super::super::event::EventType;
    use super::super::sim::*;
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};
    use dma_mem::Coherency;

    fn stage2_config() -> SmmuConfig {
        SmmuConfig {
            stage: TranslationStage::Stage2,
            ..Default::default()
        }
    }

    fn cfgi_count(sim: &SimSmmu, sid: u32) -> usize {
        sim.commands()
            .iter()
            .filter(|c| c.opcode() == Some(Opcode::CfgiSte) && c.stream_id() == sid)
            .count()
    }

    // Deterministic xorshift generator.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn probe_enables_smmu() {
        let test = TestSystem::new(SimSmmu::new(), SmmuConfig::default());
        let regs = test.sim.mmio().page0;
        assert!(regs.cr0ack.is_set(Cr0::SmmuEn));
        assert!(regs.cr0ack.is_set(Cr0::CmdqEn));
        assert!(regs.cr0ack.is_set(Cr0::EventqEn));
        assert!(regs.cr2.is_set(Cr2::Ptm));
        assert_eq!(test.sim.count(Opcode::TlbiNsnhAll), 1);
        assert_eq!(test.sim.count(Opcode::Sync), 1);

        let features = test.smmu.features();
        assert_eq!(features.ias, 48);
        assert_eq!(features.tag_bits, 16);
        assert_eq!(features.cmdq_bits, 6);
        assert_eq!(features.eventq_bits, 7);
        let (base, cfg) = test.smmu.stream_table().base_registers();
        assert_eq!(regs.strtab_base.get(), base);
        assert_eq!(regs.strtab_base_cfg.get(), cfg);
    }

    #[test]
    fn probe_failures() {
        let allocator = stub_allocator();
        let index = SmmuIndex::new(0);
        let cases = [
            (SimSmmu::builder().stall_forced().build(), Error::StallForced),
            (
                SimSmmu::builder().preset_tables().build(),
                Error::PresetBaseAddresses,
            ),
            (
                SimSmmu::builder().stages(false, true).build(),
                Error::MissingStage1,
            ),
            (
                SimSmmu::builder().table_format(1).build(),
                Error::UnsupportedTableFormat,
            ),
            (SimSmmu::builder().oas(7).build(), Error::UnsupportedAddressSize(7)),
        ];
        for (sim, err) in cases {
            let result = Smmu::probe(index, sim.mmio(), SmmuConfig::default(), allocator);
            assert_eq!(result.err(), Some(err));
            assert!(err.is_fatal());
        }
        let sim = SimSmmu::builder().stages(true, false).build();
        let result = Smmu::probe(index, sim.mmio(), stage2_config(), allocator);
        assert_eq!(result.err(), Some(Error::MissingStage2));
    }

    #[test]
    fn bind_unbind_stage2() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x8000_4000);
        smmu.bind(42, &domain, root, 40, 1).unwrap();
        assert_eq!(smmu.stream_state(42), Some(SteState::Valid));
        assert_eq!(domain.bindings(smmu.index()), 1);
        // Once before and once after setting the valid bit.
        assert_eq!(cfgi_count(&test.sim, 42), 2);
        let id = smmu.stream_table().stream_id(42).unwrap();
        let ste = smmu.stream_table().entry(id).unwrap();
        assert_eq!(ste.identity(), Some(SteIdentity::TranslationTable(root)));

        // Wrong root, nothing happens.
        smmu.unbind(42, &domain, PhysAddr::new(0x9000_0000)).unwrap();
        assert_eq!(smmu.stream_state(42), Some(SteState::Valid));

        test.sim.clear_commands();
        smmu.unbind(42, &domain, root).unwrap();
        assert_eq!(smmu.stream_state(42), Some(SteState::Invalid));
        assert_eq!(domain.bindings(smmu.index()), 0);
        let tag = domain.tag().unwrap();
        let commands = test.sim.commands();
        let tlbi = commands
            .iter()
            .position(|c| c.opcode() == Some(Opcode::TlbiS12Vmall))
            .unwrap();
        assert_eq!(commands[tlbi].vmid(), tag.bits());
        // The STE is flushed before the tag.
        let cfgi = commands
            .iter()
            .position(|c| c.opcode() == Some(Opcode::CfgiSte))
            .unwrap();
        assert!(cfgi < tlbi);

        // A second unbind is a no-op.
        test.sim.clear_commands();
        smmu.unbind(42, &domain, root).unwrap();
        assert!(test.sim.commands().is_empty());
        assert_eq!(domain.bindings(smmu.index()), 0);
    }

    #[test]
    fn bind_unbind_stage1() {
        let test = TestSystem::new(SimSmmu::new(), SmmuConfig::default());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x8010_0000);
        smmu.bind(7, &domain, root, 48, 0).unwrap();
        smmu.bind(8, &domain, root, 48, 0).unwrap();
        let cd = domain.context_descriptor().unwrap();
        assert_eq!(cd.root(), root);
        assert_eq!(cd.asid(), domain.tag().unwrap());
        let id = smmu.stream_table().stream_id(8).unwrap();
        assert_eq!(
            smmu.stream_table().entry(id).unwrap().identity(),
            Some(SteIdentity::ContextDescriptor(cd.phys_addr()))
        );
        assert_eq!(domain.bindings(smmu.index()), 2);

        smmu.unbind(7, &domain, root).unwrap();
        assert_eq!(test.sim.count(Opcode::TlbiNhAsid), 0);
        smmu.unbind(8, &domain, root).unwrap();
        let asid = domain.tag().unwrap().bits();
        assert!(test
            .sim
            .commands()
            .iter()
            .any(|c| c.opcode() == Some(Opcode::TlbiNhAsid) && c.asid() == asid));
    }

    #[test]
    fn out_of_range() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x1000);
        let err = test.smmu.bind(1 << 16, &domain, root, 48, 2).unwrap_err();
        assert_eq!(err, Error::InvalidRange(1 << 16));
        assert_eq!(err.errno(), -34);
        assert_eq!(domain.bindings(test.smmu.index()), 0);
        assert_eq!(test.smmu.unbind(1 << 16, &domain, root), Ok(()));
    }

    #[test]
    fn busy_stream() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let domain = test.registry.create_domain().unwrap();
        let table = test.smmu.stream_table();
        let ste = table.entry_or_alloc(StreamId::new(9)).unwrap();
        assert_eq!(ste.acquire(&Mutex::new(())), Ownership::Acquired);

        let err = test
            .smmu
            .bind(9, &domain, PhysAddr::new(0x1000), 48, 2)
            .unwrap_err();
        assert_eq!(err, Error::Busy(9));
        assert_eq!(err.errno(), -16);
        assert_eq!(domain.bindings(test.smmu.index()), 0);
        assert_eq!(test.smmu.stream_state(9), Some(SteState::Exclusive));
    }

    #[test]
    fn overbind() {
        let sim = SimSmmu::builder().sid_bits(7).build();
        let test = TestSystem::new(sim, stage2_config());
        let smmu = &test.smmu;
        assert_eq!(
            smmu.stream_table().format(),
            crate::smmu::StreamTableFormat::Linear
        );
        let a = test.registry.create_domain().unwrap();
        let b = test.registry.create_domain().unwrap();
        let root_a = PhysAddr::new(0x1000);
        let root_b = PhysAddr::new(0x2000);
        let id = smmu.stream_table().stream_id(5).unwrap();

        smmu.bind(5, &a, root_a, 48, 2).unwrap();
        assert_eq!(
            smmu.stream_table().entry(id).unwrap().identity(),
            Some(SteIdentity::TranslationTable(root_a))
        );
        test.sim.clear_commands();
        smmu.bind(5, &b, root_b, 48, 2).unwrap();
        assert_eq!(
            smmu.stream_table().entry(id).unwrap().identity(),
            Some(SteIdentity::TranslationTable(root_b))
        );
        assert_eq!(a.bindings(smmu.index()), 0);
        assert_eq!(b.bindings(smmu.index()), 1);
        let tag_a = a.tag().unwrap().bits();
        assert!(test
            .sim
            .commands()
            .iter()
            .any(|c| c.opcode() == Some(Opcode::TlbiS12Vmall) && c.vmid() == tag_a));

        // A no longer owns anything.
        smmu.remove(&a, root_a);
        assert_eq!(smmu.stream_state(5), Some(SteState::Valid));
        smmu.unbind(5, &b, root_b).unwrap();
        assert_eq!(smmu.stream_state(5), Some(SteState::Invalid));
        assert_eq!(b.bindings(smmu.index()), 0);

        assert_eq!(
            smmu.bind(0x1000, &a, root_a, 48, 2),
            Err(Error::InvalidRange(0x1000))
        );
    }

    #[test]
    fn rebind_same_domain() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x4000);
        test.smmu.bind(3, &domain, root, 48, 2).unwrap();
        test.smmu.bind(3, &domain, root, 48, 2).unwrap();
        assert_eq!(domain.bindings(test.smmu.index()), 1);
        assert_eq!(test.smmu.stream_state(3), Some(SteState::Valid));
    }

    #[test]
    fn remove_all_bindings() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let other = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x10_0000);
        let other_root = PhysAddr::new(0x20_0000);
        let sids = [1, 2, 300, 0x8000];
        for sid in sids {
            smmu.bind(sid, &domain, root, 48, 2).unwrap();
        }
        smmu.bind(4, &other, other_root, 48, 2).unwrap();
        assert_eq!(domain.bindings(smmu.index()), 4);

        test.sim.clear_commands();
        smmu.remove(&domain, root);
        for sid in sids {
            assert_eq!(smmu.stream_state(sid), Some(SteState::Invalid));
        }
        assert_eq!(smmu.stream_state(4), Some(SteState::Valid));
        assert_eq!(domain.bindings(smmu.index()), 0);
        assert_eq!(other.bindings(smmu.index()), 1);
        // One flush for the last binding, one final one.
        assert_eq!(test.sim.count(Opcode::TlbiS12Vmall), 2);

        // Nothing bound, nothing to do.
        test.sim.clear_commands();
        smmu.remove(&domain, root);
        assert!(test.sim.commands().is_empty());
    }

    #[test]
    fn two_level_allocation() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let table = test.smmu.stream_table();
        assert_eq!(table.format(), crate::smmu::StreamTableFormat::TwoLevel);
        assert_eq!(table.l2_blocks_allocated(), 0);
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x1000);
        test.smmu.bind(0x1234, &domain, root, 48, 2).unwrap();
        test.smmu.bind(0x1235, &domain, root, 48, 2).unwrap();
        assert_eq!(table.l2_blocks_allocated(), 1);
        // Unbinding never allocates.
        test.smmu.unbind(0x4321, &domain, root).unwrap();
        assert_eq!(table.l2_blocks_allocated(), 1);
        assert_eq!(test.smmu.stream_state(0x4321), None);
    }

    #[test]
    fn concurrent_bind_unbind() {
        const THREADS: u32 = 4;
        const SIDS_PER_THREAD: u32 = 16;
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x40_0000);
        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let smmu = test.smmu.clone();
                let domain = domain.clone();
                std::thread::spawn(move || {
                    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15 + t as u64);
                    let mut bound = [false; SIDS_PER_THREAD as usize];
                    for _ in 0..100 {
                        let i = (rng.next() % SIDS_PER_THREAD as u64) as usize;
                        let sid = t * SIDS_PER_THREAD + i as u32;
                        if rng.next() % 2 == 0 {
                            smmu.bind(sid, &domain, root, 48, 2).unwrap();
                            bound[i] = true;
                        } else {
                            smmu.unbind(sid, &domain, root).unwrap();
                            bound[i] = false;
                        }
                        // Never under-counts.
                        let live = bound.iter().filter(|b| **b).count() as u32;
                        assert!(domain.bindings(smmu.index()) >= live);
                    }
                    bound.iter().filter(|b| **b).count() as u32
                })
            })
            .collect();
        let total: u32 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(domain.bindings(test.smmu.index()), total);

        let smmu: Arc<Smmu> = test.smmu.clone();
        smmu.remove(&domain, root);
        assert_eq!(domain.bindings(smmu.index()), 0);
        for sid in 0..THREADS * SIDS_PER_THREAD {
            assert_eq!(smmu.stream_state(sid), Some(SteState::Invalid));
        }
    }

    #[test]
    fn illegal_command_recovery() {
        let test = TestSystem::new(SimSmmu::new(), SmmuConfig::default());
        test.sim.clear_commands();
        test.smmu.send_cmd_sync(Command::from_raw([0xff, 0]));
        // The illegal command became a sync, followed by ours.
        assert_eq!(test.sim.count(Opcode::Sync), 2);
        let regs = test.sim.mmio().page0;
        assert_eq!(regs.gerror.get(), regs.gerrorn.get());
        assert_eq!(test.smmu.handle_global_errors(), 0);

        // Still working.
        test.smmu.tlb_flush();
        assert_eq!(test.sim.count(Opcode::TlbiNsnhAll), 1);
    }

    #[test]
    fn drain_events() {
        let test = TestSystem::new(SimSmmu::new(), SmmuConfig::default());
        assert_eq!(test.smmu.handle_events(), 0);
        test.sim.push_event(EventType::Translation as u8, 0x42);
        test.sim.overflow_events();
        test.sim.push_event(EventType::BadSte as u8, 0x43);
        assert_eq!(test.smmu.handle_events(), 2);
        assert_eq!(test.sim.event_consumer() & 0xff, 2);
        assert_eq!(test.smmu.handle_events(), 0);
    }

    #[test]
    fn no_event_queue() {
        let config = SmmuConfig {
            log_faults: false,
            ..Default::default()
        };
        let test = TestSystem::new(SimSmmu::new(), config);
        assert!(!test.sim.mmio().page0.cr0ack.is_set(Cr0::EventqEn));
        assert_eq!(test.smmu.handle_events(), 0);
    }
    #[test]
    fn stage1_domain_keeps_its_root() {
        let test = TestSystem::new(SimSmmu::new(), SmmuConfig::default());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x1000);
        smmu.bind(1, &domain, root, 48, 0).unwrap();

        // The context descriptor already translates through `root`.
        let err = smmu
            .bind(2, &domain, PhysAddr::new(0x2000), 48, 0)
            .unwrap_err();
        assert_eq!(err, Error::InvalidState);
        assert_eq!(err.errno(), -22);
        assert_eq!(smmu.stream_state(2), Some(SteState::Invalid));
        assert_eq!(domain.bindings(smmu.index()), 1);
        assert_eq!(domain.context_descriptor().unwrap().root(), root);

        smmu.unbind(2, &domain, PhysAddr::new(0x2000)).unwrap();
        assert_eq!(domain.bindings(smmu.index()), 1);
        smmu.unbind(1, &domain, root).unwrap();
        assert_eq!(smmu.stream_state(1), Some(SteState::Invalid));
        assert_eq!(domain.bindings(smmu.index()), 0);
    }

    #[test]
    fn unowned_ste_keeps_count() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x1000);
        smmu.bind(6, &domain, root, 48, 2).unwrap();
        let id = smmu.stream_table().stream_id(6).unwrap();
        assert!(smmu.stream_table().entry(id).unwrap().take_owner().is_some());

        // The entry is still torn down, but a binding we can't attribute isn't dropped.
        smmu.unbind(6, &domain, root).unwrap();
        assert_eq!(smmu.stream_state(6), Some(SteState::Invalid));
        assert_eq!(domain.bindings(smmu.index()), 1);
    }

    #[test]
    fn invalid_table_params() {
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x1000);
        for size in [0, 24, 49, 64, 65, 255] {
            let err = smmu.bind(1, &domain, root, size, 0).unwrap_err();
            assert_eq!(err, Error::InvalidAddressSize(size));
            assert_eq!(err.errno(), -22);
        }
        assert_eq!(
            smmu.bind(1, &domain, root, 48, 3),
            Err(Error::InvalidStartLevel(3))
        );
        // Nothing was allocated or counted.
        assert_eq!(smmu.stream_state(1), None);
        assert_eq!(domain.tag(), None);
        assert_eq!(domain.bindings(smmu.index()), 0);

        smmu.bind(1, &domain, root, 25, 0).unwrap();
        smmu.bind(2, &domain, root, 48, 2).unwrap();
        assert_eq!(domain.bindings(smmu.index()), 2);
    }

    #[test]
    fn linear_without_two_level_support() {
        let sim = SimSmmu::builder().sid_bits(10).linear_only().build();
        let test = TestSystem::new(sim, stage2_config());
        let table = test.smmu.stream_table();
        assert_eq!(table.format(), crate::smmu::StreamTableFormat::Linear);
        assert_eq!(table.stream_id_bits(), 10);
        let domain = test.registry.create_domain().unwrap();
        test.smmu
            .bind(1000, &domain, PhysAddr::new(0x1000), 48, 2)
            .unwrap();
        assert_eq!(test.smmu.stream_state(1000), Some(SteState::Valid));
        assert_eq!(table.l2_blocks_allocated(), 0);
        assert_eq!(
            test.smmu.bind(1024, &domain, PhysAddr::new(0x1000), 48, 2),
            Err(Error::InvalidRange(1024))
        );
    }

    #[test]
    fn overbind_stage1() {
        let test = TestSystem::new(SimSmmu::new(), SmmuConfig::default());
        let smmu = &test.smmu;
        let a = test.registry.create_domain().unwrap();
        let b = test.registry.create_domain().unwrap();
        let root_a = PhysAddr::new(0x1000);
        let root_b = PhysAddr::new(0x2000);
        let id = smmu.stream_table().stream_id(5).unwrap();

        smmu.bind(5, &a, root_a, 48, 0).unwrap();
        let cd_a = a.context_descriptor().unwrap().phys_addr();
        test.sim.clear_commands();
        smmu.bind(5, &b, root_b, 48, 0).unwrap();
        let cd_b = b.context_descriptor().unwrap().phys_addr();
        assert_ne!(cd_a, cd_b);
        assert_eq!(
            smmu.stream_table().entry(id).unwrap().identity(),
            Some(SteIdentity::ContextDescriptor(cd_b))
        );
        assert_eq!(a.bindings(smmu.index()), 0);
        assert_eq!(b.bindings(smmu.index()), 1);
        let asid_a = a.tag().unwrap().bits();
        assert!(test
            .sim
            .commands()
            .iter()
            .any(|c| c.opcode() == Some(Opcode::TlbiNhAsid) && c.asid() == asid_a));

        // The old domain's identity no longer matches.
        smmu.unbind(5, &a, root_a).unwrap();
        assert_eq!(smmu.stream_state(5), Some(SteState::Valid));
        smmu.remove(&a, root_a);
        assert_eq!(smmu.stream_state(5), Some(SteState::Valid));
        smmu.unbind(5, &b, root_b).unwrap();
        assert_eq!(smmu.stream_state(5), Some(SteState::Invalid));
        assert_eq!(b.bindings(smmu.index()), 0);
    }

    #[test]
    fn non_coherent_tables() {
        let config = SmmuConfig {
            coherency: Coherency::NonCoherent,
            ..Default::default()
        };
        let test = TestSystem::new(SimSmmu::new(), config);
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x8000_0000);
        let allocations = test.allocator.allocations();
        smmu.bind(0x100, &domain, root, 48, 0).unwrap();
        // One L2 block and the context descriptor.
        assert_eq!(test.allocator.allocations(), allocations + 2);
        assert_eq!(smmu.stream_state(0x100), Some(SteState::Valid));
        assert_eq!(cfgi_count(&test.sim, 0x100), 2);

        smmu.remove(&domain, root);
        assert_eq!(smmu.stream_state(0x100), Some(SteState::Invalid));
        let frees = test.allocator.frees();
        drop(domain);
        assert_eq!(test.allocator.frees(), frees + 1);
    }

    #[test]
    fn concurrent_bind_unbind_remove() {
        const THREADS: u32 = 3;
        const SIDS_PER_THREAD: u32 = 8;
        let test = TestSystem::new(SimSmmu::new(), stage2_config());
        let smmu = &test.smmu;
        let domain = test.registry.create_domain().unwrap();
        let root = PhysAddr::new(0x40_0000);
        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    smmu.remove(&domain, root);
                    test.registry.tlb_flush_domain(&domain);
                }
            });
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let domain = &domain;
                    s.spawn(move || {
                        let mut rng = XorShift(0x2545_f491_4f6c_dd1d + t as u64);
                        for _ in 0..100 {
                            let sid = t * SIDS_PER_THREAD + (rng.next() % 8) as u32;
                            if rng.next() % 2 == 0 {
                                match smmu.bind(sid, domain, root, 48, 2) {
                                    Ok(()) | Err(Error::Busy(_)) => (),
                                    Err(e) => panic!("bind {sid}: {e:?}"),
                                }
                            } else {
                                smmu.unbind(sid, domain, root).unwrap();
                            }
                        }
                    })
                })
                .collect();
            for w in workers {
                w.join().unwrap();
            }
            done.store(true, Ordering::Relaxed);
        });

        // The counter covers every STE still pointing at the domain.
        let identity = SteIdentity::TranslationTable(root);
        let live = (0..THREADS * SIDS_PER_THREAD)
            .filter(|&sid| {
                let id = smmu.stream_table().stream_id(sid).unwrap();
                smmu.stream_table()
                    .entry(id)
                    .map_or(false, |ste| {
                        ste.state() == SteState::Valid && ste.references(identity)
                    })
            })
            .count() as u32;
        assert!(domain.bindings(smmu.index()) >= live);

        smmu.remove(&domain, root);
        assert_eq!(domain.bindings(smmu.index()), 0);
        for sid in 0..THREADS * SIDS_PER_THREAD {
            assert_ne!(smmu.stream_state(sid), Some(SteState::Valid));
        }
    }
}
