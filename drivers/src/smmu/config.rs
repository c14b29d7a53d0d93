// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::cmp::min;
use dma_mem::Coherency;
use tock_registers::interfaces::Readable;

use super::error::*;
use super::registers::*;
use super::registry::SmmuIndex;

/// The translation stage used for device DMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationStage {
    /// Stream table entries point to a per-domain context descriptor; domains are tagged with
    /// ASIDs.
    Stage1,
    /// Stream table entries hold the translation table directly; domains are tagged with VMIDs.
    Stage2,
}

/// Software configuration of an SMMU instance.
#[derive(Clone, Debug)]
pub struct SmmuConfig {
    /// Translation stage used for all stream table entries.
    pub stage: TranslationStage,
    /// Whether the SMMU snoops CPU caches for table and queue accesses.
    pub coherency: Coherency,
    /// Enables the event queue and fault recording.
    pub log_faults: bool,
    /// Number of physical address bits implemented by the CPUs.
    pub cpu_phys_bits: u8,
    /// Upper bound on log2 of the command queue size.
    pub cmdq_max_bits: u32,
    /// Upper bound on log2 of the event queue size.
    pub eventq_max_bits: u32,
    /// Upper bound on the number of stream ID bits covered by the stream table.
    pub stream_table_max_bits: u32,
    /// Number of stream ID bits resolved by a second-level stream table block.
    pub stream_table_split: u32,
    /// A linear stream table is used when the SMMU implements at most this many stream ID bits.
    pub linear_max_bits: u32,
    /// Maximum number of second-level stream table blocks ever allocated.
    pub l2_alloc_limit: usize,
    /// Number of polls after which a command queue wait logs a warning.
    pub poll_limit: u64,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            stage: TranslationStage::Stage1,
            coherency: Coherency::Coherent,
            log_faults: true,
            cpu_phys_bits: 48,
            cmdq_max_bits: 6,
            eventq_max_bits: 7,
            stream_table_max_bits: 20,
            // 64 STEs of 64 bytes each fill one 4kB page.
            stream_table_split: 6,
            linear_max_bits: 7,
            l2_alloc_limit: 64,
            poll_limit: 5_000_000,
        }
    }
}

/// Hardware features of an SMMU, read from the ID registers once at probe time.
#[derive(Clone, Copy, Debug)]
pub struct SmmuFeatures {
    /// Intermediate address size in bits.
    pub ias: u8,
    /// Output address size in bits.
    pub oas: u8,
    /// Width of ASIDs (stage 1) or VMIDs (stage 2).
    pub tag_bits: u32,
    /// Number of stream ID bits implemented.
    pub stream_id_bits: u32,
    /// Two-level stream tables are supported.
    pub two_level: bool,
    /// Table walks are coherent with CPU caches.
    pub coherent_walks: bool,
    /// Broadcast TLB maintenance is supported.
    pub btm: bool,
    /// The SMMU sends an event when command completion is signalled with `Wfe`.
    pub sev: bool,
    /// Interrupts can be delivered as MSIs.
    pub msi: bool,
    /// log2 of the command queue size we'll use.
    pub cmdq_bits: u32,
    /// log2 of the event queue size we'll use.
    pub eventq_bits: u32,
}

impl SmmuFeatures {
    /// Reads the ID registers in `regs` and checks that the SMMU can be driven with `config`.
    pub fn probe(regs: &SmmuRegisters, config: &SmmuConfig, index: SmmuIndex) -> Result<Self> {
        let idr0 = regs.idr0.extract();
        let idr1 = regs.idr1.extract();
        let idr5 = regs.idr5.extract();

        match idr0.read_as_enum(Idr0::Ttf) {
            Some(Idr0::Ttf::Value::AArch64) | Some(Idr0::Ttf::Value::Both) => (),
            _ => return Err(Error::UnsupportedTableFormat),
        }
        if idr0.matches_all(Idr0::StallModel::StallForced) {
            return Err(Error::StallForced);
        }
        if idr1.is_set(Idr1::QueuesPreset) || idr1.is_set(Idr1::TablesPreset) {
            return Err(Error::PresetBaseAddresses);
        }
        let tag16 = match config.stage {
            TranslationStage::Stage1 if !idr0.is_set(Idr0::S1p) => {
                return Err(Error::MissingStage1);
            }
            TranslationStage::Stage2 if !idr0.is_set(Idr0::S2p) => {
                return Err(Error::MissingStage2);
            }
            TranslationStage::Stage1 => idr0.is_set(Idr0::Asid16),
            TranslationStage::Stage2 => idr0.is_set(Idr0::Vmid16),
        };

        let coherent_walks = idr0.is_set(Idr0::Cohacc);
        if coherent_walks != (config.coherency == Coherency::Coherent) {
            log::warn!(
                "SMMU{index}: configured {:?} but hardware reports coherent={coherent_walks}",
                config.coherency
            );
        }

        let oas_encoding = idr5.read(Idr5::Oas) as u8;
        let mut oas = decode_address_size(oas_encoding)
            .ok_or(Error::UnsupportedAddressSize(oas_encoding))?;
        if oas < config.cpu_phys_bits {
            log::warn!(
                "SMMU{index}: output address size {oas} smaller than CPU physical address size {}",
                config.cpu_phys_bits
            );
        } else {
            oas = config.cpu_phys_bits;
        }

        let features = Self {
            ias: oas,
            oas,
            tag_bits: if tag16 { 16 } else { 8 },
            stream_id_bits: idr1.read(Idr1::SidSize),
            two_level: idr0.matches_all(Idr0::StLevel::TwoLevel),
            coherent_walks,
            btm: idr0.is_set(Idr0::Btm),
            sev: idr0.is_set(Idr0::Sev),
            msi: idr0.is_set(Idr0::Msi),
            cmdq_bits: min(config.cmdq_max_bits, idr1.read(Idr1::CmdqS)),
            eventq_bits: min(config.eventq_max_bits, idr1.read(Idr1::EventqS)),
        };
        log::debug!("SMMU{index}: {features:?}");
        Ok(features)
    }
}
