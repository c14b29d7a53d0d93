// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Ownership protocol for stream table entries.
//!
//! An STE is always in one of three states, derived from its `V` bit and `Config` field:
//!
//! - Invalid (`V == 0`, `Config == 0`): free for anyone to claim.
//! - Exclusive (`V == 0`, `Config != 0`): owned by exactly one caller, which may rewrite it.
//! - Valid (`V == 1`): in use by the SMMU.
//!
//! Invalid entries are claimed with a compare-and-swap on the first word. Valid entries are
//! taken over by clearing `V` under the per-SMMU invalidate lock, after which the new owner must
//! flush the SMMU's configuration cache before it can assume the SMMU no longer uses the old
//! contents. Contention never blocks: a caller that loses a race gets `Busy`.

use dma_mem::fence::{smp_rmb, smp_wmb};
use dma_mem::{Coherency, DmaWords, PhysAddr};
use spin::Mutex;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::domain::Domain;
use super::error::*;
use super::id_alloc::DomainTag;
use super::registers::encode_address_size;
use super::stream_table::StreamId;

register_bitfields![u64,
    SteWord0 [
        Valid OFFSET(0) NUMBITS(1) [],
        Config OFFSET(1) NUMBITS(3) [
            Abort = 0,
            Bypass = 4,
            S1Translate = 5,
            S2Translate = 6,
        ],
        S1Fmt OFFSET(4) NUMBITS(2) [],
        S1ContextPtr OFFSET(6) NUMBITS(46) [],
        S1CdMax OFFSET(59) NUMBITS(5) [],
    ],

    SteWord1 [
        S1Cir OFFSET(2) NUMBITS(2) [
            WriteBack = 1,
        ],
        S1Cor OFFSET(4) NUMBITS(2) [
            WriteBack = 1,
        ],
        S1Csh OFFSET(6) NUMBITS(2) [
            InnerShareable = 3,
        ],
        Strw OFFSET(30) NUMBITS(2) [],
        Shcfg OFFSET(44) NUMBITS(2) [
            NonShareable = 0,
            Incoming = 1,
        ],
    ],

    SteWord2 [
        S2Vmid OFFSET(0) NUMBITS(16) [],
        S2T0sz OFFSET(32) NUMBITS(6) [],
        S2Sl0 OFFSET(38) NUMBITS(2) [],
        S2Ir0 OFFSET(40) NUMBITS(2) [
            WriteBack = 1,
        ],
        S2Or0 OFFSET(42) NUMBITS(2) [
            WriteBack = 1,
        ],
        S2Sh0 OFFSET(44) NUMBITS(2) [
            InnerShareable = 3,
        ],
        S2Tg OFFSET(46) NUMBITS(2) [
            Granule4k = 0,
        ],
        S2Ps OFFSET(48) NUMBITS(3) [],
        S2Aa64 OFFSET(51) NUMBITS(1) [],
        S2Affd OFFSET(53) NUMBITS(1) [],
        S2Ptw OFFSET(54) NUMBITS(1) [],
        S2S OFFSET(57) NUMBITS(1) [],
        S2R OFFSET(58) NUMBITS(1) [],
    ],

    SteWord3 [
        S2Ttb OFFSET(4) NUMBITS(48),
    ],
];

type Word0 = LocalRegisterCopy<u64, SteWord0::Register>;
type Word1 = LocalRegisterCopy<u64, SteWord1::Register>;
type Word2 = LocalRegisterCopy<u64, SteWord2::Register>;
type Word3 = LocalRegisterCopy<u64, SteWord3::Register>;

/// Size of a stream table entry in 64-bit words.
pub const STE_WORDS: usize = 8;

/// VMID programmed into stage 1 STEs. All of them share it.
pub const STAGE1_VMID: u16 = 0;

/// State of a stream table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SteState {
    /// Not in use.
    Invalid,
    /// Being reconfigured by one owner; ignored by the SMMU.
    Exclusive,
    /// In use by the SMMU.
    Valid,
}

impl SteState {
    fn from_word0(w0: Word0) -> Self {
        if w0.is_set(SteWord0::Valid) {
            SteState::Valid
        } else if w0.read(SteWord0::Config) != 0 {
            SteState::Exclusive
        } else {
            SteState::Invalid
        }
    }
}

/// Outcome of trying to take ownership of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// The entry was Invalid and is now ours.
    Acquired,
    /// The entry was Valid and is now ours, but the SMMU may still use its cached copy until
    /// it's flushed.
    Invalidated,
    /// Someone else owns the entry.
    Busy,
}

/// The pointer by which an entry names the domain it translates for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SteIdentity {
    /// Stage 1: the domain's context descriptor.
    ContextDescriptor(PhysAddr),
    /// Stage 2: the domain's translation table root.
    TranslationTable(PhysAddr),
}

/// Translation configuration written to an entry.
#[derive(Clone, Copy, Debug)]
pub enum SteConfig {
    /// Stage 1 translation through the context descriptor at `cd`.
    Stage1 {
        /// Physical address of the context descriptor.
        cd: PhysAddr,
    },
    /// Stage 2 translation through the table at `root`.
    Stage2 {
        /// VMID of the domain.
        vmid: DomainTag,
        /// Root of the translation table.
        root: PhysAddr,
        /// Input address size in bits.
        input_size: u8,
        /// Starting level of the table walk, in the `SL0` encoding.
        start_level: u8,
        /// Output address size in bits.
        output_size: u8,
        /// Record faults in the event queue.
        record_faults: bool,
    },
}

impl SteConfig {
    /// Returns the identity an entry with this configuration has.
    pub fn identity(&self) -> SteIdentity {
        match *self {
            SteConfig::Stage1 { cd } => SteIdentity::ContextDescriptor(cd),
            SteConfig::Stage2 { root, .. } => SteIdentity::TranslationTable(root),
        }
    }
}

/// Handle to one stream table entry and its software shadow state.
pub struct Ste<'a> {
    id: StreamId,
    words: DmaWords<'a>,
    owner: &'a Mutex<Option<Domain>>,
    coherency: Coherency,
}

impl<'a> Ste<'a> {
    pub(super) fn new(
        id: StreamId,
        words: DmaWords<'a>,
        owner: &'a Mutex<Option<Domain>>,
        coherency: Coherency,
    ) -> Self {
        Self {
            id,
            words,
            owner,
            coherency,
        }
    }

    /// Returns the stream ID this entry translates for.
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn word0(&self) -> Word0 {
        Word0::new(self.words.load(0))
    }

    fn store_word0(&self, w0: Word0) {
        self.words.store(0, w0.get());
        self.words.publish_before_doorbell(self.coherency);
    }

    /// Returns the current state of the entry.
    pub fn state(&self) -> SteState {
        SteState::from_word0(self.word0())
    }

    /// Returns the identity of the domain the entry points to, if it's configured for
    /// translation.
    pub fn identity(&self) -> Option<SteIdentity> {
        let w0 = self.word0();
        match w0.read_as_enum(SteWord0::Config) {
            Some(SteWord0::Config::Value::S1Translate) => {
                let cd = w0.read(SteWord0::S1ContextPtr) << 6;
                Some(SteIdentity::ContextDescriptor(PhysAddr::new(cd)))
            }
            Some(SteWord0::Config::Value::S2Translate) => {
                let root = Word3::new(self.words.load(3)).read(SteWord3::S2Ttb) << 4;
                Some(SteIdentity::TranslationTable(PhysAddr::new(root)))
            }
            _ => None,
        }
    }

    /// Lock-free check whether the entry is valid and points to `identity`. Only a hint: the
    /// entry can change right after.
    pub fn references(&self, identity: SteIdentity) -> bool {
        self.state() == SteState::Valid && self.identity() == Some(identity)
    }

    /// Tries to take exclusive ownership of the entry. Never waits for another owner.
    pub fn acquire(&self, invalidate_lock: &Mutex<()>) -> Ownership {
        let w0 = self.word0();
        match SteState::from_word0(w0) {
            SteState::Valid => {
                let _guard = invalidate_lock.lock();
                // Re-check now that we hold the lock; someone may have invalidated it already.
                let mut w0 = self.word0();
                if !w0.is_set(SteWord0::Valid) {
                    return Ownership::Busy;
                }
                // Valid entries are only modified under the invalidate lock. Config stays set,
                // which leaves the entry Exclusive to us.
                w0.modify(SteWord0::Valid::CLEAR);
                self.store_word0(w0);
                Ownership::Invalidated
            }
            SteState::Exclusive => Ownership::Busy,
            SteState::Invalid => {
                let mut claimed = w0;
                claimed.modify(SteWord0::Config::Bypass);
                match self.words.compare_exchange(0, w0.get(), claimed.get()) {
                    Ok(_) => Ownership::Acquired,
                    Err(_) => Ownership::Busy,
                }
            }
        }
    }

    /// Takes ownership of the entry if it's valid and points to `identity`, clearing `V`. The
    /// caller must flush the entry before relying on the SMMU not using it anymore. Fails with
    /// `InvalidState` if the entry isn't bound to `identity`.
    pub fn acquire_if_bound(
        &self,
        invalidate_lock: &Mutex<()>,
        identity: SteIdentity,
    ) -> Result<()> {
        let _guard = invalidate_lock.lock();
        let mut w0 = self.word0();
        if !w0.is_set(SteWord0::Valid) {
            return Err(Error::InvalidState);
        }
        // Pairs with the barrier in `release()`: a cleared root is never read together with a
        // stale valid bit.
        smp_rmb();
        if self.identity() != Some(identity) {
            return Err(Error::InvalidState);
        }
        w0.modify(SteWord0::Valid::CLEAR);
        self.store_word0(w0);
        Ok(())
    }

    /// Writes the translation configuration of an entry we own exclusively. The entry stays
    /// invalid until `set_valid()`.
    pub fn write_config(&self, config: &SteConfig) {
        let mut w0 = Word0::new(0);
        let mut w1 = Word1::new(0);
        let mut w2 = Word2::new(0);
        let mut w3 = Word3::new(0);
        // StreamWorld NS-EL1, using the incoming shareability attribute.
        w1.modify(SteWord1::Strw.val(0) + SteWord1::Shcfg::Incoming);
        match *config {
            SteConfig::Stage1 { cd } => {
                // S1CDMax is 0 (no substreams), so S1ContextPtr points to a single descriptor.
                w0.modify(
                    SteWord0::Config::S1Translate
                        + SteWord0::S1Fmt.val(0)
                        + SteWord0::S1ContextPtr.val(cd.bits() >> 6),
                );
                w1.modify(
                    SteWord1::S1Cir::WriteBack
                        + SteWord1::S1Cor::WriteBack
                        + SteWord1::S1Csh::InnerShareable,
                );
                w2.modify(SteWord2::S2Vmid.val(STAGE1_VMID as u64));
            }
            SteConfig::Stage2 {
                vmid,
                root,
                input_size,
                start_level,
                output_size,
                record_faults,
            } => {
                w0.modify(SteWord0::Config::S2Translate);
                w2.modify(
                    SteWord2::S2Vmid.val(vmid.bits() as u64)
                        + SteWord2::S2T0sz.val(64 - input_size as u64)
                        + SteWord2::S2Sl0.val(start_level as u64)
                        + SteWord2::S2Ir0::WriteBack
                        + SteWord2::S2Or0::WriteBack
                        + SteWord2::S2Sh0::InnerShareable
                        + SteWord2::S2Tg::Granule4k
                        + SteWord2::S2Ps.val(encode_address_size(output_size) as u64)
                        + SteWord2::S2Aa64::SET
                        + SteWord2::S2Affd::SET
                        + SteWord2::S2S::CLEAR
                        + SteWord2::S2R.val(record_faults as u64),
                );
                w3.modify(SteWord3::S2Ttb.val(root.bits() >> 4));
            }
        }
        for i in 4..STE_WORDS {
            self.words.store(i, 0);
        }
        self.words.store(3, w3.get());
        self.words.store(2, w2.get());
        self.words.store(1, w1.get());
        self.store_word0(w0);
    }

    /// Marks an entry we own exclusively as valid.
    pub fn set_valid(&self) {
        let mut w0 = self.word0();
        w0.modify(SteWord0::Valid::SET);
        self.store_word0(w0);
    }

    /// Returns an entry we own exclusively, and that has been flushed, to the Invalid state.
    pub fn release(&self) {
        let mut w0 = self.word0();
        match w0.read_as_enum(SteWord0::Config) {
            Some(SteWord0::Config::Value::S1Translate) => {
                w0.modify(SteWord0::S1ContextPtr.val(0));
                self.words.store(0, w0.get());
            }
            Some(SteWord0::Config::Value::S2Translate) => self.words.store(3, 0),
            _ => (),
        }
        // The root must be gone before the entry can be claimed again.
        smp_wmb();
        self.store_word0(Word0::new(0));
    }

    /// Records `domain` as the owner of the entry, returning the previous one.
    pub fn set_owner(&self, domain: Domain) -> Option<Domain> {
        self.owner.lock().replace(domain)
    }

    /// Clears the recorded owner of the entry.
    pub fn take_owner(&self) -> Option<Domain> {
        self.owner.lock().take()
    }
}
