// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use dma_mem::DmaWords;
use static_assertions::const_assert;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::id_alloc::DomainTag;
use super::queue::{Producer, Queue, QueueItem};
use super::stream_table::StreamId;

/// The queue software submits commands to the SMMU through.
pub type CommandQueue = Queue<Command, Producer>;

register_bitfields![u64,
    CmdWord0 [
        Opcode OFFSET(0) NUMBITS(8) [],
        Cs OFFSET(12) NUMBITS(2) [
            NoSignal = 0,
            Irq = 1,
            Sev = 2,
        ],
        StreamId OFFSET(32) NUMBITS(32) [],
        Vmid OFFSET(32) NUMBITS(16) [],
        Asid OFFSET(48) NUMBITS(16) [],
    ],

    CmdWord1 [
        Leaf OFFSET(0) NUMBITS(1),
    ],
];

type Word0 = LocalRegisterCopy<u64, CmdWord0::Register>;
type Word1 = LocalRegisterCopy<u64, CmdWord1::Register>;

/// Command opcodes issued by the driver.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Invalidate cached configuration for one stream.
    CfgiSte = 0x03,
    /// Invalidate stage 1 TLB entries tagged with an ASID.
    TlbiNhAsid = 0x11,
    /// Invalidate all TLB entries tagged with a VMID.
    TlbiS12Vmall = 0x28,
    /// Invalidate all non-secure, non-hypervisor TLB entries.
    TlbiNsnhAll = 0x30,
    /// Wait for completion of all preceding commands.
    Sync = 0x46,
}

impl Opcode {
    fn from_raw(raw: u8) -> Option<Self> {
        use Opcode::*;
        [CfgiSte, TlbiNhAsid, TlbiS12Vmall, TlbiNsnhAll, Sync]
            .into_iter()
            .find(|op| *op as u8 == raw)
    }
}

/// How the SMMU signals completion of a `Sync` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionSignal {
    /// Completion is only visible through the consumer index.
    None,
    /// Completion raises an interrupt.
    Irq,
    /// Completion sends a wake-up event to CPUs waiting in `wfe`.
    Event,
}

/// A command queue entry.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    words: [u64; 2],
}

const_assert!(core::mem::size_of::<Command>() == 16);

impl Command {
    fn new(op: Opcode) -> (Word0, Word1) {
        let mut w0 = Word0::new(0);
        w0.modify(CmdWord0::Opcode.val(op as u64));
        (w0, Word1::new(0))
    }

    fn from_parts(w0: Word0, w1: Word1) -> Self {
        Self {
            words: [w0.get(), w1.get()],
        }
    }

    /// Invalidates cached configuration of stream `sid`. With `leaf` set only the STE itself is
    /// invalidated, not the L1 descriptor leading to it.
    pub fn cfgi_ste(sid: StreamId, leaf: bool) -> Self {
        let (mut w0, mut w1) = Self::new(Opcode::CfgiSte);
        w0.modify(CmdWord0::StreamId.val(sid.bits() as u64));
        w1.modify(CmdWord1::Leaf.val(leaf as u64));
        Self::from_parts(w0, w1)
    }

    /// Invalidates stage 1 TLB entries for `asid` in `vmid`.
    pub fn tlbi_nh_asid(vmid: u16, asid: DomainTag) -> Self {
        let (mut w0, w1) = Self::new(Opcode::TlbiNhAsid);
        w0.modify(CmdWord0::Vmid.val(vmid as u64) + CmdWord0::Asid.val(asid.bits() as u64));
        Self::from_parts(w0, w1)
    }

    /// Invalidates all stage 1 and stage 2 TLB entries for `vmid`.
    pub fn tlbi_s12_vmall(vmid: DomainTag) -> Self {
        let (mut w0, w1) = Self::new(Opcode::TlbiS12Vmall);
        w0.modify(CmdWord0::Vmid.val(vmid.bits() as u64));
        Self::from_parts(w0, w1)
    }

    /// Invalidates all non-secure TLB entries outside of hypervisor translation regimes.
    pub fn tlbi_nsnh_all() -> Self {
        let (w0, w1) = Self::new(Opcode::TlbiNsnhAll);
        Self::from_parts(w0, w1)
    }

    /// Waits for the completion of all preceding commands and signals it with `cs`.
    pub fn sync(cs: CompletionSignal) -> Self {
        let (mut w0, w1) = Self::new(Opcode::Sync);
        let cs = match cs {
            CompletionSignal::None => CmdWord0::Cs::NoSignal,
            CompletionSignal::Irq => CmdWord0::Cs::Irq,
            CompletionSignal::Event => CmdWord0::Cs::Sev,
        };
        w0.modify(cs);
        Self::from_parts(w0, w1)
    }

    /// Returns the opcode of this command, or `None` if it's not one we issue.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.raw_opcode())
    }

    /// Returns the raw opcode byte.
    pub fn raw_opcode(&self) -> u8 {
        self.word0().read(CmdWord0::Opcode) as u8
    }

    /// Returns the stream ID targeted by a `CfgiSte` command.
    pub fn stream_id(&self) -> u32 {
        self.word0().read(CmdWord0::StreamId) as u32
    }

    /// Returns the ASID field.
    pub fn asid(&self) -> u16 {
        self.word0().read(CmdWord0::Asid) as u16
    }

    /// Returns the VMID field.
    pub fn vmid(&self) -> u16 {
        self.word0().read(CmdWord0::Vmid) as u16
    }

    /// Returns the leaf flag of a `CfgiSte` command.
    pub fn leaf(&self) -> bool {
        Word1::new(self.words[1]).is_set(CmdWord1::Leaf)
    }

    /// Returns the completion signal of a `Sync` command.
    pub fn completion_signal(&self) -> CompletionSignal {
        match self.word0().read_as_enum(CmdWord0::Cs) {
            Some(CmdWord0::Cs::Value::Irq) => CompletionSignal::Irq,
            Some(CmdWord0::Cs::Value::Sev) => CompletionSignal::Event,
            _ => CompletionSignal::None,
        }
    }

    /// Creates a command from raw words.
    #[cfg(test)]
    pub(super) fn from_raw(words: [u64; 2]) -> Self {
        Self { words }
    }

    fn word0(&self) -> Word0 {
        Word0::new(self.words[0])
    }
}

impl QueueItem for Command {
    const WORDS: usize = 2;

    fn write_to(&self, slot: &DmaWords) {
        slot.store(1, self.words[1]);
        slot.store(0, self.words[0]);
    }

    fn read_from(slot: &DmaWords) -> Self {
        Self {
            words: [slot.load(0), slot.load(1)],
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{op:?}")?,
            None => write!(f, "Unknown({:#x})", self.raw_opcode())?,
        }
        write!(f, " [{:#018x}, {:#018x}]", self.words[0], self.words[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding() {
        let cmd = Command::cfgi_ste(StreamId::new(0x1234), true);
        assert_eq!(cmd.raw_opcode(), 0x03);
        assert_eq!(cmd.stream_id(), 0x1234);
        assert!(cmd.leaf());
        assert_eq!(cmd, Command::from_raw([0x1234_0000_0003, 1]));

        let cmd = Command::tlbi_nh_asid(0, DomainTag::new(0xabcd));
        assert_eq!(cmd.opcode(), Some(Opcode::TlbiNhAsid));
        assert_eq!(cmd.asid(), 0xabcd);
        assert_eq!(cmd.vmid(), 0);

        let cmd = Command::tlbi_s12_vmall(DomainTag::new(7));
        assert_eq!(cmd, Command::from_raw([(7 << 32) | 0x28, 0]));

        assert_eq!(Command::tlbi_nsnh_all(), Command::from_raw([0x30, 0]));

        let cmd = Command::sync(CompletionSignal::Event);
        assert_eq!(cmd, Command::from_raw([(2 << 12) | 0x46, 0]));
        assert_eq!(cmd.completion_signal(), CompletionSignal::Event);
        let cmd = Command::sync(CompletionSignal::None);
        assert_eq!(cmd.completion_signal(), CompletionSignal::None);

        assert_eq!(Command::from_raw([0xff, 0]).opcode(), None);
    }
}
