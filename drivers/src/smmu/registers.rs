// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use static_assertions::const_assert;
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

// SMMUv3 register definitions; see the Arm System Memory Management Unit Architecture
// Specification, version 3.

register_bitfields![u32,
    pub Idr0 [
        S2p OFFSET(0) NUMBITS(1) [],
        S1p OFFSET(1) NUMBITS(1) [],
        Ttf OFFSET(2) NUMBITS(2) [
            AArch32 = 1,
            AArch64 = 2,
            Both = 3,
        ],
        Cohacc OFFSET(4) NUMBITS(1) [],
        Btm OFFSET(5) NUMBITS(1) [],
        Asid16 OFFSET(12) NUMBITS(1) [],
        Msi OFFSET(13) NUMBITS(1) [],
        Sev OFFSET(14) NUMBITS(1) [],
        Vmid16 OFFSET(18) NUMBITS(1) [],
        StallModel OFFSET(24) NUMBITS(2) [
            StallAndTerminate = 0,
            TerminateOnly = 1,
            StallForced = 2,
        ],
        StLevel OFFSET(27) NUMBITS(2) [
            Linear = 0,
            TwoLevel = 1,
        ],
    ],

    pub Idr1 [
        SidSize OFFSET(0) NUMBITS(6),
        SsidSize OFFSET(6) NUMBITS(5),
        EventqS OFFSET(16) NUMBITS(5),
        CmdqS OFFSET(21) NUMBITS(5),
        QueuesPreset OFFSET(29) NUMBITS(1),
        TablesPreset OFFSET(30) NUMBITS(1),
    ],

    pub Idr5 [
        Oas OFFSET(0) NUMBITS(3),
        Gran4k OFFSET(4) NUMBITS(1),
        Gran16k OFFSET(5) NUMBITS(1),
        Gran64k OFFSET(6) NUMBITS(1),
    ],

    pub Cr0 [
        SmmuEn OFFSET(0) NUMBITS(1),
        PriqEn OFFSET(1) NUMBITS(1),
        EventqEn OFFSET(2) NUMBITS(1),
        CmdqEn OFFSET(3) NUMBITS(1),
    ],

    pub Cr1 [
        QueueIc OFFSET(0) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
        ],
        QueueOc OFFSET(2) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
        ],
        QueueSh OFFSET(4) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3,
        ],
        TableIc OFFSET(6) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
        ],
        TableOc OFFSET(8) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
        ],
        TableSh OFFSET(10) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3,
        ],
    ],

    pub Cr2 [
        E2h OFFSET(0) NUMBITS(1),
        RecInvSid OFFSET(1) NUMBITS(1),
        Ptm OFFSET(2) NUMBITS(1),
    ],

    pub IrqCtrl [
        GerrorIrqEn OFFSET(0) NUMBITS(1),
        PriqIrqEn OFFSET(1) NUMBITS(1),
        EventqIrqEn OFFSET(2) NUMBITS(1),
    ],

    pub Gerror [
        CmdqErr OFFSET(0) NUMBITS(1),
        EventqAbtErr OFFSET(2) NUMBITS(1),
        PriqAbtErr OFFSET(3) NUMBITS(1),
        MsiCmdqAbtErr OFFSET(4) NUMBITS(1),
        MsiEventqAbtErr OFFSET(5) NUMBITS(1),
        MsiPriqAbtErr OFFSET(6) NUMBITS(1),
        MsiGerrorAbtErr OFFSET(7) NUMBITS(1),
        SfmErr OFFSET(8) NUMBITS(1),
        CmdqpErr OFFSET(9) NUMBITS(1),
    ],

    pub StrtabBaseCfg [
        Log2Size OFFSET(0) NUMBITS(6) [],
        Split OFFSET(6) NUMBITS(5) [],
        Fmt OFFSET(16) NUMBITS(2) [
            Linear = 0,
            TwoLevel = 1,
        ],
    ],

    // Producer and consumer index registers. The wrap flag sits right above the index bits, so
    // its position depends on the queue size and it's part of `Index` here.
    pub QueueIndex [
        Index OFFSET(0) NUMBITS(20) [],
        CmdError OFFSET(24) NUMBITS(7) [
            NoError = 0,
            Illegal = 1,
            Abort = 2,
            AtcInvSync = 3,
        ],
        Overflow OFFSET(31) NUMBITS(1) [],
    ],
];

register_bitfields![u64,
    pub StrtabBase [
        Addr OFFSET(6) NUMBITS(46),
        Ra OFFSET(62) NUMBITS(1),
    ],

    pub QueueBase [
        Log2Size OFFSET(0) NUMBITS(5),
        Addr OFFSET(5) NUMBITS(47),
        Ra OFFSET(62) NUMBITS(1),
    ],

    pub IrqCfg0 [
        Addr OFFSET(2) NUMBITS(50),
    ],
];

/// Producer/consumer index pair of a queue.
#[repr(C)]
pub struct QueueIndexRegisters {
    pub prod: ReadWrite<u32, QueueIndex::Register>,
    pub cons: ReadWrite<u32, QueueIndex::Register>,
}

/// The SMMU register page 0.
#[repr(C)]
pub struct SmmuRegisters {
    pub idr0: ReadOnly<u32, Idr0::Register>,
    pub idr1: ReadOnly<u32, Idr1::Register>,
    _idr2_4: [u32; 3],
    pub idr5: ReadOnly<u32, Idr5::Register>,
    _iidr_aidr: [u32; 2],
    pub cr0: ReadWrite<u32, Cr0::Register>,
    pub cr0ack: ReadOnly<u32, Cr0::Register>,
    pub cr1: ReadWrite<u32, Cr1::Register>,
    pub cr2: ReadWrite<u32, Cr2::Register>,
    _reserved0: [u32; 4],
    pub statusr: ReadOnly<u32>,
    pub gbpa: ReadWrite<u32>,
    pub agbpa: ReadWrite<u32>,
    _reserved1: u32,
    pub irq_ctrl: ReadWrite<u32, IrqCtrl::Register>,
    pub irq_ctrlack: ReadOnly<u32, IrqCtrl::Register>,
    _reserved2: [u32; 2],
    pub gerror: ReadOnly<u32, Gerror::Register>,
    pub gerrorn: ReadWrite<u32, Gerror::Register>,
    pub gerror_irq_cfg0: ReadWrite<u64, IrqCfg0::Register>,
    _gerror_irq_cfg1_2: [u32; 2],
    _reserved3: [u32; 2],
    pub strtab_base: ReadWrite<u64, StrtabBase::Register>,
    pub strtab_base_cfg: ReadWrite<u32, StrtabBaseCfg::Register>,
    _reserved4: u32,
    pub cmdq_base: ReadWrite<u64, QueueBase::Register>,
    pub cmdq: QueueIndexRegisters,
    pub eventq_base: ReadWrite<u64, QueueBase::Register>,
    // Page 0 aliases of the event queue indices; we use the page 1 copies.
    _eventq_indices: [u32; 2],
    pub eventq_irq_cfg0: ReadWrite<u64, IrqCfg0::Register>,
    _eventq_irq_cfg1_2: [u32; 2],
}

/// The SMMU register page 1, holding the event queue indices.
#[repr(C)]
pub struct SmmuPage1Registers {
    _reserved: [u32; 42],
    pub eventq: QueueIndexRegisters,
}

/// Offset of register page 1 from the start of the register space.
pub const PAGE1_OFFSET: usize = 0x1_0000;

fn _assert_register_layout() {
    const_assert!(core::mem::size_of::<SmmuRegisters>() == 0xc0);
    const_assert!(core::mem::size_of::<SmmuPage1Registers>() == 0xb0);
    const_assert!(core::mem::size_of::<QueueIndexRegisters>() == 8);
}

/// The MMIO register pages of one SMMU.
#[derive(Clone, Copy)]
pub struct SmmuMmio {
    pub(super) page0: &'static SmmuRegisters,
    pub(super) page1: &'static SmmuPage1Registers,
}

impl SmmuMmio {
    /// Creates the register accessors for an SMMU whose register space is mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to the SMMU's register space, mapped as device memory and at least
    /// `PAGE1_OFFSET + 0x1_0000` bytes long, for the rest of the program. Nothing else may access
    /// the registers.
    pub unsafe fn from_base(base: *mut u8) -> Self {
        Self {
            page0: &*(base as *const SmmuRegisters),
            page1: &*(base.add(PAGE1_OFFSET) as *const SmmuPage1Registers),
        }
    }
}

// Address sizes indexed by their IDR5.OAS / CD.IPS / STE.S2PS encoding.
const ADDRESS_SIZES: [u8; 7] = [32, 36, 40, 42, 44, 48, 52];

/// Decodes an IDR5.OAS style address size field into a number of bits.
pub fn decode_address_size(encoding: u8) -> Option<u8> {
    ADDRESS_SIZES.get(encoding as usize).copied()
}

/// Encodes `bits` of physical address into the IPS/PS field format. Sizes without an exact
/// encoding use the 48-bit one.
pub fn encode_address_size(bits: u8) -> u8 {
    match ADDRESS_SIZES.iter().position(|&s| s == bits) {
        Some(e) if bits <= 48 => e as u8,
        _ => 5,
    }
}
