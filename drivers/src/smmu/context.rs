// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use dma_mem::{Coherency, DmaAllocator, DmaChunk, PhysAddr};
use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::error::*;
use super::id_alloc::DomainTag;
use super::registers::encode_address_size;

register_bitfields![u64,
    CdWord0 [
        T0sz OFFSET(0) NUMBITS(6) [],
        Tg0 OFFSET(6) NUMBITS(2) [
            Granule4k = 0,
        ],
        Ir0 OFFSET(8) NUMBITS(2) [
            WriteBack = 1,
        ],
        Or0 OFFSET(10) NUMBITS(2) [
            WriteBack = 1,
        ],
        Sh0 OFFSET(12) NUMBITS(2) [
            InnerShareable = 3,
        ],
        Epd0 OFFSET(14) NUMBITS(1) [],
        Endi OFFSET(15) NUMBITS(1) [],
        Epd1 OFFSET(30) NUMBITS(1) [],
        Valid OFFSET(31) NUMBITS(1) [],
        Ips OFFSET(32) NUMBITS(3) [],
        Affd OFFSET(35) NUMBITS(1) [],
        Aa64 OFFSET(41) NUMBITS(1) [],
        S OFFSET(44) NUMBITS(1) [],
        R OFFSET(45) NUMBITS(1) [],
        A OFFSET(46) NUMBITS(1) [],
        Aset OFFSET(47) NUMBITS(1) [],
        Asid OFFSET(48) NUMBITS(16) [],
    ],

    CdWord1 [
        Ttb0 OFFSET(4) NUMBITS(48),
    ],
];

// Size of a context descriptor in 64-bit words.
const CD_WORDS: usize = 8;

// Memory attributes matching the CPU's stage 1 tables: index 0 normal write-back, index 1
// device-nGnRE, index 2 normal non-cacheable.
const MAIR: u64 = 0x0000_0000_0044_04ff;

/// Parameters of a stage 1 context.
#[derive(Clone, Copy, Debug)]
pub struct ContextParams {
    /// Root of the stage 1 translation table.
    pub root: PhysAddr,
    /// Input address size in bits.
    pub input_size: u8,
    /// Intermediate physical address size of the SMMU in bits.
    pub ias: u8,
    /// ASID of the domain.
    pub asid: DomainTag,
    /// Record faults in the event queue.
    pub record_faults: bool,
}

/// A stage 1 context descriptor. One per domain, shared by all STEs of the domain.
#[derive(Debug)]
pub struct ContextDescriptor {
    mem: DmaChunk,
    root: PhysAddr,
    asid: DomainTag,
}

impl ContextDescriptor {
    /// Allocates a context descriptor from `allocator` and fills it in from `params`.
    pub fn new(
        allocator: &dyn DmaAllocator,
        params: &ContextParams,
        coherency: Coherency,
    ) -> Result<Self> {
        let size = CD_WORDS * core::mem::size_of::<u64>();
        let mem = allocator
            .alloc_zeroed(size, size)
            .ok_or(Error::OutOfMemory)?;

        let mut w0 = LocalRegisterCopy::<u64, CdWord0::Register>::new(0);
        // The region size is 2^(64 - T0SZ).
        w0.modify(
            CdWord0::T0sz.val(64 - params.input_size as u64)
                + CdWord0::Tg0::Granule4k
                + CdWord0::Ir0::WriteBack
                + CdWord0::Or0::WriteBack
                + CdWord0::Sh0::InnerShareable
                + CdWord0::Epd0::CLEAR
                + CdWord0::Endi::CLEAR
                + CdWord0::Epd1::SET
                + CdWord0::Valid::SET
                + CdWord0::Ips.val(encode_address_size(params.ias) as u64)
                + CdWord0::Affd::SET
                + CdWord0::Aa64::SET
                + CdWord0::S::CLEAR
                + CdWord0::R.val(params.record_faults as u64)
                + CdWord0::A::SET
                + CdWord0::Aset::SET
                + CdWord0::Asid.val(params.asid.bits() as u64),
        );
        let mut w1 = LocalRegisterCopy::<u64, CdWord1::Register>::new(0);
        w1.modify(CdWord1::Ttb0.val(params.root.bits() >> 4));

        let words = mem.words();
        words.store(1, w1.get());
        words.store(3, MAIR);
        words.store(4, 0);
        words.store(0, w0.get());
        words.publish_before_doorbell(coherency);
        Ok(Self {
            mem,
            root: params.root,
            asid: params.asid,
        })
    }

    /// Returns the physical address of the descriptor.
    pub fn phys_addr(&self) -> PhysAddr {
        self.mem.phys_addr()
    }

    /// Returns the translation table root the descriptor points to.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns the ASID the descriptor tags translations with.
    pub fn asid(&self) -> DomainTag {
        self.asid
    }

    /// Returns the descriptor memory to `allocator`.
    pub fn free(self, allocator: &dyn DmaAllocator) {
        allocator.free(self.mem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_mem::HeapDmaAllocator;

    #[test]
    fn descriptor_fields() {
        let allocator = HeapDmaAllocator::new();
        let params = ContextParams {
            root: PhysAddr::new(0x8040_2000),
            input_size: 48,
            ias: 44,
            asid: DomainTag::new(0x1234),
            record_faults: false,
        };
        let cd = ContextDescriptor::new(&allocator, &params, Coherency::Coherent).unwrap();
        assert!(cd.phys_addr().is_aligned(64));
        assert_eq!(cd.root(), params.root);
        assert_eq!(cd.asid(), params.asid);
        let words = cd.mem.words();
        let w0 = words.load(0);
        assert_eq!(w0 & 0x3f, 16);
        assert_eq!((w0 >> 8) & 0x3f, 0b11_01_01);
        assert_ne!(w0 & (1 << 30), 0);
        assert_ne!(w0 & (1 << 31), 0);
        assert_eq!((w0 >> 32) & 0x7, 4);
        assert_eq!(w0 & (1 << 45), 0);
        assert_eq!(w0 >> 48, 0x1234);
        assert_eq!(words.load(1), 0x8040_2000);
        assert_eq!(words.load(3), MAIR);
        cd.free(&allocator);
        assert_eq!(allocator.outstanding(), 0);
    }
}
