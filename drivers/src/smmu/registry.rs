// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use arrayvec::ArrayVec;
use core::cmp::min;
use core::fmt;
use dma_mem::{DmaAllocator, PhysAddr};
use spin::{Once, RwLock};

use super::config::SmmuConfig;
use super::core::Smmu;
use super::domain::Domain;
use super::error::*;
use super::id_alloc::IdAllocator;
use super::registers::SmmuMmio;

/// Maximum number of SMMUs in the system.
pub const MAX_SMMUS: usize = 8;

/// Index of an SMMU in the `SmmuRegistry`. Stable for the lifetime of the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SmmuIndex(usize);

impl SmmuIndex {
    pub(super) fn new(index: usize) -> Self {
        assert!(index < MAX_SMMUS);
        Self(index)
    }

    /// Returns the raw index.
    pub fn bits(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SmmuIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of SMMUs in the system.
///
/// SMMUs are added with `probe()` during boot. Once all of them are known, `finalize()` sizes the
/// domain tag space shared by all instances, after which domains can be created.
pub struct SmmuRegistry {
    allocator: &'static dyn DmaAllocator,
    smmus: RwLock<ArrayVec<Arc<Smmu>, MAX_SMMUS>>,
    tags: Once<Arc<IdAllocator>>,
}

impl SmmuRegistry {
    /// Creates an empty registry. SMMU tables, queues and context descriptors are allocated from
    /// `allocator`.
    pub fn new(allocator: &'static dyn DmaAllocator) -> Self {
        Self {
            allocator,
            smmus: RwLock::new(ArrayVec::new()),
            tags: Once::new(),
        }
    }

    /// Initializes the SMMU whose registers are at `mmio` and adds it to the registry.
    pub fn probe(&self, mmio: SmmuMmio, config: SmmuConfig) -> Result<SmmuIndex> {
        let mut smmus = self.smmus.write();
        if self.tags.is_completed() {
            return Err(Error::AlreadyFinalized);
        }
        if smmus.is_full() {
            return Err(Error::TooManySmmus);
        }
        let index = SmmuIndex::new(smmus.len());
        let smmu = Smmu::probe(index, mmio, config, self.allocator)?;
        smmus.push(Arc::new(smmu));
        Ok(index)
    }

    /// Completes initialization once every SMMU has been probed.
    pub fn finalize(&self) -> Result<()> {
        let smmus = self.smmus.read();
        let first = smmus.first().ok_or(Error::NoSmmus)?.features();
        // Domains are shared between SMMUs, so they must agree on the input address size.
        if let Some(other) = smmus.iter().find(|s| s.features().ias != first.ias) {
            return Err(Error::IasMismatch {
                expected: first.ias,
                found: other.features().ias,
            });
        }
        let tag_bits = smmus
            .iter()
            .fold(first.tag_bits, |bits, s| min(bits, s.features().tag_bits));
        if self.tags.is_completed() {
            return Err(Error::AlreadyFinalized);
        }
        self.tags
            .call_once(|| Arc::new(IdAllocator::new(0, (1 << tag_bits) - 1)));
        log::info!(
            "SMMU: {} instance(s), {}-bit IAS, {tag_bits}-bit domain tags",
            smmus.len(),
            first.ias
        );
        Ok(())
    }

    /// Returns the SMMU at `index`.
    pub fn get(&self, index: SmmuIndex) -> Option<Arc<Smmu>> {
        self.smmus.read().get(index.bits()).cloned()
    }

    /// Returns the number of SMMUs probed so far.
    pub fn len(&self) -> usize {
        self.smmus.read().len()
    }

    /// Returns if no SMMU has been probed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a new domain. Fails if the registry hasn't been finalized.
    pub fn create_domain(&self) -> Result<Domain> {
        let tags = self.tags.get().ok_or(Error::NotFinalized)?;
        Ok(Domain::new(tags.clone(), self.allocator))
    }

    /// Flushes the TLB entries of `domain` from every SMMU it is bound to.
    pub fn tlb_flush_domain(&self, domain: &Domain) {
        if domain.tag().is_none() {
            return;
        }
        for smmu in self.smmus.read().iter() {
            if domain.is_bound(smmu.index()) {
                smmu.tlb_invalidate_tag(domain.tag());
            }
        }
    }

    /// Invalidates all TLB entries on all SMMUs.
    pub fn tlb_flush_all(&self) {
        for smmu in self.smmus.read().iter() {
            smmu.tlb_flush();
        }
    }

    /// Unbinds every stream bound to `domain` through the page table at `root`, on all SMMUs.
    /// Used when the address space goes away.
    pub fn remove_from_all(&self, domain: &Domain, root: PhysAddr) {
        for smmu in self.smmus.read().iter() {
            smmu.remove(domain, root);
        }
    }

    /// Services global errors and drains the event queues of all SMMUs. Returns the number of
    /// events handled.
    pub fn handle_interrupts(&self) -> usize {
        self.smmus
            .read()
            .iter()
            .map(|smmu| {
                smmu.handle_global_errors();
                smmu.handle_events()
            })
            .sum()
    }
}
