// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use dma_mem::{Coherency, DmaAllocator};
use spin::{Mutex, Once};

use super::context::{ContextDescriptor, ContextParams};
use super::error::*;
use super::id_alloc::{DomainTag, IdAllocator, TagSlot};
use super::registry::{SmmuIndex, MAX_SMMUS};

struct DomainInner {
    tags: Arc<IdAllocator>,
    allocator: &'static dyn DmaAllocator,
    tag: TagSlot,
    cd: Once<ContextDescriptor>,
    // Per-SMMU number of STEs pointing to this domain. May over-count while a bind or unbind is
    // in flight, never under-counts.
    bindings: [AtomicU32; MAX_SMMUS],
    // Serializes updates to `bindings`.
    lock: Mutex<()>,
}

impl Drop for DomainInner {
    fn drop(&mut self) {
        self.tags.free_if_valid(&self.tag);
        let cd = core::mem::replace(&mut self.cd, Once::new());
        if let Some(cd) = cd.try_into_inner() {
            cd.free(self.allocator);
        }
    }
}

/// A DMA address space that streams can be bound to.
///
/// `Domain` is a shared handle: clones refer to the same domain, and the SMMUs keep a clone for
/// every STE bound to it. The domain's tag and context descriptor are allocated on first bind
/// and released when the last handle is dropped. Callers must `remove()` the domain from every
/// SMMU before dropping their handle so the tag is flushed from the TLBs before it's reused.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    /// Creates a domain drawing its tag from `tags` and its context descriptor from `allocator`.
    pub fn new(tags: Arc<IdAllocator>, allocator: &'static dyn DmaAllocator) -> Self {
        Self {
            inner: Arc::new(DomainInner {
                tags,
                allocator,
                tag: TagSlot::new(),
                cd: Once::new(),
                bindings: Default::default(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Returns the domain's tag, if one was allocated.
    pub fn tag(&self) -> Option<DomainTag> {
        self.inner.tag.get()
    }

    /// Returns the domain's tag, allocating it if needed.
    pub fn get_or_alloc_tag(&self) -> Result<DomainTag> {
        self.inner
            .tags
            .get_or_alloc(&self.inner.tag)
            .ok_or(Error::OutOfTags)
    }

    /// Returns the domain's context descriptor, creating it from `params` if needed.
    pub fn get_or_alloc_context(
        &self,
        params: &ContextParams,
        coherency: Coherency,
    ) -> Result<&ContextDescriptor> {
        self.inner
            .cd
            .try_call_once(|| ContextDescriptor::new(self.inner.allocator, params, coherency))
    }

    /// Returns the domain's context descriptor, if one was created.
    pub fn context_descriptor(&self) -> Option<&ContextDescriptor> {
        self.inner.cd.get()
    }

    /// Records one more STE of `smmu` pointing to this domain.
    pub fn add_binding(&self, smmu: SmmuIndex) -> Result<()> {
        let _guard = self.inner.lock.lock();
        let counter = &self.inner.bindings[smmu.bits()];
        let count = counter.load(Ordering::Relaxed);
        if count == u32::MAX {
            return Err(Error::BindingOverflow);
        }
        counter.store(count + 1, Ordering::Release);
        Ok(())
    }

    /// Records one less STE of `smmu` pointing to this domain and returns how many remain.
    pub fn del_binding(&self, smmu: SmmuIndex) -> u32 {
        let _guard = self.inner.lock.lock();
        let counter = &self.inner.bindings[smmu.bits()];
        let count = counter.load(Ordering::Relaxed);
        if count == 0 {
            log::warn!("SMMU{smmu}: dropping binding of unbound domain {self:?}");
            return 0;
        }
        counter.store(count - 1, Ordering::Release);
        count - 1
    }

    /// Returns the number of STEs of `smmu` recorded as pointing to this domain.
    pub fn bindings(&self, smmu: SmmuIndex) -> u32 {
        self.inner.bindings[smmu.bits()].load(Ordering::Acquire)
    }

    /// Lock-free check whether any STE of `smmu` may point to this domain. Only a hint.
    pub fn is_bound(&self, smmu: SmmuIndex) -> bool {
        self.bindings(smmu) != 0
    }

    /// Synchronizes with every binding update that completed before this call.
    pub fn sync_with_domain_state(&self) {
        drop(self.inner.lock.lock());
    }

    /// Returns true if `self` and `other` are handles to the same domain.
    pub fn ptr_eq(&self, other: &Domain) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("tag", &self.tag())
            .field("cd", &self.context_descriptor().map(|cd| cd.phys_addr()))
            .finish()
    }
}
