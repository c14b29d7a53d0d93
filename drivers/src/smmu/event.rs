// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use dma_mem::DmaWords;

use super::queue::{Consumer, Queue, QueueItem};

/// Queue of fault records written by the SMMU.
pub type EventQueue = Queue<Event, Consumer>;

/// Event record types.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Transaction with attributes the SMMU doesn't support.
    UnsupportedUpstreamTransaction = 0x01,
    /// Stream ID outside the stream table.
    BadStreamId = 0x02,
    /// External abort fetching an STE.
    SteFetch = 0x03,
    /// STE is malformed or its configuration is reserved.
    BadSte = 0x04,
    /// ATS translation request the STE doesn't allow.
    BadAtsTranslationRequest = 0x05,
    /// Transaction on a stream whose STE is disabled.
    StreamDisabled = 0x06,
    /// Translated transaction on a stream in bypass.
    TranslationForbidden = 0x07,
    /// Substream ID out of range.
    BadSubstreamId = 0x08,
    /// External abort fetching a context descriptor.
    CdFetch = 0x09,
    /// Context descriptor is malformed.
    BadCd = 0x0a,
    /// External abort during a translation table walk.
    WalkExternalAbort = 0x0b,
    /// No valid translation for the input address.
    Translation = 0x10,
    /// Output address exceeds the configured size.
    AddressSize = 0x11,
    /// Access flag fault.
    Access = 0x12,
    /// Permission fault.
    Permission = 0x13,
    /// Conflicting TLB entries.
    TlbConflict = 0x20,
    /// Conflicting configuration cache entries.
    ConfigCacheConflict = 0x21,
    /// Page request dropped.
    PageRequest = 0x24,
    /// External abort fetching a VMS.
    VmsFetch = 0x25,
}

impl EventType {
    fn from_raw(raw: u8) -> Option<Self> {
        use EventType::*;
        [
            UnsupportedUpstreamTransaction,
            BadStreamId,
            SteFetch,
            BadSte,
            BadAtsTranslationRequest,
            StreamDisabled,
            TranslationForbidden,
            BadSubstreamId,
            CdFetch,
            BadCd,
            WalkExternalAbort,
            Translation,
            AddressSize,
            Access,
            Permission,
            TlbConflict,
            ConfigCacheConflict,
            PageRequest,
            VmsFetch,
        ]
        .into_iter()
        .find(|t| *t as u8 == raw)
    }
}

/// A 32-byte event queue record.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    words: [u64; 4],
}

impl Event {
    /// Returns the decoded event type, or `None` for types we don't know.
    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_raw(self.raw_type())
    }

    /// Returns the raw event type.
    pub fn raw_type(&self) -> u8 {
        self.words[0] as u8
    }

    /// Returns the stream ID of the transaction that caused the event.
    pub fn stream_id(&self) -> u32 {
        (self.words[0] >> 32) as u32
    }

    /// Creates an event from raw words.
    #[cfg(test)]
    pub(super) fn from_raw(words: [u64; 4]) -> Self {
        Self { words }
    }
}

impl QueueItem for Event {
    const WORDS: usize = 4;

    fn write_to(&self, slot: &DmaWords) {
        for (i, w) in self.words.iter().enumerate() {
            slot.store(i, *w);
        }
    }

    fn read_from(slot: &DmaWords) -> Self {
        let mut words = [0; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = slot.load(i);
        }
        Self { words }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event_type() {
            Some(t) => write!(f, "{t:?}")?,
            None => write!(f, "Unknown({:#x})", self.raw_type())?,
        }
        write!(
            f,
            " sid={:#x} [{:#018x}, {:#018x}, {:#018x}, {:#018x}]",
            self.stream_id(),
            self.words[0],
            self.words[1],
            self.words[2],
            self.words[3]
        )
    }
}
