// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

// Negated error numbers reported to callers of the bind/unbind interface.
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ERANGE: i32 = 34;
const ETIMEDOUT: i32 = 110;

/// Errors resulting from interacting with the SMMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The stream ID is outside the range implemented by the SMMU.
    InvalidRange(u32),
    /// Memory for a table, queue or context descriptor couldn't be allocated.
    OutOfMemory,
    /// All ASIDs/VMIDs are in use.
    OutOfTags,
    /// The limit on second-level stream table blocks was reached.
    StreamTableLimit,
    /// A domain's binding counter for one SMMU is saturated.
    BindingOverflow,
    /// The stream table entry for the stream ID is being reconfigured by another caller.
    Busy(u32),
    /// The stream table entry isn't bound to the expected domain, or the domain's context
    /// descriptor points to a different translation table.
    InvalidState,
    /// The translation table input address size is outside what the SMMU can translate.
    InvalidAddressSize(u8),
    /// The stage 2 starting level encoding is out of range.
    InvalidStartLevel(u8),
    /// The queue has no free slots.
    QueueFull,
    /// The SMMU doesn't support AArch64 translation tables.
    UnsupportedTableFormat,
    /// The SMMU only implements the stall fault model.
    StallForced,
    /// The queue or stream table base addresses are fixed by the implementation.
    PresetBaseAddresses,
    /// Missing required stage 1 translation support.
    MissingStage1,
    /// Missing required stage 2 translation support.
    MissingStage2,
    /// The SMMU reported an output address size encoding we don't know.
    UnsupportedAddressSize(u8),
    /// The SMMU didn't acknowledge a control register update.
    AckTimeout,
    /// Two SMMUs reported different intermediate address sizes.
    IasMismatch {
        /// IAS of the first SMMU.
        expected: u8,
        /// IAS of the SMMU that differed.
        found: u8,
    },
    /// The SMMU registry has no free slots.
    TooManySmmus,
    /// No SMMU was probed before finalizing the registry.
    NoSmmus,
    /// Domains can only be created once the registry is finalized.
    NotFinalized,
    /// SMMUs can't be added after the registry was finalized.
    AlreadyFinalized,
}

impl Error {
    /// Returns the negative error number reported to callers for this error.
    pub fn errno(&self) -> i32 {
        use Error::*;
        let errno = match self {
            InvalidRange(_) => ERANGE,
            OutOfMemory | OutOfTags | StreamTableLimit | BindingOverflow => ENOMEM,
            Busy(_) | QueueFull => EBUSY,
            InvalidState
            | InvalidAddressSize(_)
            | InvalidStartLevel(_)
            | IasMismatch { .. }
            | AlreadyFinalized
            | NotFinalized => EINVAL,
            UnsupportedTableFormat
            | StallForced
            | PresetBaseAddresses
            | MissingStage1
            | MissingStage2
            | UnsupportedAddressSize(_)
            | TooManySmmus
            | NoSmmus => ENODEV,
            AckTimeout => ETIMEDOUT,
        };
        -errno
    }

    /// Returns true for the hardware inconsistencies detected at initialization that leave the
    /// SMMU unusable.
    pub fn is_fatal(&self) -> bool {
        use Error::*;
        matches!(
            self,
            UnsupportedTableFormat
                | StallForced
                | PresetBaseAddresses
                | MissingStage1
                | MissingStage2
                | UnsupportedAddressSize(_)
                | AckTimeout
                | IasMismatch { .. }
        )
    }
}

/// Holds results for SMMU operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classes() {
        assert_eq!(Error::InvalidRange(0x1000).errno(), -34);
        assert_eq!(Error::OutOfTags.errno(), -12);
        assert_eq!(Error::StreamTableLimit.errno(), -12);
        assert_eq!(Error::Busy(5).errno(), -16);
        assert_eq!(Error::InvalidState.errno(), -22);
        assert!(Error::MissingStage2.is_fatal());
        assert!(!Error::Busy(5).is_fatal());
    }
}
