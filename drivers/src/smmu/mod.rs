// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

mod command;
mod config;
mod context;
mod core;
mod domain;
mod error;
mod event;
mod id_alloc;
mod queue;
mod registers;
mod registry;
mod ste;
mod stream_table;

#[cfg(test)]
mod sim;

pub use self::core::Smmu;
pub use command::{Command, CompletionSignal, Opcode};
pub use config::{SmmuConfig, SmmuFeatures, TranslationStage};
pub use context::ContextDescriptor;
pub use domain::Domain;
pub use error::Error as SmmuError;
pub use error::Result as SmmuResult;
pub use event::{Event, EventType};
pub use id_alloc::DomainTag;
pub use registers::SmmuMmio;
pub use registry::{SmmuIndex, SmmuRegistry, MAX_SMMUS};
pub use ste::{Ste, SteIdentity, SteState};
pub use stream_table::{SteBlock, StreamId, StreamTable, StreamTableFormat};
