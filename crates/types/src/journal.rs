// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Journal entries record the outcome of every non-deterministic operation of an invocation.
//! Replaying an invocation walks its journal in order and returns the recorded outcomes instead
//! of executing the operations again.

use bytes::Bytes;
use bytestring::ByteString;

use crate::errors::TerminalError;
use crate::identifiers::{EntryIndex, InvocationId};
use crate::invocation::InvocationTarget;
use crate::time::MillisSinceEpoch;

/// Recorded outcome of an operation which can fail terminally.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryResult {
    Success(Bytes),
    Failure(TerminalError),
}

impl From<Result<Bytes, TerminalError>> for EntryResult {
    fn from(value: Result<Bytes, TerminalError>) -> Self {
        match value {
            Ok(bytes) => EntryResult::Success(bytes),
            Err(err) => EntryResult::Failure(err),
        }
    }
}

impl From<EntryResult> for Result<Bytes, TerminalError> {
    fn from(value: EntryResult) -> Self {
        match value {
            EntryResult::Success(bytes) => Ok(bytes),
            EntryResult::Failure(err) => Err(err),
        }
    }
}

/// Source of a recorded non-deterministic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValueKind {
    Now,
    Random,
    Uuid,
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::EnumDiscriminants,
)]
#[strum_discriminants(name(EntryType), derive(strum::Display, strum::IntoStaticStr))]
pub enum Entry {
    /// Outcome of a side effect executed in-line by the handler.
    Run { name: ByteString, result: EntryResult },
    /// A sub-invocation was dispatched. Its outcome is recorded by [`Entry::CallCompleted`] when
    /// the handler consumes it.
    Call {
        target: InvocationTarget,
        invocation_id: InvocationId,
    },
    CallCompleted {
        call_index: EntryIndex,
        result: EntryResult,
    },
    Value { kind: ValueKind, value: Bytes },
    /// The absolute fire time of a durable timer. Replay reads it instead of recomputing
    /// `now + duration`.
    Sleep { fire_at: MillisSinceEpoch },
    TimerFired { sleep_index: EntryIndex },
    PromiseCreate { name: ByteString },
    PromiseOutcome {
        owner: InvocationId,
        name: ByteString,
        result: EntryResult,
    },
    PromiseSettle {
        owner: InvocationId,
        name: ByteString,
        result: EntryResult,
    },
    StateGet {
        name: ByteString,
        value: Option<Bytes>,
    },
    StateSet { name: ByteString, value: Bytes },
    StateClear { name: ByteString },
    StateClearAll,
    StateKeys { keys: Vec<ByteString> },
    CompensationRegistered {
        target: InvocationTarget,
        argument: Bytes,
    },
    CompensationArmed { index: EntryIndex },
    /// Outcome of an explicit compensation run: the executed compensations in execution order
    /// and the number of unarmed ones which got discarded.
    CompensationsRan {
        executed: Vec<(EntryIndex, EntryResult)>,
        discarded: u32,
    },
}

impl Entry {
    pub fn ty(&self) -> EntryType {
        self.into()
    }

    /// Name identifying the operation within its type, used to detect journal mismatches on
    /// replay.
    pub fn operation_name(&self) -> Option<&str> {
        match self {
            Entry::Run { name, .. }
            | Entry::PromiseCreate { name }
            | Entry::PromiseOutcome { name, .. }
            | Entry::PromiseSettle { name, .. }
            | Entry::StateGet { name, .. }
            | Entry::StateSet { name, .. }
            | Entry::StateClear { name } => Some(name),
            _ => None,
        }
    }
}

/// An entry together with its position in the journal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JournalEntry {
    pub index: EntryIndex,
    pub entry: Entry,
}
