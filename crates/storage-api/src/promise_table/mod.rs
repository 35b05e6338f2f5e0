// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;

use bytestring::ByteString;

use durable_types::identifiers::InvocationId;
use durable_types::journal::EntryResult;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PromiseState {
    /// Not settled yet. `listeners` are the suspended invocations to wake up on settlement.
    Pending { listeners: Vec<InvocationId> },
    Settled(EntryResult),
}

impl PromiseState {
    pub fn outcome(&self) -> Option<&EntryResult> {
        match self {
            PromiseState::Pending { .. } => None,
            PromiseState::Settled(result) => Some(result),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The promise got settled by this call. The listeners must be woken up.
    Settled { listeners: Vec<InvocationId> },
    /// The promise was settled before, the stored outcome is unchanged.
    AlreadySettled(EntryResult),
}

/// Promises are addressed by the invocation owning them and their name.
pub trait PromiseTable {
    fn get_promise(
        &self,
        owner: &InvocationId,
        name: &str,
    ) -> impl Future<Output = Result<Option<PromiseState>>> + Send;

    /// Creates a pending promise unless one exists. A promise which got settled before being
    /// created keeps its outcome. Returns the current state.
    fn create_promise(
        &self,
        owner: &InvocationId,
        name: ByteString,
    ) -> impl Future<Output = Result<PromiseState>> + Send;

    /// Settles the promise exactly once. Settling an unknown promise stores the outcome, so that
    /// signals arriving before the promise is created are not lost.
    fn settle_promise(
        &self,
        owner: &InvocationId,
        name: ByteString,
        result: EntryResult,
    ) -> impl Future<Output = Result<SettleOutcome>> + Send;

    /// Registers `listener` to be woken up when the promise settles, creating the promise if
    /// needed. Returns the state observed while registering: if it is settled already the
    /// listener is not registered.
    fn add_promise_listener(
        &self,
        owner: &InvocationId,
        name: ByteString,
        listener: InvocationId,
    ) -> impl Future<Output = Result<PromiseState>> + Send;

    fn delete_promises(&self, owner: &InvocationId) -> impl Future<Output = Result<()>> + Send;
}
