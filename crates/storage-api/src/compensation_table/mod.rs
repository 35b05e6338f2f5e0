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

use bytes::Bytes;

use durable_types::identifiers::{EntryIndex, InvocationId};
use durable_types::invocation::InvocationTarget;

use crate::Result;

/// Undo action registered by an invocation. It is a durable reference to a handler, executed as a
/// sub-invocation with the stored argument.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Compensation {
    pub target: InvocationTarget,
    pub argument: Bytes,
    /// Only armed compensations are executed.
    pub armed: bool,
}

/// Compensations are keyed by the owning invocation and the index of the journal entry which
/// registered them, so their order is the registration order.
pub trait CompensationTable {
    fn put_compensation_if_absent(
        &self,
        owner: &InvocationId,
        index: EntryIndex,
        compensation: Compensation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Returns false if there is no such compensation.
    fn arm_compensation(
        &self,
        owner: &InvocationId,
        index: EntryIndex,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Compensations of the owner in registration order.
    fn get_compensations(
        &self,
        owner: &InvocationId,
    ) -> impl Future<Output = Result<Vec<(EntryIndex, Compensation)>>> + Send;

    fn delete_compensation(
        &self,
        owner: &InvocationId,
        index: EntryIndex,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_compensations(&self, owner: &InvocationId)
    -> impl Future<Output = Result<()>> + Send;
}
