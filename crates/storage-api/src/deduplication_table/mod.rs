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

use durable_types::identifiers::{IdempotencyId, InvocationId};
use durable_types::journal::EntryResult;
use durable_types::time::MillisSinceEpoch;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DedupRecord {
    /// The invocation owning the idempotency key is still running.
    InFlight { invocation_id: InvocationId },
    Completed {
        invocation_id: InvocationId,
        outcome: EntryResult,
        expires_at: MillisSinceEpoch,
    },
}

impl DedupRecord {
    pub fn invocation_id(&self) -> InvocationId {
        match self {
            DedupRecord::InFlight { invocation_id }
            | DedupRecord::Completed { invocation_id, .. } => *invocation_id,
        }
    }

    pub fn is_expired(&self, now: MillisSinceEpoch) -> bool {
        matches!(self, DedupRecord::Completed { expires_at, .. } if *expires_at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The caller owns the idempotency key now. `replaced` is the invocation of an expired record
    /// which got overwritten by the reservation.
    Reserved { replaced: Option<InvocationId> },
    /// A live record exists for the idempotency key.
    Existing(DedupRecord),
}

pub trait DeduplicationTable {
    /// Atomically reserves the idempotency id for `invocation_id` if no record exists or the
    /// existing record has expired at `now`.
    fn reserve_idempotency_id(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        now: MillisSinceEpoch,
    ) -> impl Future<Output = Result<ReserveOutcome>> + Send;

    /// Stores the final outcome of the reservation. Fails with
    /// [`crate::StorageError::PreconditionFailed`] if the id is not reserved by `invocation_id`.
    fn commit_idempotency_id(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        outcome: EntryResult,
        expires_at: MillisSinceEpoch,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_dedup_record(
        &self,
        idempotency_id: &IdempotencyId,
    ) -> impl Future<Output = Result<Option<DedupRecord>>> + Send;

    /// Removes all the records expired at `now`, returning the invocations they referred to.
    fn purge_expired_dedup_records(
        &self,
        now: MillisSinceEpoch,
    ) -> impl Future<Output = Result<Vec<InvocationId>>> + Send;
}
