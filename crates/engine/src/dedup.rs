// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use tracing::debug;

use durable_storage_api::Result;
use durable_storage_api::deduplication_table::{DedupRecord, DeduplicationTable, ReserveOutcome};
use durable_types::identifiers::{IdempotencyId, InvocationId};
use durable_types::journal::EntryResult;
use durable_types::time::MillisSinceEpoch;

/// Epoch seconds of 2001-01-01 up to the largest 10 digit value (year 2286).
const PLAUSIBLE_SECONDS: std::ops::RangeInclusive<u64> = 978_307_200..=9_999_999_999;
const PLAUSIBLE_MILLIS: std::ops::RangeInclusive<u64> = 978_307_200_000..=9_999_999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyKeyCheck {
    Ok,
    /// The key embeds a run of digits which reads as a wall-clock timestamp.
    LooksLikeTimestamp,
}

/// Best-effort check whether the idempotency key was derived from the wall clock. Such keys
/// differ between retries of the same logical operation and defeat deduplication.
///
/// Looks for maximal runs of 10 to 13 ASCII digits whose value is a plausible epoch timestamp in
/// seconds or milliseconds. Long numeric business identifiers can produce false positives.
pub fn check_idempotency_key(key: &str) -> IdempotencyKeyCheck {
    let looks_like_timestamp = key
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| (10..=13).contains(&run.len()))
        .filter_map(|run| run.parse::<u64>().ok())
        .any(|value| PLAUSIBLE_SECONDS.contains(&value) || PLAUSIBLE_MILLIS.contains(&value));

    if looks_like_timestamp {
        IdempotencyKeyCheck::LooksLikeTimestamp
    } else {
        IdempotencyKeyCheck::Ok
    }
}

/// Maps idempotency keys to the invocation which owns them and, once committed, its outcome.
#[derive(Debug, Clone)]
pub struct DeduplicationIndex<S> {
    storage: S,
    retention: Duration,
}

impl<S: DeduplicationTable> DeduplicationIndex<S> {
    pub fn new(storage: S, retention: Duration) -> Self {
        Self { storage, retention }
    }

    /// Reserves the key for `invocation_id` unless a live record exists. Concurrent callers for
    /// the same key get exactly one reservation.
    pub async fn check_or_reserve(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        now: MillisSinceEpoch,
    ) -> Result<ReserveOutcome> {
        let outcome = self
            .storage
            .reserve_idempotency_id(idempotency_id, invocation_id, now)
            .await?;
        if let ReserveOutcome::Reserved {
            replaced: Some(replaced),
        } = &outcome
        {
            debug!("Idempotency key {idempotency_id} expired, replacing {replaced}");
        }
        Ok(outcome)
    }

    /// Stores the outcome, retained until `now` plus the retention.
    pub async fn commit(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        outcome: EntryResult,
        now: MillisSinceEpoch,
    ) -> Result<()> {
        self.storage
            .commit_idempotency_id(idempotency_id, invocation_id, outcome, now + self.retention)
            .await
    }

    pub async fn get(&self, idempotency_id: &IdempotencyId) -> Result<Option<DedupRecord>> {
        self.storage.get_dedup_record(idempotency_id).await
    }

    /// Drops expired records, returning the invocations they pointed to.
    pub async fn purge_expired(&self, now: MillisSinceEpoch) -> Result<Vec<InvocationId>> {
        self.storage.purge_expired_dedup_records(now).await
    }
}
