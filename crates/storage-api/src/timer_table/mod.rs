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

use durable_types::identifiers::{EntryIndex, InvocationId};
use durable_types::time::MillisSinceEpoch;

use crate::Result;

/// Durable timer completing the sleep journal entry `sleep_index` of an invocation.
///
/// # Important
/// Timers are read in the order of [`TimerKey`]: fire time, then invocation id, then journal
/// index. The timer service relies on this order to process each timer exactly once, so the
/// field order of this struct must not change.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct TimerKey {
    pub fire_at: MillisSinceEpoch,
    pub invocation_id: InvocationId,
    pub sleep_index: EntryIndex,
}

impl TimerKey {
    pub fn new(fire_at: MillisSinceEpoch, invocation_id: InvocationId, sleep_index: EntryIndex) -> Self {
        Self {
            fire_at,
            invocation_id,
            sleep_index,
        }
    }
}

impl durable_types::timer::TimerKey for TimerKey {
    fn wake_up_time(&self) -> MillisSinceEpoch {
        self.fire_at
    }
}

impl durable_types::timer::Timer for TimerKey {
    type TimerKey = TimerKey;

    fn timer_key(&self) -> &Self::TimerKey {
        self
    }
}

pub trait TimerTable {
    fn put_timer(&self, timer_key: &TimerKey) -> impl Future<Output = Result<()>> + Send;

    fn delete_timer(&self, timer_key: &TimerKey) -> impl Future<Output = Result<()>> + Send;

    /// Up to `limit` timers strictly greater than `exclusive_start`, in [`TimerKey`] order.
    fn next_timers_greater_than(
        &self,
        exclusive_start: Option<&TimerKey>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TimerKey>>> + Send;
}
