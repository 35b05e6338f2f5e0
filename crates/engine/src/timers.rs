// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable timers.
//!
//! A timer records its absolute fire time in the journal. Replay reads the recorded time instead
//! of computing it again, so a restart in the middle of a sleep keeps the original deadline.

use std::time::Duration;

use tracing::{error, warn};

use durable_storage_api::timer_table::{TimerKey, TimerTable};
use durable_timer::TimerReader;
use durable_types::errors::MaybeRetryableError;
use durable_types::identifiers::EntryIndex;
use durable_types::invocation::WaitCondition;
use durable_types::journal::{Entry, EntryType};
use durable_types::retries::RetryPolicy;
use durable_types::time::MillisSinceEpoch;

use crate::context::Context;
use crate::error::HandlerError;

/// A durable timer created by [`Context::after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub(crate) sleep_index: EntryIndex,
    pub(crate) fire_at: MillisSinceEpoch,
}

impl TimerHandle {
    pub fn fire_at(&self) -> MillisSinceEpoch {
        self.fire_at
    }

    pub(crate) fn wait_condition(&self) -> WaitCondition {
        WaitCondition::Timer {
            sleep_index: self.sleep_index,
            fire_at: self.fire_at,
        }
    }
}

impl Context {
    /// Creates a timer firing after `duration` without waiting for it.
    pub async fn after(&mut self, duration: Duration) -> Result<TimerHandle, HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::Sleep { fire_at } => Ok(TimerHandle {
                    sleep_index: index,
                    fire_at,
                }),
                other => Err(self.mismatch(index, EntryType::Sleep, None, &other)),
            };
        }

        let handle = TimerHandle {
            sleep_index: self.next_index(),
            fire_at: self.runtime.now() + duration,
        };
        // a timer stored without its journal entry fires without effect
        self.runtime
            .schedule_timer(TimerKey::new(
                handle.fire_at,
                self.invocation_id,
                handle.sleep_index,
            ))
            .await?;
        self.append(Entry::Sleep {
            fire_at: handle.fire_at,
        })
        .await?;
        Ok(handle)
    }

    /// Waits until the timer fired. Suspends the invocation if it is not due yet.
    pub async fn await_timer(&mut self, timer: &TimerHandle) -> Result<(), HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::TimerFired { sleep_index } if sleep_index == timer.sleep_index => Ok(()),
                other => Err(self.mismatch(index, EntryType::TimerFired, None, &other)),
            };
        }

        if self.runtime.now() < timer.fire_at {
            return Err(self.suspend(vec![timer.wait_condition()]));
        }
        self.append(Entry::TimerFired {
            sleep_index: timer.sleep_index,
        })
        .await?;
        Ok(())
    }

    /// Durable sleep: [`Context::after`] followed by [`Context::await_timer`].
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), HandlerError> {
        let timer = self.after(duration).await?;
        self.await_timer(&timer).await
    }
}

/// Reads durable timers from storage for the timer service.
#[derive(Debug, Clone)]
pub(crate) struct StorageTimerReader<S> {
    storage: S,
    retry_policy: RetryPolicy,
}

impl<S> StorageTimerReader<S> {
    pub(crate) fn new(storage: S) -> Self {
        Self {
            storage,
            retry_policy: RetryPolicy::exponential(
                Duration::from_millis(10),
                2.0,
                None,
                Some(Duration::from_secs(1)),
            ),
        }
    }
}

impl<S> TimerReader<TimerKey> for StorageTimerReader<S>
where
    S: TimerTable + Clone + Send + Sync + 'static,
{
    async fn get_timers(
        &mut self,
        num_timers: usize,
        previous_timer_key: Option<TimerKey>,
    ) -> Vec<TimerKey> {
        let storage = &self.storage;
        let result = self
            .retry_policy
            .clone()
            .retry_if(
                || storage.next_timers_greater_than(previous_timer_key.as_ref(), num_timers),
                |err| {
                    warn!("Failed reading timers, retrying: {err}");
                    err.retryable()
                },
            )
            .await;

        result.unwrap_or_else(|err| {
            error!("Failed reading timers after {previous_timer_key:?}: {err}");
            Vec::new()
        })
    }
}
