// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lifecycle notifications of the engine.

use std::time::Duration;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use durable_types::errors::TerminalError;
use durable_types::identifiers::{EntryIndex, InvocationId};
use durable_types::invocation::{InvocationTarget, WaitCondition};
use durable_types::journal::EntryResult;

use crate::metric_definitions::{
    ENGINE_COMPENSATIONS, ENGINE_INVOCATION_RETRIES, ENGINE_INVOCATIONS, ENGINE_RETRY_DELAY,
    EVENT_COMPLETED, EVENT_FAILED, EVENT_RESUMED, EVENT_STARTED, EVENT_SUSPENDED,
    OUTCOME_FAILURE, OUTCOME_SUCCESS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationEvent {
    pub invocation_id: InvocationId,
    pub invocation_target: InvocationTarget,
    pub kind: InvocationEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationEventKind {
    Started,
    Suspended { waiting_for: Vec<WaitCondition> },
    Resumed,
    Retrying {
        attempt: usize,
        next_retry_in: Duration,
    },
    Completed,
    Failed { error: TerminalError },
    CompensationExecuted {
        index: EntryIndex,
        outcome: EntryResult,
    },
}

/// Receives the lifecycle events of invocations. Called inline by the engine: implementations
/// must return quickly and never block.
pub trait EventSink: Send + Sync + 'static {
    fn notify(&self, event: &InvocationEvent);
}

/// Logs every event and records it in the engine metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn notify(&self, event: &InvocationEvent) {
        let id = &event.invocation_id;
        let target = &event.invocation_target;
        match &event.kind {
            InvocationEventKind::Started => {
                debug!(invocation.id = %id, invocation.target = %target, "Invocation started");
                counter!(ENGINE_INVOCATIONS, "event" => EVENT_STARTED).increment(1);
            }
            InvocationEventKind::Resumed => {
                debug!(invocation.id = %id, invocation.target = %target, "Invocation resumed");
                counter!(ENGINE_INVOCATIONS, "event" => EVENT_RESUMED).increment(1);
            }
            InvocationEventKind::Suspended { waiting_for } => {
                debug!(
                    invocation.id = %id,
                    invocation.target = %target,
                    "Invocation suspended waiting for {waiting_for:?}"
                );
                counter!(ENGINE_INVOCATIONS, "event" => EVENT_SUSPENDED).increment(1);
            }
            InvocationEventKind::Retrying {
                attempt,
                next_retry_in,
            } => {
                warn!(
                    invocation.id = %id,
                    invocation.target = %target,
                    "Retrying invocation (attempt {attempt}) in {next_retry_in:?}"
                );
                counter!(ENGINE_INVOCATION_RETRIES).increment(1);
                histogram!(ENGINE_RETRY_DELAY).record(next_retry_in.as_secs_f64());
            }
            InvocationEventKind::Completed => {
                info!(invocation.id = %id, invocation.target = %target, "Invocation completed");
                counter!(ENGINE_INVOCATIONS, "event" => EVENT_COMPLETED).increment(1);
            }
            InvocationEventKind::Failed { error } => {
                info!(
                    invocation.id = %id,
                    invocation.target = %target,
                    "Invocation failed: {error}"
                );
                counter!(ENGINE_INVOCATIONS, "event" => EVENT_FAILED).increment(1);
            }
            InvocationEventKind::CompensationExecuted { index, outcome } => {
                let outcome = match outcome {
                    EntryResult::Success(_) => OUTCOME_SUCCESS,
                    EntryResult::Failure(err) => {
                        warn!(
                            invocation.id = %id,
                            "Compensation {index} failed: {err}"
                        );
                        OUTCOME_FAILURE
                    }
                };
                counter!(ENGINE_COMPENSATIONS, "outcome" => outcome).increment(1);
            }
        }
    }
}
