// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Saga compensations.
//!
//! A compensation is registered unarmed before its forward step, and armed once the forward step
//! succeeded. Running the compensations walks them in reverse registration order: armed ones are
//! executed as sub-invocations, unarmed ones are discarded. Every entry is attempted regardless of
//! the outcome of the previous ones.

use std::future::Future;

use bytes::Bytes;
use tracing::{debug, warn};

use durable_storage_api::Result;
use durable_storage_api::compensation_table::{Compensation, CompensationTable};
use durable_types::errors::TerminalError;
use durable_types::identifiers::{EntryIndex, InvocationId};
use durable_types::journal::{Entry, EntryResult, EntryType};

use crate::context::Context;
use crate::error::HandlerError;
use crate::registry::Address;

/// Handle on a registered compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationHandle {
    index: EntryIndex,
}

impl CompensationHandle {
    pub fn index(&self) -> EntryIndex {
        self.index
    }
}

/// Outcome of running the compensations of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Executed compensations in execution order, with their outcome.
    pub executed: Vec<(EntryIndex, EntryResult)>,
    /// Number of unarmed compensations dropped without execution.
    pub discarded: u32,
}

impl CompensationReport {
    pub fn failed(&self) -> impl Iterator<Item = (EntryIndex, &TerminalError)> {
        self.executed.iter().filter_map(|(index, result)| match result {
            EntryResult::Failure(err) => Some((*index, err)),
            EntryResult::Success(_) => None,
        })
    }
}

/// Compensations of an invocation, see [`Context::compensations`].
pub struct Compensations<'a> {
    ctx: &'a mut Context,
}

impl Context {
    pub fn compensations(&mut self) -> Compensations<'_> {
        Compensations { ctx: self }
    }
}

impl Compensations<'_> {
    /// Registers the handler invocation undoing the next forward step. The compensation only
    /// runs if it is armed.
    pub async fn register(
        &mut self,
        address: &Address,
        argument: Bytes,
    ) -> std::result::Result<CompensationHandle, HandlerError> {
        let ctx = &mut *self.ctx;
        let target = ctx.runtime.resolve(address)?;
        if let Some((index, entry)) = ctx.next_replayed()? {
            return match entry {
                Entry::CompensationRegistered {
                    target: recorded, ..
                } if recorded == target => Ok(CompensationHandle { index }),
                other => Err(ctx.mismatch(
                    index,
                    EntryType::CompensationRegistered,
                    Some(target.to_string().as_str()),
                    &other,
                )),
            };
        }

        let index = ctx.next_index();
        ctx.runtime
            .put_compensation(
                ctx.invocation_id,
                index,
                Compensation {
                    target: target.clone(),
                    argument: argument.clone(),
                    armed: false,
                },
            )
            .await?;
        ctx.append(Entry::CompensationRegistered { target, argument })
            .await?;
        Ok(CompensationHandle { index })
    }

    /// Marks the compensation eligible for execution. Call it after the forward step succeeded.
    pub async fn arm(
        &mut self,
        handle: &CompensationHandle,
    ) -> std::result::Result<(), HandlerError> {
        let ctx = &mut *self.ctx;
        if let Some((index, entry)) = ctx.next_replayed()? {
            return match entry {
                Entry::CompensationArmed { index: armed } if armed == handle.index => Ok(()),
                other => Err(ctx.mismatch(index, EntryType::CompensationArmed, None, &other)),
            };
        }

        if !ctx
            .runtime
            .arm_compensation(ctx.invocation_id, handle.index)
            .await?
        {
            // ran already, through an earlier run_all
            debug!(
                "Compensation {} of {} is gone, not arming it",
                handle.index, ctx.invocation_id
            );
        }
        ctx.append(Entry::CompensationArmed {
            index: handle.index,
        })
        .await?;
        Ok(())
    }

    /// Runs the registered compensations now, in reverse registration order.
    pub async fn run_all(&mut self) -> std::result::Result<CompensationReport, HandlerError> {
        let ctx = &mut *self.ctx;
        if let Some((index, entry)) = ctx.next_replayed()? {
            return match entry {
                Entry::CompensationsRan {
                    executed,
                    discarded,
                } => Ok(CompensationReport {
                    executed,
                    discarded,
                }),
                other => Err(ctx.mismatch(index, EntryType::CompensationsRan, None, &other)),
            };
        }

        let report = ctx
            .runtime
            .run_compensations(ctx.invocation_id, ctx.callee_chain())
            .await?;
        ctx.append(Entry::CompensationsRan {
            executed: report.executed.clone(),
            discarded: report.discarded,
        })
        .await?;
        Ok(report)
    }
}

/// Walks the compensations of `owner` in reverse registration order. Armed ones are passed to
/// `execute`, unarmed ones are dropped. An entry is deleted once it was attempted, so a repeated
/// walk only sees the entries a crash interrupted.
pub(crate) async fn run_all<S, F, Fut>(
    storage: &S,
    owner: &InvocationId,
    mut execute: F,
) -> Result<CompensationReport>
where
    S: CompensationTable,
    F: FnMut(EntryIndex, Compensation) -> Fut,
    Fut: Future<Output = EntryResult>,
{
    let mut report = CompensationReport::default();
    let mut compensations = storage.get_compensations(owner).await?;
    compensations.sort_by_key(|(index, _)| *index);

    for (index, compensation) in compensations.into_iter().rev() {
        if compensation.armed {
            let target = compensation.target.clone();
            let outcome = execute(index, compensation).await;
            if let EntryResult::Failure(err) = &outcome {
                warn!("Compensation {index} ({target}) of {owner} failed: {err}");
            }
            report.executed.push((index, outcome));
        } else {
            debug!("Discarding unarmed compensation {index} of {owner}");
            report.discarded += 1;
        }
        storage.delete_compensation(owner, index).await?;
    }

    Ok(report)
}
