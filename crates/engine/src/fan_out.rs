// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sub-invocations and fan-out/fan-in.
//!
//! Starting a sub-invocation records a `Call` entry carrying the id of the child. The id is
//! derived from the parent incarnation and the journal index, so a replayed parent re-attaches to the
//! same child instead of dispatching a new one. Every completion the parent observes is recorded
//! as a `CallCompleted` entry, in the order the parent observed them.

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;

use durable_types::errors::{TerminalError, codes};
use durable_types::identifiers::{EntryIndex, InvocationId};
use durable_types::invocation::Invocation;
use durable_types::journal::{Entry, EntryResult, EntryType};

use crate::context::Context;
use crate::error::HandlerError;
use crate::registry::Address;

/// A started sub-invocation whose outcome can be awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHandle {
    pub(crate) call_index: EntryIndex,
    pub(crate) invocation_id: InvocationId,
}

impl CallHandle {
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }
}

type Completion = (usize, EntryIndex, Result<EntryResult, HandlerError>);

impl Context {
    async fn start_call(
        &mut self,
        address: &Address,
        argument: Bytes,
        caller_chain: Vec<InvocationId>,
    ) -> Result<CallHandle, HandlerError> {
        let target = self.runtime.resolve(address)?;
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::Call {
                    target: recorded,
                    invocation_id,
                } if recorded == target => Ok(CallHandle {
                    call_index: index,
                    invocation_id,
                }),
                other => Err(self.mismatch(
                    index,
                    EntryType::Call,
                    Some(target.to_string().as_str()),
                    &other,
                )),
            };
        }

        let call_index = self.next_index();
        let invocation_id =
            InvocationId::for_child(&self.invocation_id, self.incarnation, call_index);
        let invocation = Invocation {
            caller_chain,
            ..Invocation::new(invocation_id, target.clone(), argument)
        };
        // the child id is deterministic, starting it again after a crash is a no-op
        self.runtime.start_invocation(invocation).await?;
        self.append(Entry::Call {
            target,
            invocation_id,
        })
        .await?;
        Ok(CallHandle {
            call_index,
            invocation_id,
        })
    }

    pub(crate) fn callee_chain(&self) -> Vec<InvocationId> {
        let mut chain = self.caller_chain.clone();
        chain.push(self.invocation_id);
        chain
    }

    /// Calls the handler and waits for its outcome. A terminal failure of the callee is returned
    /// as a terminal error.
    pub async fn call(&mut self, address: &Address, argument: Bytes) -> Result<Bytes, HandlerError> {
        let handle = self.start_call(address, argument, self.callee_chain()).await?;
        self.await_call(&handle).await
    }

    /// Starts the handler without waiting for it. The callee runs independently of this
    /// invocation.
    pub async fn send(
        &mut self,
        address: &Address,
        argument: Bytes,
    ) -> Result<InvocationId, HandlerError> {
        let handle = self.start_call(address, argument, Vec::new()).await?;
        Ok(handle.invocation_id)
    }

    /// Starts all the sub-invocations before any of them is awaited.
    pub async fn dispatch(
        &mut self,
        calls: Vec<(Address, Bytes)>,
    ) -> Result<Vec<CallHandle>, HandlerError> {
        let caller_chain = self.callee_chain();
        let mut handles = Vec::with_capacity(calls.len());
        for (address, argument) in calls {
            handles.push(
                self.start_call(&address, argument, caller_chain.clone())
                    .await?,
            );
        }
        Ok(handles)
    }

    pub async fn await_call(&mut self, handle: &CallHandle) -> Result<Bytes, HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::CallCompleted { call_index, result } if call_index == handle.call_index => {
                    Ok(Result::<Bytes, TerminalError>::from(result)?)
                }
                other => Err(self.mismatch(index, EntryType::CallCompleted, None, &other)),
            };
        }

        let result = self
            .runtime
            .await_invocation(handle.invocation_id)
            .await?;
        self.append(Entry::CallCompleted {
            call_index: handle.call_index,
            result: result.clone(),
        })
        .await?;
        Ok(Result::<Bytes, TerminalError>::from(result)?)
    }

    /// Yields the outcomes of the sub-invocations in completion order, failures included.
    pub fn join_all(&mut self, handles: Vec<CallHandle>) -> JoinAll<'_> {
        JoinAll {
            ctx: self,
            pending: handles.into_iter().enumerate().collect(),
            running: None,
        }
    }

    /// Outcome of the first sub-invocation to complete, with its position in `handles`. The
    /// others keep running, their outcomes are not observed.
    pub async fn join_first(
        &mut self,
        handles: Vec<CallHandle>,
    ) -> Result<(usize, Result<Bytes, TerminalError>), HandlerError> {
        match self.join_all(handles).next().await? {
            Some(first) => Ok(first),
            None => Err(TerminalError::new(
                codes::BAD_REQUEST,
                "join_first requires at least one call",
            )
            .into()),
        }
    }
}

/// Stream of sub-invocation outcomes returned by [`Context::join_all`].
pub struct JoinAll<'a> {
    ctx: &'a mut Context,
    /// Position in the joined handles and the handle, for the outcomes not observed yet.
    pending: Vec<(usize, CallHandle)>,
    running: Option<FuturesUnordered<BoxFuture<'static, Completion>>>,
}

impl JoinAll<'_> {
    /// Next outcome with the position of its handle, `None` once every outcome was yielded.
    pub async fn next(
        &mut self,
    ) -> Result<Option<(usize, Result<Bytes, TerminalError>)>, HandlerError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        if let Some((index, entry)) = self.ctx.next_replayed()? {
            let position = match &entry {
                Entry::CallCompleted { call_index, .. } => self.take_pending(*call_index),
                _ => None,
            };
            return match (position, entry) {
                (Some(position), Entry::CallCompleted { result, .. }) => {
                    Ok(Some((position, result.into())))
                }
                (_, other) => Err(self.ctx.mismatch(
                    index,
                    EntryType::CallCompleted,
                    None,
                    &other,
                )),
            };
        }

        let runtime = &self.ctx.runtime;
        let pending = &self.pending;
        let running = self.running.get_or_insert_with(|| {
            pending
                .iter()
                .map(|(position, handle)| {
                    let position = *position;
                    let call_index = handle.call_index;
                    let completion = runtime.await_invocation(handle.invocation_id);
                    let fut: BoxFuture<'static, Completion> = Box::pin(async move {
                        (position, call_index, completion.await)
                    });
                    fut
                })
                .collect()
        });

        let Some((completed_position, call_index, result)) = running.next().await else {
            return Ok(None);
        };
        let result = result?;
        self.ctx
            .append(Entry::CallCompleted {
                call_index,
                result: result.clone(),
            })
            .await?;
        // a handle joined more than once completes once per copy, positions are handed out the
        // way replay hands them out
        let position = self.take_pending(call_index).unwrap_or(completed_position);
        Ok(Some((position, result.into())))
    }

    /// Removes the first pending copy of the call, returning its position.
    fn take_pending(&mut self, call_index: EntryIndex) -> Option<usize> {
        let pending_position = self
            .pending
            .iter()
            .position(|(_, handle)| handle.call_index == call_index)?;
        Some(self.pending.remove(pending_position).0)
    }

    /// Collects the remaining outcomes, in completion order.
    pub async fn collect(
        mut self,
    ) -> Result<Vec<(usize, Result<Bytes, TerminalError>)>, HandlerError> {
        let mut outcomes = Vec::with_capacity(self.pending.len());
        while let Some(outcome) = self.next().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
