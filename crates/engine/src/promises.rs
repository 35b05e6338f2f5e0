// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable promises: named futures owned by an invocation and settled exactly once, possibly by
//! another invocation or by an external caller.

use bytes::Bytes;
use bytestring::ByteString;
use tracing::debug;

use durable_storage_api::Result;
use durable_storage_api::promise_table::{PromiseState, PromiseTable, SettleOutcome};
use durable_types::errors::{TerminalError, codes};
use durable_types::identifiers::InvocationId;
use durable_types::invocation::{InvocationTarget, WaitCondition};
use durable_types::journal::{Entry, EntryResult, EntryType};

use crate::context::Context;
use crate::error::HandlerError;
use crate::timers::TimerHandle;

/// Reference to a durable promise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DurablePromise {
    owner: InvocationId,
    name: ByteString,
}

impl DurablePromise {
    pub fn owner(&self) -> InvocationId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn wait_condition(&self) -> WaitCondition {
        WaitCondition::Promise {
            owner: self.owner,
            name: self.name.clone(),
        }
    }

    fn matches(&self, owner: &InvocationId, name: &str) -> bool {
        &self.owner == owner && self.name == name
    }
}

/// Which of the awaited futures of [`Context::await_first`] completed first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstCompleted {
    Promise(std::result::Result<Bytes, TerminalError>),
    Timer,
}

/// Promise operations of the engine on top of the promise table.
#[derive(Debug, Clone)]
pub(crate) struct PromiseRegistry<S> {
    storage: S,
}

impl<S: PromiseTable> PromiseRegistry<S> {
    pub(crate) fn new(storage: S) -> Self {
        Self { storage }
    }

    pub(crate) async fn create(&self, owner: &InvocationId, name: ByteString) -> Result<PromiseState> {
        self.storage.create_promise(owner, name).await
    }

    /// Returns the outcome of a settled promise, otherwise registers `listener`.
    pub(crate) async fn listen(
        &self,
        owner: &InvocationId,
        name: ByteString,
        listener: InvocationId,
    ) -> Result<Option<EntryResult>> {
        let state = self
            .storage
            .add_promise_listener(owner, name, listener)
            .await?;
        Ok(state.outcome().cloned())
    }

    /// Settles the promise exactly once. Returns the invocations to wake up, none if the promise
    /// was settled already.
    pub(crate) async fn settle(
        &self,
        owner: &InvocationId,
        name: ByteString,
        result: EntryResult,
    ) -> Result<Vec<InvocationId>> {
        match self
            .storage
            .settle_promise(owner, name.clone(), result)
            .await?
        {
            SettleOutcome::Settled { listeners } => {
                debug!(
                    "Settled promise {owner}/{name}, waking up {} listeners",
                    listeners.len()
                );
                Ok(listeners)
            }
            SettleOutcome::AlreadySettled(_) => {
                debug!("Ignoring settlement of the already settled promise {owner}/{name}");
                Ok(Vec::new())
            }
        }
    }

    pub(crate) async fn get(
        &self,
        owner: &InvocationId,
        name: &str,
    ) -> Result<Option<EntryResult>> {
        Ok(self
            .storage
            .get_promise(owner, name)
            .await?
            .and_then(|state| state.outcome().cloned()))
    }

    pub(crate) async fn delete_all(&self, owner: &InvocationId) -> Result<()> {
        self.storage.delete_promises(owner).await
    }
}

impl Context {
    /// Creates the promise `name` owned by this invocation. Names are unique per invocation.
    pub async fn promise(&mut self, name: &str) -> std::result::Result<DurablePromise, HandlerError> {
        let promise = DurablePromise {
            owner: self.invocation_id,
            name: ByteString::from(name),
        };
        if !self.promise_names.insert(promise.name.clone()) {
            return Err(TerminalError::duplicate_operation(format!(
                "promise '{name}' was created already by {}",
                self.invocation_id
            ))
            .into());
        }

        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::PromiseCreate { name: recorded } if recorded == name => Ok(promise),
                other => Err(self.mismatch(index, EntryType::PromiseCreate, Some(name), &other)),
            };
        }

        self.runtime
            .create_promise(promise.owner, promise.name.clone())
            .await?;
        self.append(Entry::PromiseCreate {
            name: promise.name.clone(),
        })
        .await?;
        Ok(promise)
    }

    /// Reference to the promise `name` of the workflow instance this handler belongs to. It is
    /// owned by the workflow run invocation, so any handler of the workflow can settle it.
    pub fn workflow_promise(&self, name: &str) -> std::result::Result<DurablePromise, HandlerError> {
        match &self.target {
            InvocationTarget::Workflow {
                name: service, key, ..
            } => Ok(DurablePromise {
                owner: InvocationId::for_workflow(service, key),
                name: ByteString::from(name),
            }),
            _ => Err(TerminalError::new(
                codes::BAD_REQUEST,
                format!("{} is not a workflow handler", self.target),
            )
            .into()),
        }
    }

    /// Waits for the promise to be settled. A rejection is returned as a terminal error.
    pub async fn await_promise(
        &mut self,
        promise: &DurablePromise,
    ) -> std::result::Result<Bytes, HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::PromiseOutcome {
                    owner,
                    name,
                    result,
                } if promise.matches(&owner, &name) => {
                    Ok(std::result::Result::<Bytes, TerminalError>::from(result)?)
                }
                other => Err(self.mismatch(
                    index,
                    EntryType::PromiseOutcome,
                    Some(promise.name()),
                    &other,
                )),
            };
        }

        match self
            .runtime
            .listen_promise(promise.owner, promise.name.clone(), self.invocation_id)
            .await?
        {
            Some(result) => {
                self.record_promise_outcome(promise, result.clone()).await?;
                Ok(std::result::Result::<Bytes, TerminalError>::from(result)?)
            }
            None => Err(self.suspend(vec![promise.wait_condition()])),
        }
    }

    pub async fn resolve_promise(
        &mut self,
        promise: &DurablePromise,
        value: Bytes,
    ) -> std::result::Result<(), HandlerError> {
        self.settle_promise(promise, EntryResult::Success(value))
            .await
    }

    pub async fn reject_promise(
        &mut self,
        promise: &DurablePromise,
        error: TerminalError,
    ) -> std::result::Result<(), HandlerError> {
        self.settle_promise(promise, EntryResult::Failure(error))
            .await
    }

    /// Settling an already settled promise is not an error: the first outcome is kept.
    async fn settle_promise(
        &mut self,
        promise: &DurablePromise,
        result: EntryResult,
    ) -> std::result::Result<(), HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::PromiseSettle { owner, name, .. } if promise.matches(&owner, &name) => {
                    Ok(())
                }
                other => Err(self.mismatch(
                    index,
                    EntryType::PromiseSettle,
                    Some(promise.name()),
                    &other,
                )),
            };
        }

        self.runtime
            .settle_promise(promise.owner, promise.name.clone(), result.clone())
            .await?;
        self.append(Entry::PromiseSettle {
            owner: promise.owner,
            name: promise.name.clone(),
            result,
        })
        .await?;
        Ok(())
    }

    /// Races the promise against the timer. The loser stays untouched: the promise can still be
    /// settled, the timer still fires, but neither affects this invocation anymore.
    pub async fn await_first(
        &mut self,
        promise: &DurablePromise,
        timer: &TimerHandle,
    ) -> std::result::Result<FirstCompleted, HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::PromiseOutcome {
                    owner,
                    name,
                    result,
                } if promise.matches(&owner, &name) => Ok(FirstCompleted::Promise(result.into())),
                Entry::TimerFired { sleep_index } if sleep_index == timer.sleep_index => {
                    Ok(FirstCompleted::Timer)
                }
                other => Err(self.mismatch(
                    index,
                    EntryType::PromiseOutcome,
                    Some(promise.name()),
                    &other,
                )),
            };
        }

        if let Some(result) = self
            .runtime
            .listen_promise(promise.owner, promise.name.clone(), self.invocation_id)
            .await?
        {
            self.record_promise_outcome(promise, result.clone()).await?;
            return Ok(FirstCompleted::Promise(result.into()));
        }
        if self.runtime.now() >= timer.fire_at {
            self.append(Entry::TimerFired {
                sleep_index: timer.sleep_index,
            })
            .await?;
            return Ok(FirstCompleted::Timer);
        }
        Err(self.suspend(vec![promise.wait_condition(), timer.wait_condition()]))
    }

    async fn record_promise_outcome(
        &mut self,
        promise: &DurablePromise,
        result: EntryResult,
    ) -> std::result::Result<(), HandlerError> {
        self.append(Entry::PromiseOutcome {
            owner: promise.owner,
            name: promise.name.clone(),
            result,
        })
        .await?;
        Ok(())
    }
}
