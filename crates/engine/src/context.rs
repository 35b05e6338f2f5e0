// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The handler-facing side of an invocation.
//!
//! Every non-deterministic operation a handler performs goes through the [`Context`]. The context
//! walks the journal of the invocation: as long as there are recorded entries, operations return
//! the recorded outcome and are not executed again. Past the last recorded entry operations are
//! executed and their outcome is appended to the journal before it is returned to the handler.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use durable_storage_api::StorageError;
use durable_storage_api::compensation_table::Compensation;
use durable_storage_api::promise_table::PromiseState;
use durable_storage_api::timer_table::TimerKey;
use durable_types::errors::{TerminalError, codes};
use durable_types::identifiers::{EntryIndex, InvocationId, ServiceId};
use durable_types::invocation::{Invocation, InvocationTarget, WaitCondition};
use durable_types::journal::{Entry, EntryResult, EntryType, JournalEntry, ValueKind};
use durable_types::time::MillisSinceEpoch;

use crate::error::{HandlerError, Suspension};
use crate::registry::Address;
use crate::saga::CompensationReport;

/// Engine services the context needs. Object safe, so that [`Context`] doesn't carry the
/// storage and clock type parameters of the engine.
pub(crate) trait Runtime: Send + Sync + 'static {
    fn now(&self) -> MillisSinceEpoch;

    fn resolve(&self, address: &Address) -> Result<InvocationTarget, TerminalError>;

    fn append_entry(
        &self,
        invocation_id: InvocationId,
        entry: JournalEntry,
    ) -> BoxFuture<'_, Result<(), StorageError>>;

    fn get_state(
        &self,
        service_id: ServiceId,
        name: ByteString,
    ) -> BoxFuture<'_, Result<Option<Bytes>, StorageError>>;

    fn set_state(
        &self,
        service_id: ServiceId,
        name: ByteString,
        value: Bytes,
    ) -> BoxFuture<'_, Result<(), StorageError>>;

    fn clear_state(
        &self,
        service_id: ServiceId,
        name: ByteString,
    ) -> BoxFuture<'_, Result<(), StorageError>>;

    fn clear_all_state(&self, service_id: ServiceId) -> BoxFuture<'_, Result<(), StorageError>>;

    fn state_keys(
        &self,
        service_id: ServiceId,
    ) -> BoxFuture<'_, Result<Vec<ByteString>, StorageError>>;

    fn create_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
    ) -> BoxFuture<'_, Result<PromiseState, StorageError>>;

    /// Returns the outcome if the promise is settled, otherwise registers `listener` to be woken
    /// up on settlement.
    fn listen_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
        listener: InvocationId,
    ) -> BoxFuture<'_, Result<Option<EntryResult>, StorageError>>;

    /// Settles the promise unless it is settled already and wakes up its listeners.
    fn settle_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
        result: EntryResult,
    ) -> BoxFuture<'_, Result<(), StorageError>>;

    fn schedule_timer(&self, timer: TimerKey) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Stores and starts the invocation unless it exists already.
    fn start_invocation(&self, invocation: Invocation) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Completes with the outcome of the invocation.
    fn await_invocation(
        &self,
        invocation_id: InvocationId,
    ) -> BoxFuture<'static, Result<EntryResult, HandlerError>>;

    fn put_compensation(
        &self,
        owner: InvocationId,
        index: EntryIndex,
        compensation: Compensation,
    ) -> BoxFuture<'_, Result<(), StorageError>>;

    fn arm_compensation(
        &self,
        owner: InvocationId,
        index: EntryIndex,
    ) -> BoxFuture<'_, Result<bool, StorageError>>;

    fn run_compensations(
        &self,
        owner: InvocationId,
        caller_chain: Vec<InvocationId>,
    ) -> BoxFuture<'_, Result<CompensationReport, StorageError>>;
}

/// Context of one attempt of an invocation, passed to its handler.
///
/// Operations take `&mut self`: a handler performs them one after the other, which keeps the
/// journal order deterministic. Operations which can't complete yet fail with
/// [`HandlerError::Suspended`]; handlers must propagate it.
pub struct Context {
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) invocation_id: InvocationId,
    pub(crate) incarnation: u64,
    pub(crate) target: InvocationTarget,
    pub(crate) caller_chain: Vec<InvocationId>,
    pub(crate) journal: Vec<Entry>,
    /// Index of the next journal entry to replay. Equal to the journal length once replay is over.
    pub(crate) cursor: usize,
    pub(crate) promise_names: HashSet<ByteString>,
    pub(crate) suspension: Option<Suspension>,
}

impl Context {
    pub(crate) fn new(
        runtime: Arc<dyn Runtime>,
        invocation: &Invocation,
        journal: Vec<JournalEntry>,
    ) -> Self {
        Self {
            runtime,
            invocation_id: invocation.invocation_id,
            incarnation: invocation.incarnation,
            target: invocation.invocation_target.clone(),
            caller_chain: invocation.caller_chain.clone(),
            journal: journal.into_iter().map(|entry| entry.entry).collect(),
            cursor: 0,
            promise_names: HashSet::new(),
            suspension: None,
        }
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn target(&self) -> &InvocationTarget {
        &self.target
    }

    /// The key of the virtual object or workflow instance.
    pub fn key(&self) -> Option<&str> {
        self.target.key().map(|key| key.as_ref())
    }

    /// Whether the context is still replaying recorded entries.
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.journal.len()
    }

    // --- Journal

    /// Fails if the context suspended already, hands out the next recorded entry if any.
    pub(crate) fn next_replayed(&mut self) -> Result<Option<(EntryIndex, Entry)>, HandlerError> {
        if let Some(suspension) = &self.suspension {
            return Err(HandlerError::Suspended(suspension.clone()));
        }
        let Some(entry) = self.journal.get(self.cursor).cloned() else {
            return Ok(None);
        };
        let index = self.cursor as EntryIndex;
        self.cursor += 1;
        Ok(Some((index, entry)))
    }

    /// Index the next appended entry gets.
    pub(crate) fn next_index(&self) -> EntryIndex {
        self.journal.len() as EntryIndex
    }

    pub(crate) async fn append(&mut self, entry: Entry) -> Result<EntryIndex, HandlerError> {
        let index = self.next_index();
        self.runtime
            .append_entry(
                self.invocation_id,
                JournalEntry {
                    index,
                    entry: entry.clone(),
                },
            )
            .await?;
        self.journal.push(entry);
        self.cursor = self.journal.len();
        Ok(index)
    }

    pub(crate) fn suspend(&mut self, waiting_for: Vec<WaitCondition>) -> HandlerError {
        let suspension = Suspension::new(waiting_for);
        self.suspension = Some(suspension.clone());
        HandlerError::Suspended(suspension)
    }

    pub(crate) fn mismatch(
        &self,
        index: EntryIndex,
        expected: EntryType,
        name: Option<&str>,
        actual: &Entry,
    ) -> HandlerError {
        let expected = match name {
            Some(name) => format!("{expected} '{name}'"),
            None => expected.to_string(),
        };
        let actual = match actual.operation_name() {
            Some(name) => format!("{} '{name}'", actual.ty()),
            None => actual.ty().to_string(),
        };
        TerminalError::journal_mismatch(format!(
            "invocation {} requested {expected} at journal index {index}, but the journal \
             recorded {actual}",
            self.invocation_id
        ))
        .into()
    }

    // --- Side effects

    /// Executes `action` once and records its outcome. On replay the recorded outcome is returned
    /// without executing `action`.
    ///
    /// A terminal error of `action` is recorded like a success. A retryable error is not
    /// recorded: the invocation is retried and `action` executes again.
    pub async fn run<F, Fut>(&mut self, name: &str, action: F) -> Result<Bytes, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, HandlerError>>,
    {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::Run {
                    name: recorded,
                    result,
                } if recorded == name => Ok(Result::<Bytes, TerminalError>::from(result)?),
                other => Err(self.mismatch(index, EntryType::Run, Some(name), &other)),
            };
        }

        let result = match action().await {
            Ok(value) => EntryResult::Success(value),
            Err(HandlerError::Terminal(err)) => EntryResult::Failure(err),
            Err(err) => return Err(err),
        };
        self.append(Entry::Run {
            name: ByteString::from(name),
            result: result.clone(),
        })
        .await?;
        Ok(Result::<Bytes, TerminalError>::from(result)?)
    }

    /// [`Context::run`] for actions producing JSON serializable values.
    pub async fn run_json<T, F, Fut>(&mut self, name: &str, action: F) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let bytes = self
            .run(name, || async move {
                let value = action().await?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            })
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // --- Non-deterministic values

    async fn value(
        &mut self,
        kind: ValueKind,
        generate: impl FnOnce() -> Bytes,
    ) -> Result<Bytes, HandlerError> {
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::Value {
                    kind: recorded,
                    value,
                } if recorded == kind => Ok(value),
                other => Err(self.mismatch(index, EntryType::Value, None, &other)),
            };
        }
        let value = generate();
        self.append(Entry::Value {
            kind,
            value: value.clone(),
        })
        .await?;
        Ok(value)
    }

    /// Wall clock time, recorded on first execution.
    pub async fn now(&mut self) -> Result<MillisSinceEpoch, HandlerError> {
        let now = self.runtime.now();
        let value = self
            .value(ValueKind::Now, || {
                Bytes::copy_from_slice(&now.as_u64().to_be_bytes())
            })
            .await?;
        Ok(MillisSinceEpoch::new(decode_u64(&value)?))
    }

    pub async fn random_u64(&mut self) -> Result<u64, HandlerError> {
        let value = self
            .value(ValueKind::Random, || {
                Bytes::copy_from_slice(&rand::rng().random::<u64>().to_be_bytes())
            })
            .await?;
        decode_u64(&value)
    }

    /// A random version 4 UUID, recorded on first execution.
    pub async fn random_uuid(&mut self) -> Result<uuid::Uuid, HandlerError> {
        let value = self
            .value(ValueKind::Uuid, || {
                Bytes::copy_from_slice(&rand::rng().random::<[u8; 16]>())
            })
            .await?;
        let bytes: [u8; 16] = value.as_ref().try_into().map_err(|_| {
            TerminalError::journal_mismatch(format!(
                "recorded uuid has {} bytes instead of 16",
                value.len()
            ))
        })?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    // --- State

    fn readable_state(&self) -> Result<ServiceId, HandlerError> {
        match self.target.as_keyed_service_id() {
            Some(service_id) if self.target.invocation_target_ty().can_read_state() => {
                Ok(service_id)
            }
            _ => Err(TerminalError::new(
                codes::BAD_REQUEST,
                format!("{} has no state", self.target),
            )
            .into()),
        }
    }

    fn writable_state(&self) -> Result<ServiceId, HandlerError> {
        let service_id = self.readable_state()?;
        if !self.target.invocation_target_ty().can_write_state() {
            return Err(TerminalError::new(
                codes::STATE_READ_ONLY,
                format!("state is read-only for the shared handler {}", self.target),
            )
            .into());
        }
        Ok(service_id)
    }

    pub async fn get(&mut self, name: &str) -> Result<Option<Bytes>, HandlerError> {
        let service_id = self.readable_state()?;
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::StateGet {
                    name: recorded,
                    value,
                } if recorded == name => Ok(value),
                other => Err(self.mismatch(index, EntryType::StateGet, Some(name), &other)),
            };
        }

        let name = ByteString::from(name);
        let value = self.runtime.get_state(service_id, name.clone()).await?;
        self.append(Entry::StateGet {
            name,
            value: value.clone(),
        })
        .await?;
        Ok(value)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &mut self,
        name: &str,
    ) -> Result<Option<T>, HandlerError> {
        match self.get(name).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes the state entry. Only exclusive handlers can write state.
    pub async fn set(&mut self, name: &str, value: Bytes) -> Result<(), HandlerError> {
        let service_id = self.writable_state()?;
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::StateSet { name: recorded, .. } if recorded == name => Ok(()),
                other => Err(self.mismatch(index, EntryType::StateSet, Some(name), &other)),
            };
        }

        // the write is idempotent, so it goes first: a crash before the append repeats it
        let name = ByteString::from(name);
        self.runtime
            .set_state(service_id, name.clone(), value.clone())
            .await?;
        self.append(Entry::StateSet { name, value }).await?;
        Ok(())
    }

    pub async fn set_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), HandlerError> {
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        self.set(name, bytes).await
    }

    pub async fn clear(&mut self, name: &str) -> Result<(), HandlerError> {
        let service_id = self.writable_state()?;
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::StateClear { name: recorded } if recorded == name => Ok(()),
                other => Err(self.mismatch(index, EntryType::StateClear, Some(name), &other)),
            };
        }

        let name = ByteString::from(name);
        self.runtime.clear_state(service_id, name.clone()).await?;
        self.append(Entry::StateClear { name }).await?;
        Ok(())
    }

    pub async fn clear_all(&mut self) -> Result<(), HandlerError> {
        let service_id = self.writable_state()?;
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::StateClearAll => Ok(()),
                other => Err(self.mismatch(index, EntryType::StateClearAll, None, &other)),
            };
        }

        self.runtime.clear_all_state(service_id).await?;
        self.append(Entry::StateClearAll).await?;
        Ok(())
    }

    /// Names of the state entries, in lexicographic order.
    pub async fn state_keys(&mut self) -> Result<Vec<ByteString>, HandlerError> {
        let service_id = self.readable_state()?;
        if let Some((index, entry)) = self.next_replayed()? {
            return match entry {
                Entry::StateKeys { keys } => Ok(keys),
                other => Err(self.mismatch(index, EntryType::StateKeys, None, &other)),
            };
        }

        let keys = self.runtime.state_keys(service_id).await?;
        self.append(Entry::StateKeys { keys: keys.clone() }).await?;
        Ok(keys)
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, HandlerError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        TerminalError::journal_mismatch(format!(
            "recorded value has {} bytes instead of 8",
            bytes.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
