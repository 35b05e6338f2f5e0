// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use durable_scheduler::Scheduler;
use durable_storage_api::compensation_table::Compensation;
use durable_storage_api::deduplication_table::{DedupRecord, ReserveOutcome};
use durable_storage_api::promise_table::PromiseState;
use durable_storage_api::timer_table::TimerKey;
use durable_storage_api::{Storage, StorageError};
use durable_timer::{Clock, TimerService, TokioClock};
use durable_types::config::EngineOptions;
use durable_types::errors::{TerminalError, codes};
use durable_types::identifiers::{EntryIndex, IdempotencyId, InvocationId, ServiceId};
use durable_types::invocation::{Invocation, InvocationStatus, InvocationTarget, WaitCondition};
use durable_types::journal::{EntryResult, JournalEntry};
use durable_types::time::MillisSinceEpoch;

use crate::context::{Context, Runtime};
use crate::dedup::{DeduplicationIndex, IdempotencyKeyCheck, check_idempotency_key};
use crate::error::{EngineError, HandlerError};
use crate::events::{EventSink, InvocationEvent, InvocationEventKind};
use crate::metric_definitions::{ENGINE_IDEMPOTENCY_KEY_WARNINGS, describe_metrics};
use crate::promises::PromiseRegistry;
use crate::registry::{Address, HandlerRegistry};
use crate::saga::{self, CompensationReport};
use crate::timers::StorageTimerReader;

/// A request to invoke a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub address: Address,
    pub argument: Bytes,
    /// Requests with the same idempotency key for the same handler and key are executed once.
    pub idempotency_key: Option<ByteString>,
}

impl InvocationRequest {
    pub fn new(address: Address, argument: impl Into<Bytes>) -> Self {
        Self {
            address,
            argument: argument.into(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, idempotency_key: impl Into<ByteString>) -> Self {
        self.idempotency_key = Some(idempotency_key.into());
        self
    }
}

/// How a submitted request was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Admission {
    /// A new invocation was created and started.
    Started(InvocationId),
    /// The request belongs to an existing invocation.
    Attached(InvocationId),
    /// The request was deduplicated against a completed invocation.
    Completed {
        invocation_id: InvocationId,
        outcome: EntryResult,
    },
}

impl Admission {
    fn invocation_id(&self) -> InvocationId {
        match self {
            Admission::Started(invocation_id)
            | Admission::Attached(invocation_id)
            | Admission::Completed { invocation_id, .. } => *invocation_id,
        }
    }
}

/// How an execution of an invocation task ended.
enum Exit {
    /// The invocation reached a terminal status.
    Finished,
    /// The invocation suspended. Its task was deregistered while suspending.
    Suspended,
}

/// The invocation engine.
///
/// Every admitted invocation runs in its own task. A task acquires the lease of keyed targets,
/// replays the journal through the handler and either completes the invocation, retries it after
/// retryable errors, or suspends it until one of the conditions it waits for is met. Suspended
/// invocations hold no task and no lease; promise settlements and timers re-spawn them.
pub struct Engine<S, C = TokioClock> {
    inner: Arc<EngineInner<S, C>>,
}

impl<S, C> Clone for Engine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

const STATUS_LOCK_SHARDS: usize = 64;

/// Serializes suspending an invocation with waking it up, so no wake up gets lost. Sharded by
/// invocation id.
struct StatusLocks {
    shards: Box<[tokio::sync::Mutex<()>]>,
}

impl StatusLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        }
    }

    fn shard(&self, invocation_id: &InvocationId) -> &tokio::sync::Mutex<()> {
        let index = invocation_id.as_u128() % self.shards.len() as u128;
        &self.shards[index as usize]
    }

    async fn lock(&self, invocation_id: &InvocationId) -> tokio::sync::MutexGuard<'_, ()> {
        self.shard(invocation_id).lock().await
    }
}

struct EngineInner<S, C> {
    me: Weak<EngineInner<S, C>>,
    storage: S,
    registry: HandlerRegistry,
    options: EngineOptions,
    clock: C,
    scheduler: Scheduler,
    sink: Arc<dyn EventSink>,
    promises: PromiseRegistry<S>,
    dedup: DeduplicationIndex<S>,
    timer_tx: mpsc::UnboundedSender<TimerKey>,
    completions: parking_lot::Mutex<HashMap<InvocationId, watch::Sender<Option<EntryResult>>>>,
    status_locks: StatusLocks,
    /// Tasks of the running invocations. At most one task per invocation.
    active: parking_lot::Mutex<HashMap<InvocationId, AbortHandle>>,
    shutting_down: AtomicBool,
    timer_loop: parking_lot::Mutex<Option<AbortHandle>>,
}

impl<S, C> Engine<S, C>
where
    S: Storage,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Starts the engine: spawns the timer loop and resumes every non-terminal invocation found
    /// in storage.
    pub async fn start(
        storage: S,
        registry: HandlerRegistry,
        options: EngineOptions,
        clock: C,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        describe_metrics();

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|me| EngineInner {
            me: me.clone(),
            promises: PromiseRegistry::new(storage.clone()),
            dedup: DeduplicationIndex::new(storage.clone(), options.idempotency_retention()),
            storage,
            registry,
            clock,
            scheduler: Scheduler::new(),
            sink,
            timer_tx,
            completions: parking_lot::Mutex::new(HashMap::new()),
            status_locks: StatusLocks::new(STATUS_LOCK_SHARDS),
            active: parking_lot::Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            timer_loop: parking_lot::Mutex::new(None),
            options,
        });

        let timer_service = TimerService::new(
            inner.clock.clone(),
            inner.options.timers_in_memory_limit,
            StorageTimerReader::new(inner.storage.clone()),
        );
        let timer_loop = tokio::spawn(EngineInner::run_timer_loop(
            Arc::downgrade(&inner),
            timer_service,
            timer_rx,
        ));
        *inner.timer_loop.lock() = Some(timer_loop.abort_handle());

        inner.recover().await?;
        info!("Invocation engine started");
        Ok(Self { inner })
    }

    /// Invokes the handler and waits for its outcome.
    ///
    /// A request carrying an idempotency key already seen within the retention gets the outcome
    /// of the first request, without executing the handler again.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<Bytes, TerminalError> {
        let outcome = match self.inner.admit(request).await? {
            Admission::Completed { outcome, .. } => outcome,
            admission => {
                self.inner
                    .wait_for_outcome(admission.invocation_id())
                    .await?
            }
        };
        outcome.into()
    }

    /// Submits the request without waiting for its outcome. See [`Engine::attach`].
    pub async fn submit(&self, request: InvocationRequest) -> Result<InvocationId, TerminalError> {
        Ok(self.inner.admit(request).await?.invocation_id())
    }

    /// Waits for the outcome of the invocation.
    pub async fn attach(&self, invocation_id: InvocationId) -> Result<Bytes, TerminalError> {
        self.inner.wait_for_outcome(invocation_id).await?.into()
    }

    pub async fn status(
        &self,
        invocation_id: InvocationId,
    ) -> Result<Option<InvocationStatus>, EngineError> {
        Ok(self
            .inner
            .storage
            .get_invocation(&invocation_id)
            .await?
            .map(|invocation| invocation.status))
    }

    /// Resolves the promise `name` owned by `owner`. Settling an already settled promise is
    /// ignored. The promises of a workflow are owned by its run invocation, see
    /// [`InvocationId::for_workflow`].
    pub async fn resolve_promise(
        &self,
        owner: InvocationId,
        name: impl Into<ByteString>,
        value: Bytes,
    ) -> Result<(), EngineError> {
        Ok(self
            .inner
            .settle_promise(owner, name.into(), EntryResult::Success(value))
            .await?)
    }

    pub async fn reject_promise(
        &self,
        owner: InvocationId,
        name: impl Into<ByteString>,
        error: TerminalError,
    ) -> Result<(), EngineError> {
        Ok(self
            .inner
            .settle_promise(owner, name.into(), EntryResult::Failure(error))
            .await?)
    }

    /// Runs the pending compensations of the invocation.
    pub async fn run_compensations(
        &self,
        invocation_id: InvocationId,
    ) -> Result<CompensationReport, EngineError> {
        if self
            .inner
            .storage
            .get_invocation(&invocation_id)
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(invocation_id));
        }
        Ok(self
            .inner
            .run_compensations(invocation_id, Vec::new())
            .await?)
    }

    /// Drops the expired idempotency records together with the invocations they point to.
    /// Invocations still referred to by a live idempotency record are kept. Returns the deleted
    /// invocations.
    pub async fn purge_expired(&self) -> Result<Vec<InvocationId>, EngineError> {
        let purged = self.inner.dedup.purge_expired(self.inner.clock.now()).await?;
        let mut deleted = Vec::new();
        for invocation_id in purged {
            if self.inner.release_expired(&invocation_id, None).await? {
                deleted.push(invocation_id);
            }
        }
        debug!("Purged {} expired invocations", deleted.len());
        Ok(deleted)
    }

    /// Stops the timer loop and aborts the running invocations. Their progress is durable, a new
    /// engine on the same storage resumes them.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        if let Some(timer_loop) = self.inner.timer_loop.lock().take() {
            timer_loop.abort();
        }
        let active: Vec<_> = self.inner.active.lock().drain().collect();
        for (invocation_id, task) in active {
            trace!("Aborting task of {invocation_id}");
            task.abort();
        }
        info!("Invocation engine shut down");
    }
}

impl<S, C> EngineInner<S, C>
where
    S: Storage,
    C: Clock + Clone + Send + Sync + 'static,
{
    async fn run_timer_loop(
        me: Weak<Self>,
        mut timer_service: TimerService<TimerKey, C, StorageTimerReader<S>>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerKey>,
    ) {
        loop {
            tokio::select! {
                timer = timer_rx.recv() => match timer {
                    Some(timer) => timer_service.add_timer(timer),
                    // the engine is gone
                    None => break,
                },
                timer = timer_service.next_timer() => {
                    let Some(inner) = me.upgrade() else {
                        break;
                    };
                    inner.fire_timer(timer).await;
                }
            }
        }
        debug!("Timer loop stopped");
    }

    async fn fire_timer(&self, timer: TimerKey) {
        trace!("Timer {timer:?} fired");
        let condition = WaitCondition::Timer {
            sleep_index: timer.sleep_index,
            fire_at: timer.fire_at,
        };
        // a failed wake up is caught up by the recovery on the next start
        if let Err(err) = self.wake(timer.invocation_id, &condition).await {
            warn!(
                "Failed waking up {} for its timer: {err}",
                timer.invocation_id
            );
        }
        if let Err(err) = self.storage.delete_timer(&timer).await {
            warn!("Failed deleting fired timer {timer:?}: {err}");
        }
    }

    async fn recover(&self) -> Result<(), StorageError> {
        let invocations = self.storage.scan_non_terminal_invocations().await?;
        debug!("Recovering {} non-terminal invocations", invocations.len());
        for invocation in invocations {
            let invocation_id = invocation.invocation_id;
            match &invocation.status {
                InvocationStatus::Pending | InvocationStatus::Running => self.spawn(invocation_id),
                InvocationStatus::Suspended { waiting_for } => {
                    if self.any_satisfied(waiting_for).await? {
                        self.storage
                            .put_invocation_status(&invocation_id, InvocationStatus::Pending)
                            .await?;
                        self.spawn(invocation_id);
                    }
                }
                InvocationStatus::Completed(_) | InvocationStatus::Failed(_) => {}
            }
        }
        Ok(())
    }

    // --- Admission

    async fn admit(&self, request: InvocationRequest) -> Result<Admission, TerminalError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown.into());
        }

        let target = self.registry.resolve(&request.address)?;
        let invocation_id = InvocationId::generate(&target, request.idempotency_key.as_deref());
        let mut invocation = Invocation::new(invocation_id, target, request.argument);
        if let Some(idempotency_key) = request.idempotency_key {
            self.check_idempotency_key(&invocation.invocation_target, &idempotency_key)?;
            invocation.idempotency_ids.push(IdempotencyId::combine(
                &invocation.invocation_target,
                idempotency_key,
            ));
        }

        Ok(self.admit_invocation(invocation).await?)
    }

    fn check_idempotency_key(
        &self,
        target: &InvocationTarget,
        idempotency_key: &str,
    ) -> Result<(), TerminalError> {
        if check_idempotency_key(idempotency_key) == IdempotencyKeyCheck::Ok {
            return Ok(());
        }

        counter!(ENGINE_IDEMPOTENCY_KEY_WARNINGS).increment(1);
        if self.options.reject_timestamp_like_idempotency_keys {
            return Err(TerminalError::new(
                codes::INVALID_IDEMPOTENCY_KEY,
                format!(
                    "idempotency key '{idempotency_key}' looks like a timestamp, derive it from \
                     a business identifier instead"
                ),
            ));
        }
        warn!(
            "Idempotency key '{idempotency_key}' for {target} looks like a timestamp. Keys \
             derived from the wall clock change between retries and defeat deduplication"
        );
        Ok(())
    }

    async fn admit_invocation(&self, invocation: Invocation) -> Result<Admission, EngineError> {
        let invocation_id = invocation.invocation_id;
        let idempotency_id = invocation.idempotency_ids.first().cloned();

        if let Some(idempotency_id) = &idempotency_id {
            match self
                .dedup
                .check_or_reserve(idempotency_id, invocation_id, self.clock.now())
                .await?
            {
                ReserveOutcome::Existing(DedupRecord::Completed {
                    invocation_id,
                    outcome,
                    ..
                }) => {
                    debug!("Request {idempotency_id} was completed by {invocation_id}");
                    return Ok(Admission::Completed {
                        invocation_id,
                        outcome,
                    });
                }
                ReserveOutcome::Existing(DedupRecord::InFlight {
                    invocation_id: owner,
                }) if owner != invocation_id => {
                    debug!("Request {idempotency_id} is in flight as {owner}");
                    return Ok(Admission::Attached(owner));
                }
                ReserveOutcome::Existing(DedupRecord::InFlight { .. }) => {
                    // the request might have been lost between reserving the key and recording
                    // it, creating or attaching again is idempotent
                    trace!("Request {idempotency_id} is in flight as {invocation_id}");
                }
                ReserveOutcome::Reserved { replaced } => {
                    if let Some(replaced) = replaced {
                        self.release_expired(&replaced, Some(idempotency_id))
                            .await?;
                    }
                }
            }
        }

        match self.storage.put_invocation_if_absent(&invocation).await? {
            Some(existing) => {
                debug!("Attaching to the existing invocation {invocation_id}");
                match &idempotency_id {
                    Some(idempotency_id) => {
                        self.attach_idempotency_id(existing.invocation_id, idempotency_id)
                            .await
                    }
                    None => Ok(Admission::Attached(existing.invocation_id)),
                }
            }
            None => {
                trace!(
                    "Created invocation {invocation_id} of {}",
                    invocation.invocation_target
                );
                self.spawn(invocation_id);
                Ok(Admission::Started(invocation_id))
            }
        }
    }

    /// Records the idempotency id of the request with the existing invocation, which commits it
    /// when it finishes. Commits it right away if the invocation finished already.
    async fn attach_idempotency_id(
        &self,
        invocation_id: InvocationId,
        idempotency_id: &IdempotencyId,
    ) -> Result<Admission, EngineError> {
        let Some(invocation) = self
            .storage
            .add_idempotency_id(&invocation_id, idempotency_id)
            .await?
        else {
            return Err(EngineError::NotFound(invocation_id));
        };
        // finalize commits the ids it reads after storing the outcome, committing twice is fine
        match invocation.status.outcome() {
            Some(outcome) => {
                self.commit_idempotency_id(idempotency_id, invocation_id, outcome.clone())
                    .await?;
                Ok(Admission::Completed {
                    invocation_id,
                    outcome,
                })
            }
            None => Ok(Admission::Attached(invocation_id)),
        }
    }

    /// Deletes the finished invocation an expired idempotency record pointed to, unless one of
    /// its other idempotency records is still live. Invocations admitted without idempotency key
    /// are never deleted this way. Returns whether the invocation was deleted.
    async fn release_expired(
        &self,
        invocation_id: &InvocationId,
        replaced_by: Option<&IdempotencyId>,
    ) -> Result<bool, StorageError> {
        let Some(invocation) = self.storage.get_invocation(invocation_id).await? else {
            return Ok(false);
        };
        if !invocation.status.is_terminal() || invocation.idempotency_ids.is_empty() {
            return Ok(false);
        }

        let now = self.clock.now();
        for idempotency_id in &invocation.idempotency_ids {
            if Some(idempotency_id) == replaced_by {
                continue;
            }
            if self
                .dedup
                .get(idempotency_id)
                .await?
                .is_some_and(|record| !record.is_expired(now))
            {
                trace!("Keeping {invocation_id}, {idempotency_id} still refers to it");
                return Ok(false);
            }
        }

        self.delete_invocation_data(invocation_id).await?;
        Ok(true)
    }

    async fn delete_invocation_data(&self, invocation_id: &InvocationId) -> Result<(), StorageError> {
        self.storage.delete_invocation(invocation_id).await?;
        self.storage.delete_journal(invocation_id).await?;
        self.promises.delete_all(invocation_id).await?;
        self.storage.delete_compensations(invocation_id).await
    }

    // --- Outcomes

    async fn wait_for_outcome(&self, invocation_id: InvocationId) -> Result<EntryResult, EngineError> {
        // subscribe before reading the status, the invocation might complete in between
        let mut rx = self
            .completions
            .lock()
            .entry(invocation_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();

        let stored = self.storage.get_invocation(&invocation_id).await;
        let early_outcome = match stored {
            Ok(Some(invocation)) => invocation.status.outcome().map(Ok),
            Ok(None) => Some(Err(EngineError::NotFound(invocation_id))),
            Err(err) => Some(Err(err.into())),
        };
        if let Some(outcome) = early_outcome {
            drop(rx);
            self.unsubscribe(invocation_id);
            return outcome;
        }

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        match &*outcome {
            Some(outcome) => Ok(outcome.clone()),
            None => Err(EngineError::ShuttingDown),
        }
    }

    fn unsubscribe(&self, invocation_id: InvocationId) {
        let mut completions = self.completions.lock();
        if completions
            .get(&invocation_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            completions.remove(&invocation_id);
        }
    }

    fn publish(&self, invocation_id: InvocationId, outcome: EntryResult) {
        if let Some(tx) = self.completions.lock().remove(&invocation_id) {
            tx.send_replace(Some(outcome));
        }
    }

    // --- Wake ups

    async fn any_satisfied(&self, waiting_for: &[WaitCondition]) -> Result<bool, StorageError> {
        for condition in waiting_for {
            let satisfied = match condition {
                WaitCondition::Promise { owner, name } => {
                    self.promises.get(owner, name).await?.is_some()
                }
                WaitCondition::Timer { fire_at, .. } => self.clock.now() >= *fire_at,
            };
            if satisfied {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resumes the invocation if it is suspended waiting for `condition`.
    async fn wake(
        &self,
        invocation_id: InvocationId,
        condition: &WaitCondition,
    ) -> Result<(), StorageError> {
        let _status_guard = self.status_locks.lock(&invocation_id).await;
        let Some(invocation) = self.storage.get_invocation(&invocation_id).await? else {
            return Ok(());
        };
        match &invocation.status {
            InvocationStatus::Suspended { waiting_for } if waiting_for.contains(condition) => {
                debug!("Waking up {invocation_id}: {condition}");
                self.storage
                    .put_invocation_status(&invocation_id, InvocationStatus::Pending)
                    .await?;
                self.spawn(invocation_id);
            }
            status => trace!(
                "Not waking up {invocation_id} for {condition}, it is {}",
                status.name()
            ),
        }
        Ok(())
    }

    async fn settle_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
        result: EntryResult,
    ) -> Result<(), StorageError> {
        let listeners = self.promises.settle(&owner, name.clone(), result).await?;
        let condition = WaitCondition::Promise { owner, name };
        for listener in listeners {
            self.wake(listener, &condition).await?;
        }
        Ok(())
    }

    // --- Execution

    fn spawn(&self, invocation_id: InvocationId) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let mut active = self.active.lock();
        if active.contains_key(&invocation_id) {
            trace!("Invocation {invocation_id} is running already");
            return;
        }
        let task = tokio::spawn(me.run_invocation(invocation_id));
        active.insert(invocation_id, task.abort_handle());
    }

    fn deregister(&self, invocation_id: InvocationId) {
        self.active.lock().remove(&invocation_id);
    }

    async fn run_invocation(self: Arc<Self>, invocation_id: InvocationId) {
        match Arc::clone(&self).execute(invocation_id).await {
            Ok(Exit::Suspended) => {}
            Ok(Exit::Finished) => self.deregister(invocation_id),
            Err(err) => {
                // resumed by the recovery of the next start
                error!("Invocation {invocation_id} stopped on a storage error: {err}");
                self.deregister(invocation_id);
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(invocation.id = %invocation_id))]
    async fn execute(self: Arc<Self>, invocation_id: InvocationId) -> Result<Exit, StorageError> {
        let Some(invocation) = self.storage.get_invocation(&invocation_id).await? else {
            warn!("Invocation {invocation_id} is gone");
            return Ok(Exit::Finished);
        };
        if invocation.status.is_terminal() {
            return Ok(Exit::Finished);
        }
        let target = invocation.invocation_target.clone();

        let Some(handler) = self.registry.handler(&target) else {
            let err =
                TerminalError::service_handler_not_found(target.service_name(), target.handler_name());
            self.finalize(&invocation, Err(err)).await?;
            return Ok(Exit::Finished);
        };

        let _lease = match (
            target.as_keyed_service_id(),
            target.invocation_target_ty().access_mode(),
        ) {
            (Some(service_id), Some(mode)) => {
                match self
                    .scheduler
                    .acquire(&service_id, mode, invocation_id, &invocation.caller_chain)
                    .await
                {
                    Ok(lease) => Some(lease),
                    Err(err) => {
                        self.finalize(&invocation, Err(err.into())).await?;
                        return Ok(Exit::Finished);
                    }
                }
            }
            _ => None,
        };

        let resumed = self.storage.get_journal_length(&invocation_id).await? > 0;
        self.storage
            .put_invocation_status(&invocation_id, InvocationStatus::Running)
            .await?;
        self.notify(
            &invocation,
            if resumed {
                InvocationEventKind::Resumed
            } else {
                InvocationEventKind::Started
            },
        );

        let mut retries = self.options.retry_policy.iter();
        let mut attempt = 1;
        let outcome = loop {
            let journal = self.storage.get_journal(&invocation_id).await?;
            let runtime: Arc<dyn Runtime> = Arc::clone(&self) as Arc<dyn Runtime>;
            let ctx = Context::new(runtime, &invocation, journal);

            match handler(ctx, invocation.argument.clone()).await {
                Ok(value) => break Ok(value),
                Err(HandlerError::Terminal(err)) => break Err(err),
                Err(HandlerError::Retryable(err)) => match retries.next() {
                    Some(next_retry_in) => {
                        debug!("Attempt {attempt} failed, retrying in {next_retry_in:?}: {err:#}");
                        self.notify(
                            &invocation,
                            InvocationEventKind::Retrying {
                                attempt,
                                next_retry_in,
                            },
                        );
                        attempt += 1;
                        tokio::time::sleep(next_retry_in).await;
                    }
                    None => {
                        break Err(TerminalError::new(
                            codes::RETRIES_EXHAUSTED,
                            format!("giving up after {attempt} attempts: {err:#}"),
                        ));
                    }
                },
                Err(HandlerError::Suspended(suspension)) => {
                    let waiting_for = suspension.into_waiting_for();
                    let status_guard = self.status_locks.lock(&invocation_id).await;
                    if self.any_satisfied(&waiting_for).await? {
                        trace!("Wait condition met before suspending, replaying right away");
                        continue;
                    }
                    self.storage
                        .put_invocation_status(
                            &invocation_id,
                            InvocationStatus::Suspended {
                                waiting_for: waiting_for.clone(),
                            },
                        )
                        .await?;
                    self.deregister(invocation_id);
                    drop(status_guard);

                    self.notify(&invocation, InvocationEventKind::Suspended { waiting_for });
                    return Ok(Exit::Suspended);
                }
            }
        };

        let outcome = match outcome {
            Err(err) => {
                self.compensate(&invocation).await?;
                Err(err)
            }
            ok => ok,
        };
        self.finalize(&invocation, outcome).await?;
        Ok(Exit::Finished)
    }

    async fn compensate(&self, invocation: &Invocation) -> Result<(), StorageError> {
        let invocation_id = invocation.invocation_id;
        if self
            .storage
            .get_compensations(&invocation_id)
            .await?
            .is_empty()
        {
            return Ok(());
        }

        info!("Running the compensations of the failed invocation {invocation_id}");
        let report = self
            .run_compensations(invocation_id, invocation.callee_chain())
            .await?;
        for (index, err) in report.failed() {
            // the original failure is kept as outcome
            warn!("Compensation {index} of {invocation_id} failed: {err}");
        }
        Ok(())
    }

    async fn run_compensations(
        &self,
        owner: InvocationId,
        caller_chain: Vec<InvocationId>,
    ) -> Result<CompensationReport, StorageError> {
        let owner_invocation = self.storage.get_invocation(&owner).await?;
        let incarnation = owner_invocation
            .as_ref()
            .map_or(0, |invocation| invocation.incarnation);
        let owner_target = owner_invocation.map(|invocation| invocation.invocation_target);

        saga::run_all(&self.storage, &owner, |index, compensation| {
            let caller_chain = caller_chain.clone();
            let owner_target = owner_target.clone();
            async move {
                let outcome = self
                    .execute_compensation(owner, incarnation, index, compensation, caller_chain)
                    .await;
                if let Some(invocation_target) = owner_target {
                    self.sink.notify(&InvocationEvent {
                        invocation_id: owner,
                        invocation_target,
                        kind: InvocationEventKind::CompensationExecuted {
                            index,
                            outcome: outcome.clone(),
                        },
                    });
                }
                outcome
            }
        })
        .await
    }

    /// Executes the compensation as an idempotent sub-invocation, so a repeated run after a crash
    /// attaches to the first execution. The key is scoped to the incarnation of the owner.
    async fn execute_compensation(
        &self,
        owner: InvocationId,
        incarnation: u64,
        index: EntryIndex,
        compensation: Compensation,
        caller_chain: Vec<InvocationId>,
    ) -> EntryResult {
        let idempotency_key =
            ByteString::from(format!("compensation-{owner}-{incarnation:x}-{index}"));
        let invocation_id = InvocationId::generate(&compensation.target, Some(&*idempotency_key));
        let idempotency_id = IdempotencyId::combine(&compensation.target, idempotency_key);
        let invocation = Invocation {
            idempotency_ids: vec![idempotency_id],
            caller_chain,
            ..Invocation::new(invocation_id, compensation.target, compensation.argument)
        };

        let outcome = match self.admit_invocation(invocation).await {
            Ok(Admission::Completed { outcome, .. }) => Ok(outcome),
            Ok(admission) => self.wait_for_outcome(admission.invocation_id()).await,
            Err(err) => Err(err),
        };
        outcome.unwrap_or_else(|err| {
            EntryResult::Failure(TerminalError::internal(format!(
                "cannot execute compensation {index} of {owner}: {err}"
            )))
        })
    }

    async fn finalize(
        &self,
        invocation: &Invocation,
        outcome: Result<Bytes, TerminalError>,
    ) -> Result<(), StorageError> {
        let invocation_id = invocation.invocation_id;
        let (status, event) = match &outcome {
            Ok(value) => (
                InvocationStatus::Completed(value.clone()),
                InvocationEventKind::Completed,
            ),
            Err(err) => (
                InvocationStatus::Failed(err.clone()),
                InvocationEventKind::Failed { error: err.clone() },
            ),
        };
        self.storage
            .put_invocation_status(&invocation_id, status)
            .await?;

        let outcome = EntryResult::from(outcome);
        // read back, requests attached while running added their idempotency ids
        let idempotency_ids = match self.storage.get_invocation(&invocation_id).await? {
            Some(stored) => stored.idempotency_ids,
            None => invocation.idempotency_ids.clone(),
        };
        for idempotency_id in &idempotency_ids {
            self.commit_idempotency_id(idempotency_id, invocation_id, outcome.clone())
                .await?;
        }

        self.notify(invocation, event);
        self.publish(invocation_id, outcome);
        Ok(())
    }

    async fn commit_idempotency_id(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        outcome: EntryResult,
    ) -> Result<(), StorageError> {
        match self
            .dedup
            .commit(idempotency_id, invocation_id, outcome, self.clock.now())
            .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::PreconditionFailed(err)) => {
                warn!("Not committing {idempotency_id} for {invocation_id}: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn notify(&self, invocation: &Invocation, kind: InvocationEventKind) {
        self.sink.notify(&InvocationEvent {
            invocation_id: invocation.invocation_id,
            invocation_target: invocation.invocation_target.clone(),
            kind,
        });
    }
}

impl<S, C> Runtime for EngineInner<S, C>
where
    S: Storage,
    C: Clock + Clone + Send + Sync + 'static,
{
    fn now(&self) -> MillisSinceEpoch {
        self.clock.now()
    }

    fn resolve(&self, address: &Address) -> Result<InvocationTarget, TerminalError> {
        self.registry.resolve(address)
    }

    fn append_entry(
        &self,
        invocation_id: InvocationId,
        entry: JournalEntry,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            self.storage
                .append_journal_entry(&invocation_id, &entry)
                .await
        }
        .boxed()
    }

    fn get_state(
        &self,
        service_id: ServiceId,
        name: ByteString,
    ) -> BoxFuture<'_, Result<Option<Bytes>, StorageError>> {
        async move {
            Ok(self
                .storage
                .get_user_state(&service_id, &name)
                .await?
                .map(|state| state.value))
        }
        .boxed()
    }

    fn set_state(
        &self,
        service_id: ServiceId,
        name: ByteString,
        value: Bytes,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let version = self
                .storage
                .put_user_state(&service_id, &name, value)
                .await?;
            trace!("State {service_id}/{name} is at version {version}");
            Ok(())
        }
        .boxed()
    }

    fn clear_state(
        &self,
        service_id: ServiceId,
        name: ByteString,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        async move { self.storage.delete_user_state(&service_id, &name).await }.boxed()
    }

    fn clear_all_state(&self, service_id: ServiceId) -> BoxFuture<'_, Result<(), StorageError>> {
        async move { self.storage.delete_all_user_state(&service_id).await }.boxed()
    }

    fn state_keys(
        &self,
        service_id: ServiceId,
    ) -> BoxFuture<'_, Result<Vec<ByteString>, StorageError>> {
        async move { self.storage.get_user_state_keys(&service_id).await }.boxed()
    }

    fn create_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
    ) -> BoxFuture<'_, Result<PromiseState, StorageError>> {
        async move { self.promises.create(&owner, name).await }.boxed()
    }

    fn listen_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
        listener: InvocationId,
    ) -> BoxFuture<'_, Result<Option<EntryResult>, StorageError>> {
        async move { self.promises.listen(&owner, name, listener).await }.boxed()
    }

    fn settle_promise(
        &self,
        owner: InvocationId,
        name: ByteString,
        result: EntryResult,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        EngineInner::settle_promise(self, owner, name, result).boxed()
    }

    fn schedule_timer(&self, timer: TimerKey) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            self.storage.put_timer(&timer).await?;
            if self.timer_tx.send(timer).is_err() {
                trace!("Timer loop is gone, {timer:?} fires after the next start");
            }
            Ok(())
        }
        .boxed()
    }

    fn start_invocation(&self, invocation: Invocation) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let invocation_id = invocation.invocation_id;
            if self
                .storage
                .put_invocation_if_absent(&invocation)
                .await?
                .is_none()
            {
                self.spawn(invocation_id);
            }
            Ok(())
        }
        .boxed()
    }

    fn await_invocation(
        &self,
        invocation_id: InvocationId,
    ) -> BoxFuture<'static, Result<EntryResult, HandlerError>> {
        let me = self.me.clone();
        async move {
            let Some(inner) = me.upgrade() else {
                return Err(HandlerError::retryable(EngineError::ShuttingDown));
            };
            inner
                .wait_for_outcome(invocation_id)
                .await
                .map_err(HandlerError::retryable)
        }
        .boxed()
    }

    fn put_compensation(
        &self,
        owner: InvocationId,
        index: EntryIndex,
        compensation: Compensation,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            self.storage
                .put_compensation_if_absent(&owner, index, compensation)
                .await
        }
        .boxed()
    }

    fn arm_compensation(
        &self,
        owner: InvocationId,
        index: EntryIndex,
    ) -> BoxFuture<'_, Result<bool, StorageError>> {
        async move { self.storage.arm_compensation(&owner, index).await }.boxed()
    }

    fn run_compensations(
        &self,
        owner: InvocationId,
        caller_chain: Vec<InvocationId>,
    ) -> BoxFuture<'_, Result<CompensationReport, StorageError>> {
        EngineInner::run_compensations(self, owner, caller_chain).boxed()
    }
}
