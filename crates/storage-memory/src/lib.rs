// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-process implementation of all the storage tables. Every operation runs under a single lock,
//! which makes each trait method atomic with respect to all the others.

use std::collections::{BTreeMap, BTreeSet, HashMap, hash_map};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::Mutex;
use tracing::trace;

use durable_storage_api::compensation_table::{Compensation, CompensationTable};
use durable_storage_api::deduplication_table::{DedupRecord, DeduplicationTable, ReserveOutcome};
use durable_storage_api::invocation_status_table::InvocationStatusTable;
use durable_storage_api::journal_table::JournalTable;
use durable_storage_api::promise_table::{PromiseState, PromiseTable, SettleOutcome};
use durable_storage_api::state_table::{ObjectState, StateTable};
use durable_storage_api::timer_table::{TimerKey, TimerTable};
use durable_storage_api::{Result, StorageError};
use durable_types::identifiers::{EntryIndex, IdempotencyId, InvocationId, ServiceId};
use durable_types::invocation::{Invocation, InvocationStatus};
use durable_types::journal::{EntryResult, JournalEntry};
use durable_types::time::MillisSinceEpoch;

#[derive(Debug, Default)]
struct Tables {
    invocations: HashMap<InvocationId, Invocation>,
    journals: HashMap<InvocationId, Vec<JournalEntry>>,
    state: BTreeMap<(ServiceId, ByteString), ObjectState>,
    promises: HashMap<(InvocationId, ByteString), PromiseState>,
    dedup: HashMap<IdempotencyId, DedupRecord>,
    compensations: BTreeMap<(InvocationId, EntryIndex), Compensation>,
    timers: BTreeSet<TimerKey>,
}

/// Storage keeping every table in memory. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InvocationStatusTable for MemoryStorage {
    async fn get_invocation(&self, invocation_id: &InvocationId) -> Result<Option<Invocation>> {
        Ok(self.tables.lock().invocations.get(invocation_id).cloned())
    }

    async fn put_invocation_if_absent(&self, invocation: &Invocation) -> Result<Option<Invocation>> {
        match self
            .tables
            .lock()
            .invocations
            .entry(invocation.invocation_id)
        {
            hash_map::Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            hash_map::Entry::Vacant(entry) => {
                entry.insert(invocation.clone());
                Ok(None)
            }
        }
    }

    async fn put_invocation_status(
        &self,
        invocation_id: &InvocationId,
        status: InvocationStatus,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let invocation = tables.invocations.get_mut(invocation_id).ok_or_else(|| {
            StorageError::PreconditionFailed(anyhow!("unknown invocation {invocation_id}"))
        })?;
        trace!(
            "Invocation {invocation_id} transitions from {} to {}",
            invocation.status.name(),
            status.name()
        );
        invocation.status = status;
        Ok(())
    }

    async fn add_idempotency_id(
        &self,
        invocation_id: &InvocationId,
        idempotency_id: &IdempotencyId,
    ) -> Result<Option<Invocation>> {
        let mut tables = self.tables.lock();
        let Some(invocation) = tables.invocations.get_mut(invocation_id) else {
            return Ok(None);
        };
        if !invocation.idempotency_ids.contains(idempotency_id) {
            invocation.idempotency_ids.push(idempotency_id.clone());
        }
        Ok(Some(invocation.clone()))
    }

    async fn delete_invocation(&self, invocation_id: &InvocationId) -> Result<()> {
        self.tables.lock().invocations.remove(invocation_id);
        Ok(())
    }

    async fn scan_non_terminal_invocations(&self) -> Result<Vec<Invocation>> {
        Ok(self
            .tables
            .lock()
            .invocations
            .values()
            .filter(|invocation| !invocation.status.is_terminal())
            .cloned()
            .collect())
    }
}

impl JournalTable for MemoryStorage {
    async fn append_journal_entry(
        &self,
        invocation_id: &InvocationId,
        entry: &JournalEntry,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let journal = tables.journals.entry(*invocation_id).or_default();
        if entry.index as usize != journal.len() {
            return Err(StorageError::PreconditionFailed(anyhow!(
                "journal of {invocation_id} has {} entries, cannot append entry {}",
                journal.len(),
                entry.index
            )));
        }
        journal.push(entry.clone());
        Ok(())
    }

    async fn get_journal(&self, invocation_id: &InvocationId) -> Result<Vec<JournalEntry>> {
        Ok(self
            .tables
            .lock()
            .journals
            .get(invocation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_journal_length(&self, invocation_id: &InvocationId) -> Result<u32> {
        let length = self
            .tables
            .lock()
            .journals
            .get(invocation_id)
            .map_or(0, Vec::len);
        u32::try_from(length).map_err(|_| StorageError::DataIntegrityError)
    }

    async fn delete_journal(&self, invocation_id: &InvocationId) -> Result<()> {
        self.tables.lock().journals.remove(invocation_id);
        Ok(())
    }
}

fn state_row_key(service_id: &ServiceId, state_key: &str) -> (ServiceId, ByteString) {
    (service_id.clone(), ByteString::from(state_key))
}

impl StateTable for MemoryStorage {
    async fn get_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
    ) -> Result<Option<ObjectState>> {
        Ok(self
            .tables
            .lock()
            .state
            .get(&state_row_key(service_id, state_key))
            .cloned())
    }

    async fn put_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
        state_value: Bytes,
    ) -> Result<u64> {
        let mut tables = self.tables.lock();
        let entry = tables
            .state
            .entry(state_row_key(service_id, state_key))
            .and_modify(|state| {
                state.value = state_value.clone();
                state.version += 1;
            })
            .or_insert_with(|| ObjectState {
                value: state_value,
                version: 1,
            });
        Ok(entry.version)
    }

    async fn delete_user_state(&self, service_id: &ServiceId, state_key: &str) -> Result<()> {
        self.tables
            .lock()
            .state
            .remove(&state_row_key(service_id, state_key));
        Ok(())
    }

    async fn delete_all_user_state(&self, service_id: &ServiceId) -> Result<()> {
        self.tables
            .lock()
            .state
            .retain(|(owner, _), _| owner != service_id);
        Ok(())
    }

    async fn get_user_state_keys(&self, service_id: &ServiceId) -> Result<Vec<ByteString>> {
        Ok(self
            .tables
            .lock()
            .state
            .range((service_id.clone(), ByteString::new())..)
            .take_while(|((owner, _), _)| owner == service_id)
            .map(|((_, name), _)| name.clone())
            .collect())
    }
}

impl PromiseTable for MemoryStorage {
    async fn get_promise(&self, owner: &InvocationId, name: &str) -> Result<Option<PromiseState>> {
        Ok(self
            .tables
            .lock()
            .promises
            .get(&(*owner, ByteString::from(name)))
            .cloned())
    }

    async fn create_promise(&self, owner: &InvocationId, name: ByteString) -> Result<PromiseState> {
        Ok(self
            .tables
            .lock()
            .promises
            .entry((*owner, name))
            .or_insert_with(|| PromiseState::Pending {
                listeners: Vec::new(),
            })
            .clone())
    }

    async fn settle_promise(
        &self,
        owner: &InvocationId,
        name: ByteString,
        result: EntryResult,
    ) -> Result<SettleOutcome> {
        let mut tables = self.tables.lock();
        match tables.promises.entry((*owner, name)) {
            hash_map::Entry::Occupied(mut entry) => {
                if let PromiseState::Settled(existing) = entry.get() {
                    return Ok(SettleOutcome::AlreadySettled(existing.clone()));
                }
                let listeners = match entry.insert(PromiseState::Settled(result)) {
                    PromiseState::Pending { listeners } => listeners,
                    PromiseState::Settled(_) => Vec::new(),
                };
                Ok(SettleOutcome::Settled { listeners })
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(PromiseState::Settled(result));
                Ok(SettleOutcome::Settled {
                    listeners: Vec::new(),
                })
            }
        }
    }

    async fn add_promise_listener(
        &self,
        owner: &InvocationId,
        name: ByteString,
        listener: InvocationId,
    ) -> Result<PromiseState> {
        let mut tables = self.tables.lock();
        let state = tables
            .promises
            .entry((*owner, name))
            .or_insert_with(|| PromiseState::Pending {
                listeners: Vec::new(),
            });
        if let PromiseState::Pending { listeners } = state {
            if !listeners.contains(&listener) {
                listeners.push(listener);
            }
        }
        Ok(state.clone())
    }

    async fn delete_promises(&self, owner: &InvocationId) -> Result<()> {
        self.tables
            .lock()
            .promises
            .retain(|(promise_owner, _), _| promise_owner != owner);
        Ok(())
    }
}

impl DeduplicationTable for MemoryStorage {
    async fn reserve_idempotency_id(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        now: MillisSinceEpoch,
    ) -> Result<ReserveOutcome> {
        let mut tables = self.tables.lock();
        let replaced = match tables.dedup.get(idempotency_id) {
            Some(record) if !record.is_expired(now) => {
                return Ok(ReserveOutcome::Existing(record.clone()));
            }
            Some(expired) => Some(expired.invocation_id()),
            None => None,
        };
        tables
            .dedup
            .insert(idempotency_id.clone(), DedupRecord::InFlight { invocation_id });
        Ok(ReserveOutcome::Reserved { replaced })
    }

    async fn commit_idempotency_id(
        &self,
        idempotency_id: &IdempotencyId,
        invocation_id: InvocationId,
        outcome: EntryResult,
        expires_at: MillisSinceEpoch,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.dedup.get_mut(idempotency_id) {
            Some(record) if record.invocation_id() == invocation_id => {
                *record = DedupRecord::Completed {
                    invocation_id,
                    outcome,
                    expires_at,
                };
                Ok(())
            }
            _ => Err(StorageError::PreconditionFailed(anyhow!(
                "idempotency id {idempotency_id} is not reserved by {invocation_id}"
            ))),
        }
    }

    async fn get_dedup_record(&self, idempotency_id: &IdempotencyId) -> Result<Option<DedupRecord>> {
        Ok(self.tables.lock().dedup.get(idempotency_id).cloned())
    }

    async fn purge_expired_dedup_records(&self, now: MillisSinceEpoch) -> Result<Vec<InvocationId>> {
        let mut purged = Vec::new();
        self.tables.lock().dedup.retain(|_, record| {
            if record.is_expired(now) {
                purged.push(record.invocation_id());
                false
            } else {
                true
            }
        });
        Ok(purged)
    }
}

impl CompensationTable for MemoryStorage {
    async fn put_compensation_if_absent(
        &self,
        owner: &InvocationId,
        index: EntryIndex,
        compensation: Compensation,
    ) -> Result<()> {
        self.tables
            .lock()
            .compensations
            .entry((*owner, index))
            .or_insert(compensation);
        Ok(())
    }

    async fn arm_compensation(&self, owner: &InvocationId, index: EntryIndex) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .compensations
            .get_mut(&(*owner, index))
            .map(|compensation| compensation.armed = true)
            .is_some())
    }

    async fn get_compensations(
        &self,
        owner: &InvocationId,
    ) -> Result<Vec<(EntryIndex, Compensation)>> {
        Ok(self
            .tables
            .lock()
            .compensations
            .range((*owner, 0)..=(*owner, EntryIndex::MAX))
            .map(|((_, index), compensation)| (*index, compensation.clone()))
            .collect())
    }

    async fn delete_compensation(&self, owner: &InvocationId, index: EntryIndex) -> Result<()> {
        self.tables.lock().compensations.remove(&(*owner, index));
        Ok(())
    }

    async fn delete_compensations(&self, owner: &InvocationId) -> Result<()> {
        self.tables
            .lock()
            .compensations
            .retain(|(compensation_owner, _), _| compensation_owner != owner);
        Ok(())
    }
}

impl TimerTable for MemoryStorage {
    async fn put_timer(&self, timer_key: &TimerKey) -> Result<()> {
        self.tables.lock().timers.insert(*timer_key);
        Ok(())
    }

    async fn delete_timer(&self, timer_key: &TimerKey) -> Result<()> {
        self.tables.lock().timers.remove(timer_key);
        Ok(())
    }

    async fn next_timers_greater_than(
        &self,
        exclusive_start: Option<&TimerKey>,
        limit: usize,
    ) -> Result<Vec<TimerKey>> {
        let tables = self.tables.lock();
        let timers = match exclusive_start {
            Some(start) => tables
                .timers
                .range((std::ops::Bound::Excluded(*start), std::ops::Bound::Unbounded))
                .take(limit)
                .copied()
                .collect(),
            None => tables.timers.iter().take(limit).copied().collect(),
        };
        Ok(timers)
    }
}
