// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Access arbitration for keyed services.
//!
//! Every invocation of a virtual object or workflow handler runs under a [`Lease`] on its
//! [`ServiceId`]. An exclusive lease excludes every other lease on the same key, shared leases
//! only exclude exclusive ones. Requests which can't be granted wait in a per-key FIFO queue, so
//! a stream of shared requests cannot starve a queued exclusive request.
//!
//! An invocation synchronously waiting on a callee which needs an incompatible lease on a key the
//! caller holds would wait forever. The scheduler detects this through the caller chain passed
//! on acquisition and fails the request with [`SchedulerError::Deadlock`] instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use durable_types::errors::{MaybeRetryableError, TerminalError};
use durable_types::identifiers::{InvocationId, ServiceId};
use durable_types::invocation::AccessMode;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(
        "invocation {requester} cannot acquire a {mode} lease on {service_id}: it is held by its caller {holder}"
    )]
    Deadlock {
        service_id: ServiceId,
        mode: AccessMode,
        requester: InvocationId,
        holder: InvocationId,
    },
    #[error("scheduler dropped the lease request of {0}")]
    Dropped(InvocationId),
}

impl MaybeRetryableError for SchedulerError {
    fn retryable(&self) -> bool {
        matches!(self, SchedulerError::Dropped(_))
    }
}

impl From<SchedulerError> for TerminalError {
    fn from(value: SchedulerError) -> Self {
        match value {
            err @ SchedulerError::Deadlock { .. } => TerminalError::deadlock(err.to_string()),
            err => TerminalError::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Default)]
enum ActiveLeases {
    #[default]
    None,
    Exclusive(InvocationId),
    /// Holders with the number of leases each of them holds.
    Shared(HashMap<InvocationId, usize>),
}

impl ActiveLeases {
    fn is_compatible_with(&self, mode: AccessMode) -> bool {
        match self {
            ActiveLeases::None => true,
            ActiveLeases::Exclusive(_) => false,
            ActiveLeases::Shared(_) => mode == AccessMode::Shared,
        }
    }

    fn holders(&self) -> Vec<InvocationId> {
        match self {
            ActiveLeases::None => Vec::new(),
            ActiveLeases::Exclusive(holder) => vec![*holder],
            ActiveLeases::Shared(holders) => holders.keys().copied().collect(),
        }
    }

    fn grant(&mut self, invocation_id: InvocationId, mode: AccessMode) {
        match mode {
            AccessMode::Exclusive => *self = ActiveLeases::Exclusive(invocation_id),
            AccessMode::Shared => {
                if !matches!(self, ActiveLeases::Shared(_)) {
                    *self = ActiveLeases::Shared(HashMap::new());
                }
                if let ActiveLeases::Shared(holders) = self {
                    *holders.entry(invocation_id).or_default() += 1;
                }
            }
        }
    }

    fn release(&mut self, invocation_id: InvocationId) {
        match self {
            ActiveLeases::Exclusive(holder) if *holder == invocation_id => {
                *self = ActiveLeases::None;
            }
            ActiveLeases::Shared(holders) => {
                if let Some(count) = holders.get_mut(&invocation_id) {
                    *count -= 1;
                    if *count == 0 {
                        holders.remove(&invocation_id);
                    }
                }
                if holders.is_empty() {
                    *self = ActiveLeases::None;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
struct Waiter {
    invocation_id: InvocationId,
    mode: AccessMode,
    tx: oneshot::Sender<Lease>,
}

#[derive(Debug, Default)]
struct KeyState {
    active: ActiveLeases,
    waiters: VecDeque<Waiter>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        matches!(self.active, ActiveLeases::None) && self.waiters.is_empty()
    }
}

type Keys = HashMap<ServiceId, KeyState>;

/// Per-key run queue. Cloning returns a handle to the same scheduler.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    keys: Arc<Mutex<Keys>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a lease on `service_id` for `invocation_id`, waiting for incompatible leases to be
    /// released first.
    ///
    /// `caller_chain` lists the invocations synchronously waiting on `invocation_id`. If one of
    /// them holds an incompatible lease on the same key, the acquisition fails with
    /// [`SchedulerError::Deadlock`]. If one of them holds a shared lease and a shared lease is
    /// requested, the lease is granted right away even if exclusive requests are queued.
    ///
    /// Dropping the returned future while it waits gives up the request.
    pub async fn acquire(
        &self,
        service_id: &ServiceId,
        mode: AccessMode,
        invocation_id: InvocationId,
        caller_chain: &[InvocationId],
    ) -> Result<Lease, SchedulerError> {
        let rx = {
            let mut keys = self.keys.lock();
            let state = keys.entry(service_id.clone()).or_default();

            let held_by_caller = state
                .active
                .holders()
                .into_iter()
                .find(|holder| caller_chain.contains(holder));
            if let Some(holder) = held_by_caller {
                if !state.active.is_compatible_with(mode) {
                    debug!(
                        "Rejecting {mode} lease on {service_id} for {invocation_id}: held by caller {holder}"
                    );
                    return Err(SchedulerError::Deadlock {
                        service_id: service_id.clone(),
                        mode,
                        requester: invocation_id,
                        holder,
                    });
                }
                // the caller can only release once the callee is done, so queueing would deadlock
                state.active.grant(invocation_id, mode);
                trace!("Granted re-entrant {mode} lease on {service_id} to {invocation_id}");
                return Ok(self.lease(service_id.clone(), invocation_id, mode));
            }

            if state.waiters.is_empty() && state.active.is_compatible_with(mode) {
                state.active.grant(invocation_id, mode);
                trace!("Granted {mode} lease on {service_id} to {invocation_id}");
                return Ok(self.lease(service_id.clone(), invocation_id, mode));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                invocation_id,
                mode,
                tx,
            });
            debug!(
                "Invocation {invocation_id} waits for a {mode} lease on {service_id}, {} waiters queued",
                state.waiters.len()
            );
            rx
        };

        rx.await.map_err(|_| SchedulerError::Dropped(invocation_id))
    }

    /// The current holders of leases on `service_id` and their mode.
    pub fn holders(&self, service_id: &ServiceId) -> Option<(AccessMode, Vec<InvocationId>)> {
        let keys = self.keys.lock();
        let state = keys.get(service_id)?;
        match &state.active {
            ActiveLeases::None => None,
            ActiveLeases::Exclusive(holder) => Some((AccessMode::Exclusive, vec![*holder])),
            ActiveLeases::Shared(holders) => {
                Some((AccessMode::Shared, holders.keys().copied().collect()))
            }
        }
    }

    /// Number of requests waiting for a lease on `service_id`.
    pub fn queue_length(&self, service_id: &ServiceId) -> usize {
        self.keys
            .lock()
            .get(service_id)
            .map_or(0, |state| state.waiters.len())
    }

    fn lease(&self, service_id: ServiceId, invocation_id: InvocationId, mode: AccessMode) -> Lease {
        Lease {
            scheduler: self.clone(),
            service_id,
            invocation_id,
            mode,
        }
    }

    fn release(&self, service_id: &ServiceId, invocation_id: InvocationId) {
        // leases whose requester went away; dropping them releases again, so do it unlocked
        let mut abandoned = Vec::new();
        {
            let mut keys = self.keys.lock();
            let Some(state) = keys.get_mut(service_id) else {
                return;
            };
            state.active.release(invocation_id);
            trace!("Invocation {invocation_id} released its lease on {service_id}");

            while let Some(waiter) = state.waiters.front() {
                if !state.active.is_compatible_with(waiter.mode) {
                    break;
                }
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                state.active.grant(waiter.invocation_id, waiter.mode);
                debug!(
                    "Granted {} lease on {service_id} to waiting invocation {}",
                    waiter.mode, waiter.invocation_id
                );
                let lease = self.lease(service_id.clone(), waiter.invocation_id, waiter.mode);
                if let Err(lease) = waiter.tx.send(lease) {
                    abandoned.push(lease);
                }
                if waiter.mode == AccessMode::Exclusive {
                    break;
                }
            }

            if state.is_idle() {
                keys.remove(service_id);
            }
        }
        drop(abandoned);
    }
}

/// Access to a keyed service, released on drop.
#[derive(Debug)]
#[must_use = "the lease is released as soon as it is dropped"]
pub struct Lease {
    scheduler: Scheduler,
    service_id: ServiceId,
    invocation_id: InvocationId,
    mode: AccessMode,
}

impl Lease {
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.scheduler.release(&self.service_id, self.invocation_id);
    }
}
