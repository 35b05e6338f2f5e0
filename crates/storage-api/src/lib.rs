// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Storage interfaces of the invocation engine. Every table is a trait so that the engine does not
//! depend on a particular storage engine.
//!
//! Implementations are shared by all the running invocations: methods take `&self` and every
//! single method call must be atomic. Operations which need to observe and update a row in one
//! step (reserving an idempotency key, settling a promise) are modelled as a single method for
//! this reason.

use durable_types::errors::MaybeRetryableError;

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("generic storage error: {0}")]
    Generic(#[from] anyhow::Error),
    #[error("failed to convert Rust objects to/from their stored representation: {0}")]
    Conversion(anyhow::Error),
    #[error("integrity constraint is violated")]
    DataIntegrityError,
    #[error("operational error that can be caused during a graceful shutdown")]
    OperationalError,
    #[error("precondition failed: {0}")]
    PreconditionFailed(anyhow::Error),
}

impl MaybeRetryableError for StorageError {
    fn retryable(&self) -> bool {
        !matches!(self, StorageError::DataIntegrityError)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub mod compensation_table;
pub mod deduplication_table;
pub mod invocation_status_table;
pub mod journal_table;
pub mod promise_table;
pub mod state_table;
pub mod timer_table;

/// All the tables the engine needs. Cloning a storage yields another handle on the same data.
pub trait Storage:
    invocation_status_table::InvocationStatusTable
    + journal_table::JournalTable
    + state_table::StateTable
    + promise_table::PromiseTable
    + deduplication_table::DeduplicationTable
    + compensation_table::CompensationTable
    + timer_table::TimerTable
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> Storage for T where
    T: invocation_status_table::InvocationStatusTable
        + journal_table::JournalTable
        + state_table::StateTable
        + promise_table::PromiseTable
        + deduplication_table::DeduplicationTable
        + compensation_table::CompensationTable
        + timer_table::TimerTable
        + Clone
        + Send
        + Sync
        + 'static
{
}
