// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;

use durable_types::identifiers::InvocationId;
use durable_types::journal::JournalEntry;

use crate::Result;

/// Append-only journal of every invocation.
pub trait JournalTable {
    /// Appends the entry at the end of the invocation journal.
    ///
    /// # Contract
    /// `entry.index` must be equal to the current journal length, otherwise the append fails
    /// with [`crate::StorageError::PreconditionFailed`] and the journal is left untouched.
    /// Entries are never overwritten.
    fn append_journal_entry(
        &self,
        invocation_id: &InvocationId,
        entry: &JournalEntry,
    ) -> impl Future<Output = Result<()>> + Send;

    /// The journal ordered by entry index.
    fn get_journal(
        &self,
        invocation_id: &InvocationId,
    ) -> impl Future<Output = Result<Vec<JournalEntry>>> + Send;

    fn get_journal_length(
        &self,
        invocation_id: &InvocationId,
    ) -> impl Future<Output = Result<u32>> + Send;

    fn delete_journal(&self, invocation_id: &InvocationId)
    -> impl Future<Output = Result<()>> + Send;
}
