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

use durable_types::identifiers::{IdempotencyId, InvocationId};
use durable_types::invocation::{Invocation, InvocationStatus};

use crate::Result;

pub trait InvocationStatusTable {
    fn get_invocation(
        &self,
        invocation_id: &InvocationId,
    ) -> impl Future<Output = Result<Option<Invocation>>> + Send;

    /// Stores the invocation unless an invocation with the same id exists already. Returns the
    /// existing invocation in that case.
    fn put_invocation_if_absent(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Option<Invocation>>> + Send;

    /// Fails with [`crate::StorageError::PreconditionFailed`] if the invocation doesn't exist.
    fn put_invocation_status(
        &self,
        invocation_id: &InvocationId,
        status: InvocationStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Records one more idempotency id for the invocation, unless it holds it already. Returns the
    /// updated invocation, `None` if it doesn't exist.
    fn add_idempotency_id(
        &self,
        invocation_id: &InvocationId,
        idempotency_id: &IdempotencyId,
    ) -> impl Future<Output = Result<Option<Invocation>>> + Send;

    fn delete_invocation(
        &self,
        invocation_id: &InvocationId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// All the invocations which are not completed nor failed.
    fn scan_non_terminal_invocations(&self) -> impl Future<Output = Result<Vec<Invocation>>> + Send;
}
