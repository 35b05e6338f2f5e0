// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Optional to have but adds description/help message to the metrics emitted to
/// the metrics' sink.
use metrics::{Unit, describe_counter, describe_histogram};

pub const ENGINE_INVOCATIONS: &str = "durable.engine.invocations.total";
pub const ENGINE_INVOCATION_RETRIES: &str = "durable.engine.invocation_retries.total";
pub const ENGINE_RETRY_DELAY: &str = "durable.engine.retry_delay.seconds";
pub const ENGINE_COMPENSATIONS: &str = "durable.engine.compensations.total";
pub const ENGINE_IDEMPOTENCY_KEY_WARNINGS: &str = "durable.engine.idempotency_key_warnings.total";

pub const EVENT_STARTED: &str = "started";
pub const EVENT_RESUMED: &str = "resumed";
pub const EVENT_SUSPENDED: &str = "suspended";
pub const EVENT_COMPLETED: &str = "completed";
pub const EVENT_FAILED: &str = "failed";

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";

pub(crate) fn describe_metrics() {
    describe_counter!(
        ENGINE_INVOCATIONS,
        Unit::Count,
        "Invocation lifecycle events, by event"
    );

    describe_counter!(
        ENGINE_INVOCATION_RETRIES,
        Unit::Count,
        "Number of retries after a retryable handler error"
    );

    describe_histogram!(
        ENGINE_RETRY_DELAY,
        Unit::Seconds,
        "Delay before an invocation is retried"
    );

    describe_counter!(
        ENGINE_COMPENSATIONS,
        Unit::Count,
        "Executed compensations, by outcome"
    );

    describe_counter!(
        ENGINE_IDEMPOTENCY_KEY_WARNINGS,
        Unit::Count,
        "Number of idempotency keys which look like timestamps"
    );
}
