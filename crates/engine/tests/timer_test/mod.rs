// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use bytes::Bytes;
use googletest::prelude::*;
use test_log::test;

use durable_engine::{
    Address, Context, HandlerError, HandlerRegistry, InvocationRequest, ServiceBuilder,
};
use durable_storage_api::journal_table::JournalTable;
use durable_test_util::let_assert;
use durable_types::invocation::{InvocationStatus, WaitCondition};
use durable_types::journal::{Entry, JournalEntry};

use crate::{START, TestEnv};

const REMINDER_DELAY: Duration = Duration::from_secs(48 * 60 * 60);

async fn remind(mut ctx: Context, input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    ctx.sleep(REMINDER_DELAY).await?;
    Ok(input)
}

fn registry() -> HandlerRegistry {
    HandlerRegistry::default()
        .with_service(ServiceBuilder::service("Reminder").handler("remind", remind))
        .unwrap()
}

fn reminder() -> InvocationRequest {
    InvocationRequest::new(Address::service("Reminder", "remind"), "call mom")
}

#[test(tokio::test)]
async fn sleep_records_the_absolute_fire_time() {
    let env = TestEnv::start(registry()).await;
    let invocation_id = env.engine.submit(reminder()).await.unwrap();

    assert_that!(
        env.wait_until_suspended(invocation_id).await,
        elements_are![eq(WaitCondition::Timer {
            sleep_index: 0,
            fire_at: START + REMINDER_DELAY,
        })]
    );
    assert_that!(
        env.storage.get_journal(&invocation_id).await.unwrap(),
        elements_are![eq(JournalEntry {
            index: 0,
            entry: Entry::Sleep {
                fire_at: START + REMINDER_DELAY
            },
        })]
    );

    env.clock.advance_time_by(REMINDER_DELAY);
    assert_that!(
        env.engine.attach(invocation_id).await.unwrap(),
        eq(Bytes::from_static(b"call mom"))
    );
}

#[test(tokio::test)]
async fn timers_survive_a_restart() {
    let env = TestEnv::start(registry()).await;
    let invocation_id = env.engine.submit(reminder()).await.unwrap();
    env.wait_until_suspended(invocation_id).await;

    let env = env.restart(registry()).await;

    // not due yet
    env.clock.advance_time_by(REMINDER_DELAY - Duration::from_secs(60 * 60));
    env.settle().await;
    let_assert!(Some(InvocationStatus::Suspended { .. }) = env.status(invocation_id).await);

    env.clock.advance_time_by(Duration::from_secs(60 * 60));
    assert_that!(
        env.engine.attach(invocation_id).await.unwrap(),
        eq(Bytes::from_static(b"call mom"))
    );
    env.wait_until_no_timers().await;
}

#[test(tokio::test)]
async fn timers_due_during_downtime_fire_on_start() {
    let env = TestEnv::start(registry()).await;
    let invocation_id = env.engine.submit(reminder()).await.unwrap();
    env.wait_until_suspended(invocation_id).await;

    env.engine.shutdown();
    env.clock.advance_time_by(REMINDER_DELAY * 2);
    let env = env.restart(registry()).await;

    assert_that!(
        env.engine.attach(invocation_id).await.unwrap(),
        eq(Bytes::from_static(b"call mom"))
    );
}
