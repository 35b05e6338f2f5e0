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
use bytestring::ByteString;
use googletest::prelude::*;
use test_log::test;

use durable_engine::events::InvocationEventKind;
use durable_engine::{
    Address, Context, FirstCompleted, HandlerError, HandlerRegistry, InvocationRequest,
    ServiceBuilder,
};
use durable_test_util::let_assert;
use durable_types::errors::{TerminalError, codes};
use durable_types::identifiers::InvocationId;
use durable_types::invocation::{InvocationStatus, WaitCondition};

use crate::{START, TestEnv};

const APPROVAL_TIMEOUT: Duration = Duration::from_secs(48 * 60 * 60);

async fn approval_run(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let approval = ctx.promise("approval").await?;
    ctx.await_promise(&approval).await
}

async fn approve(mut ctx: Context, input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let approval = ctx.workflow_promise("approval")?;
    ctx.resolve_promise(&approval, input).await?;
    Ok(Bytes::new())
}

async fn deny(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let approval = ctx.workflow_promise("approval")?;
    ctx.reject_promise(&approval, TerminalError::new(codes::CONFLICT, "denied"))
        .await?;
    Ok(Bytes::new())
}

async fn expense_run(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let approval = ctx.promise("approval").await?;
    let timeout = ctx.after(APPROVAL_TIMEOUT).await?;
    match ctx.await_first(&approval, &timeout).await? {
        FirstCompleted::Promise(outcome) => Ok(outcome?),
        FirstCompleted::Timer => Ok(Bytes::from_static(b"timed out")),
    }
}

async fn duplicate_run(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    ctx.promise("approval").await?;
    ctx.promise("approval").await?;
    Ok(Bytes::new())
}

fn registry() -> HandlerRegistry {
    HandlerRegistry::default()
        .with_service(
            ServiceBuilder::workflow("Approval")
                .run(approval_run)
                .handler("approve", approve)
                .handler("deny", deny),
        )
        .and_then(|registry| {
            registry.with_service(ServiceBuilder::workflow("Expense").run(expense_run))
        })
        .and_then(|registry| {
            registry.with_service(ServiceBuilder::workflow("Duplicate").run(duplicate_run))
        })
        .unwrap()
}

async fn start_run(env: &TestEnv, workflow: &'static str, key: &'static str) -> InvocationId {
    let run_id = env
        .engine
        .submit(InvocationRequest::new(
            Address::keyed(workflow, key, "run"),
            Bytes::new(),
        ))
        .await
        .unwrap();
    assert_that!(run_id, eq(InvocationId::for_workflow(workflow, key)));
    run_id
}

fn approval_condition(owner: InvocationId) -> WaitCondition {
    WaitCondition::Promise {
        owner,
        name: ByteString::from_static("approval"),
    }
}

#[test(tokio::test)]
async fn promise_settled_twice_keeps_the_first_value() {
    let env = TestEnv::start(registry()).await;
    let run_id = start_run(&env, "Approval", "req-1").await;

    assert_that!(
        env.wait_until_suspended(run_id).await,
        elements_are![eq(approval_condition(run_id))]
    );

    env.engine
        .resolve_promise(run_id, "approval", Bytes::from_static(b"true"))
        .await
        .unwrap();
    env.engine
        .resolve_promise(run_id, "approval", Bytes::from_static(b"false"))
        .await
        .unwrap();

    assert_that!(
        env.engine.attach(run_id).await.unwrap(),
        eq(Bytes::from_static(b"true"))
    );
    assert_that!(
        env.events
            .count_of(run_id, |kind| matches!(kind, InvocationEventKind::Completed)),
        eq(1)
    );
}

#[test(tokio::test)]
async fn workflow_handlers_settle_the_run_promise() {
    let env = TestEnv::start(registry()).await;
    let run_id = start_run(&env, "Approval", "req-1").await;
    env.wait_until_suspended(run_id).await;

    env.engine
        .invoke(InvocationRequest::new(
            Address::keyed("Approval", "req-1", "approve"),
            "yes",
        ))
        .await
        .unwrap();
    // settling again is not an error, the first outcome stays
    env.engine
        .invoke(InvocationRequest::new(
            Address::keyed("Approval", "req-1", "deny"),
            Bytes::new(),
        ))
        .await
        .unwrap();

    assert_that!(
        env.engine.attach(run_id).await.unwrap(),
        eq(Bytes::from_static(b"yes"))
    );
}

#[test(tokio::test)]
async fn promise_settled_before_it_is_awaited() {
    let env = TestEnv::start(registry()).await;

    env.engine
        .invoke(InvocationRequest::new(
            Address::keyed("Approval", "req-1", "approve"),
            "early",
        ))
        .await
        .unwrap();
    let run_id = start_run(&env, "Approval", "req-1").await;

    assert_that!(
        env.engine.attach(run_id).await.unwrap(),
        eq(Bytes::from_static(b"early"))
    );
}

#[test(tokio::test)]
async fn rejected_promise_fails_the_run() {
    let env = TestEnv::start(registry()).await;
    let run_id = start_run(&env, "Approval", "req-1").await;
    env.wait_until_suspended(run_id).await;

    env.engine
        .reject_promise(
            run_id,
            "approval",
            TerminalError::new(codes::CONFLICT, "denied"),
        )
        .await
        .unwrap();

    let_assert!(Err(err) = env.engine.attach(run_id).await);
    assert_that!(err.code(), eq(codes::CONFLICT));
}

#[test(tokio::test)]
async fn promise_wins_the_race_against_a_long_timer() {
    let env = TestEnv::start(registry()).await;
    let run_id = start_run(&env, "Expense", "exp-1").await;

    let waiting_for = env.wait_until_suspended(run_id).await;
    assert_that!(
        waiting_for,
        unordered_elements_are![
            eq(approval_condition(run_id)),
            eq(WaitCondition::Timer {
                sleep_index: 1,
                fire_at: START + APPROVAL_TIMEOUT,
            })
        ]
    );

    env.clock.advance_time_by(Duration::from_secs(60 * 60));
    env.engine
        .resolve_promise(run_id, "approval", Bytes::from_static(b"approved"))
        .await
        .unwrap();
    assert_that!(
        env.engine.attach(run_id).await.unwrap(),
        eq(Bytes::from_static(b"approved"))
    );

    // the losing timer still fires, without effect
    env.clock.advance_time_by(APPROVAL_TIMEOUT);
    env.wait_until_no_timers().await;
    assert_that!(
        env.status(run_id).await,
        some(eq(InvocationStatus::Completed(Bytes::from_static(
            b"approved"
        ))))
    );
    assert_that!(
        env.events
            .count_of(run_id, |kind| matches!(kind, InvocationEventKind::Resumed)),
        eq(1)
    );
}

#[test(tokio::test)]
async fn timer_wins_the_race_when_the_promise_is_late() {
    let env = TestEnv::start(registry()).await;
    let run_id = start_run(&env, "Expense", "exp-1").await;
    env.wait_until_suspended(run_id).await;

    env.clock.advance_time_by(APPROVAL_TIMEOUT);
    assert_that!(
        env.engine.attach(run_id).await.unwrap(),
        eq(Bytes::from_static(b"timed out"))
    );

    env.engine
        .resolve_promise(run_id, "approval", Bytes::from_static(b"approved"))
        .await
        .unwrap();
    env.settle().await;
    assert_that!(
        env.status(run_id).await,
        some(eq(InvocationStatus::Completed(Bytes::from_static(
            b"timed out"
        ))))
    );
}

#[test(tokio::test)]
async fn promise_names_are_unique_per_invocation() {
    let env = TestEnv::start(registry()).await;
    let run_id = start_run(&env, "Duplicate", "dup-1").await;

    let_assert!(Err(err) = env.engine.attach(run_id).await);
    assert_that!(err.code(), eq(codes::DUPLICATE_OPERATION));
}
