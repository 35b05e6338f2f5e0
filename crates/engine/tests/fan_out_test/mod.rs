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
use durable_test_util::from_json_payload;
use durable_types::errors::codes;
use durable_types::invocation::InvocationStatus;
use durable_types::journal::Entry;

use crate::TestEnv;

async fn work(_ctx: Context, input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    if matches!(input.as_ref(), b"2" | b"4") {
        return Err(HandlerError::terminal(
            codes::CONFLICT,
            format!("cannot process {}", String::from_utf8_lossy(&input)),
        ));
    }
    Ok(input)
}

async fn nap(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    ctx.sleep(Duration::from_secs(60 * 60)).await?;
    Ok(Bytes::from_static(b"slow"))
}

/// Processes the items in parallel and reports the outcome of each, sorted by position.
async fn process(
    ctx: &mut Context,
    items: &[&'static str],
    duplicate_first: bool,
) -> std::result::Result<Bytes, HandlerError> {
    let mut handles = ctx
        .dispatch(
            items
                .iter()
                .map(|item| (Address::service("Worker", "work"), Bytes::from(*item)))
                .collect(),
        )
        .await?;
    if duplicate_first {
        let first = handles[0];
        handles.push(first);
    }
    let mut outcomes: Vec<(usize, Option<String>)> = ctx
        .join_all(handles)
        .collect()
        .await?
        .into_iter()
        .map(|(position, outcome)| {
            let value = outcome
                .ok()
                .map(|value| String::from_utf8_lossy(&value).into_owned());
            (position, value)
        })
        .collect();
    outcomes.sort();
    Ok(Bytes::from(serde_json::to_vec(&outcomes)?))
}

async fn batch(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    process(&mut ctx, &["1", "2", "3"], false).await
}

async fn batch_of_five(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    process(&mut ctx, &["1", "2", "3", "4", "5"], false).await
}

/// Joins the handle of the single call twice.
async fn same_call_twice(
    mut ctx: Context,
    _input: Bytes,
) -> std::result::Result<Bytes, HandlerError> {
    process(&mut ctx, &["1"], true).await
}

async fn first(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let handles = ctx
        .dispatch(vec![
            (Address::service("Worker", "nap"), Bytes::new()),
            (Address::service("Worker", "work"), Bytes::from_static(b"fast")),
        ])
        .await?;
    let (position, outcome) = ctx.join_first(handles).await?;
    let value = outcome?;
    Ok(Bytes::from(format!(
        "{position}:{}",
        String::from_utf8_lossy(&value)
    )))
}

async fn fire_and_forget(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    ctx.send(&Address::service("Worker", "nap"), Bytes::new())
        .await?;
    Ok(Bytes::from_static(b"sent"))
}

async fn join_nothing(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    ctx.join_first(Vec::new()).await?;
    Ok(Bytes::new())
}

fn registry() -> HandlerRegistry {
    HandlerRegistry::default()
        .with_service(
            ServiceBuilder::service("Worker")
                .handler("work", work)
                .handler("nap", nap),
        )
        .and_then(|registry| {
            registry.with_service(
                ServiceBuilder::service("Batch")
                    .handler("all", batch)
                    .handler("five", batch_of_five)
                    .handler("twice", same_call_twice)
                    .handler("first", first)
                    .handler("fireAndForget", fire_and_forget)
                    .handler("nothing", join_nothing),
            )
        })
        .unwrap()
}

fn batch_request(handler: &'static str) -> InvocationRequest {
    InvocationRequest::new(Address::service("Batch", handler), Bytes::new())
}

#[test(tokio::test)]
async fn join_all_yields_every_outcome() {
    let env = TestEnv::start(registry()).await;

    let output = env.engine.invoke(batch_request("all")).await.unwrap();

    assert_that!(
        from_json_payload::<Vec<(usize, Option<String>)>>(&output),
        elements_are![
            eq((0, Some("1".to_owned()))),
            eq((1, None)),
            eq((2, Some("3".to_owned())))
        ]
    );
}

#[test(tokio::test)]
async fn join_all_records_every_completion_failures_included() {
    let env = TestEnv::start(registry()).await;

    let invocation_id = env.engine.submit(batch_request("five")).await.unwrap();
    let output = env.engine.attach(invocation_id).await.unwrap();

    assert_that!(
        from_json_payload::<Vec<(usize, Option<String>)>>(&output),
        elements_are![
            eq((0, Some("1".to_owned()))),
            eq((1, None)),
            eq((2, Some("3".to_owned()))),
            eq((3, None)),
            eq((4, Some("5".to_owned())))
        ]
    );
    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    let completions: Vec<_> = journal
        .iter()
        .filter(|entry| matches!(entry.entry, Entry::CallCompleted { .. }))
        .collect();
    assert_that!(completions, len(eq(5)));
    assert_that!(journal, len(eq(10)));
}

#[test(tokio::test)]
async fn joining_the_same_call_twice_yields_it_twice() {
    let env = TestEnv::start(registry()).await;

    let output = env.engine.invoke(batch_request("twice")).await.unwrap();

    assert_that!(
        from_json_payload::<Vec<(usize, Option<String>)>>(&output),
        elements_are![eq((0, Some("1".to_owned()))), eq((1, Some("1".to_owned())))]
    );
}

#[test(tokio::test)]
async fn join_first_does_not_wait_for_the_others() {
    let env = TestEnv::start(registry()).await;

    let first_id = env.engine.submit(batch_request("first")).await.unwrap();

    assert_that!(
        env.engine.attach(first_id).await.unwrap(),
        eq(Bytes::from_static(b"1:fast"))
    );
    // the slow call keeps going on its own
    let nap_id = env.child_of(first_id, 0).await;
    env.wait_until_suspended(nap_id).await;

    env.clock.advance_time_by(Duration::from_secs(60 * 60));
    assert_that!(
        env.engine.attach(nap_id).await.unwrap(),
        eq(Bytes::from_static(b"slow"))
    );
}

#[test(tokio::test)]
async fn send_returns_before_the_callee_completes() {
    let env = TestEnv::start(registry()).await;

    let sender_id = env
        .engine
        .submit(batch_request("fireAndForget"))
        .await
        .unwrap();
    assert_that!(
        env.engine.attach(sender_id).await.unwrap(),
        eq(Bytes::from_static(b"sent"))
    );

    let nap_id = env.child_of(sender_id, 0).await;
    env.wait_until_suspended(nap_id).await;
    assert_that!(
        env.status(sender_id).await,
        some(eq(InvocationStatus::Completed(Bytes::from_static(b"sent"))))
    );
}

#[test(tokio::test)]
async fn join_first_needs_a_call() {
    let env = TestEnv::start(registry()).await;

    let err = env.engine.invoke(batch_request("nothing")).await.unwrap_err();
    assert_that!(err.code(), eq(codes::BAD_REQUEST));
}
