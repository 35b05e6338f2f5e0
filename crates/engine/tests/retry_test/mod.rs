// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use googletest::prelude::*;
use parking_lot::Mutex;
use test_log::test;

use durable_engine::events::InvocationEventKind;
use durable_engine::{
    Address, Context, HandlerError, HandlerRegistry, InvocationRequest, ServiceBuilder,
};
use durable_storage_api::invocation_status_table::InvocationStatusTable;
use durable_storage_api::journal_table::JournalTable;
use durable_storage_memory::MemoryStorage;
use durable_test_util::let_assert;
use durable_timer::ManualClock;
use durable_types::errors::codes;
use durable_types::invocation::{Invocation, InvocationStatus};
use durable_types::time::MillisSinceEpoch;

use crate::{START, TestEnv, test_options};

#[derive(Default)]
struct Observed {
    side_effects: AtomicUsize,
    attempts: AtomicUsize,
    draws: Mutex<Vec<(u64, MillisSinceEpoch)>>,
}

/// Fails twice after its side effect, then succeeds.
async fn flaky(
    mut ctx: Context,
    _input: Bytes,
    observed: Arc<Observed>,
) -> std::result::Result<Bytes, HandlerError> {
    let reservation = ctx
        .run("reserve", || async {
            observed.side_effects.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(Bytes::from_static(b"reserved"))
        })
        .await?;
    if observed.attempts.fetch_add(1, Ordering::SeqCst) < 2 {
        return Err(HandlerError::retryable(anyhow!("connection reset")));
    }
    Ok(reservation)
}

async fn broken(
    _ctx: Context,
    _input: Bytes,
    observed: Arc<Observed>,
) -> std::result::Result<Bytes, HandlerError> {
    observed.attempts.fetch_add(1, Ordering::SeqCst);
    Err(HandlerError::retryable(anyhow!("always down")))
}

async fn lottery(
    mut ctx: Context,
    _input: Bytes,
    observed: Arc<Observed>,
) -> std::result::Result<Bytes, HandlerError> {
    let draw = ctx.random_u64().await?;
    let drawn_at = ctx.now().await?;
    observed.draws.lock().push((draw, drawn_at));
    ctx.sleep(Duration::from_secs(1)).await?;
    Ok(Bytes::from(draw.to_string()))
}

/// Takes a different path on every execution.
async fn drifting(
    mut ctx: Context,
    _input: Bytes,
    observed: Arc<Observed>,
) -> std::result::Result<Bytes, HandlerError> {
    let step = if observed.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
        "charge"
    } else {
        "refund"
    };
    ctx.run(step, || async { Ok::<_, HandlerError>(Bytes::new()) })
        .await?;
    ctx.sleep(Duration::from_secs(1)).await?;
    Ok(Bytes::new())
}

/// Records every step, its output only depends on the journal.
async fn ledger(
    mut ctx: Context,
    _input: Bytes,
    observed: Arc<Observed>,
) -> std::result::Result<Bytes, HandlerError> {
    let opened = ctx
        .run("open", || async {
            observed.side_effects.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(Bytes::from_static(b"opened"))
        })
        .await?;
    let opened_at = ctx.now().await?;
    ctx.sleep(Duration::ZERO).await?;
    let posted = ctx
        .run("post", || async move {
            Ok::<_, HandlerError>(Bytes::from(format!(
                "{}@{}",
                String::from_utf8_lossy(&opened),
                opened_at.as_u64()
            )))
        })
        .await?;
    ctx.run("close", || async { Ok::<_, HandlerError>(Bytes::from_static(b"closed")) })
        .await?;
    Ok(posted)
}

fn registry(observed: Arc<Observed>) -> HandlerRegistry {
    let (o1, o2, o3, o4, o5) = (
        Arc::clone(&observed),
        Arc::clone(&observed),
        Arc::clone(&observed),
        Arc::clone(&observed),
        observed,
    );
    HandlerRegistry::default()
        .with_service(
            ServiceBuilder::service("Inventory")
                .handler("flaky", move |ctx, input| flaky(ctx, input, Arc::clone(&o1)))
                .handler("broken", move |ctx, input| {
                    broken(ctx, input, Arc::clone(&o2))
                })
                .handler("lottery", move |ctx, input| {
                    lottery(ctx, input, Arc::clone(&o3))
                })
                .handler("drifting", move |ctx, input| {
                    drifting(ctx, input, Arc::clone(&o4))
                })
                .handler("ledger", move |ctx, input| {
                    ledger(ctx, input, Arc::clone(&o5))
                }),
        )
        .unwrap()
}

fn inventory(handler: &'static str) -> InvocationRequest {
    InvocationRequest::new(Address::service("Inventory", handler), Bytes::new())
}

#[test(tokio::test)]
async fn retryable_errors_are_retried_without_repeating_side_effects() {
    let observed = Arc::new(Observed::default());
    let env = TestEnv::start(registry(Arc::clone(&observed))).await;

    let invocation_id = env.engine.submit(inventory("flaky")).await.unwrap();
    assert_that!(
        env.engine.attach(invocation_id).await.unwrap(),
        eq(Bytes::from_static(b"reserved"))
    );

    assert_that!(observed.attempts.load(Ordering::SeqCst), eq(3));
    assert_that!(observed.side_effects.load(Ordering::SeqCst), eq(1));
    assert_that!(
        env.events.count_of(invocation_id, |kind| matches!(
            kind,
            InvocationEventKind::Retrying { .. }
        )),
        eq(2)
    );
}

#[test(tokio::test)]
async fn retries_are_bounded_by_the_policy() {
    let observed = Arc::new(Observed::default());
    let env = TestEnv::start(registry(Arc::clone(&observed))).await;

    let_assert!(Err(err) = env.engine.invoke(inventory("broken")).await);

    assert_that!(err.code(), eq(codes::RETRIES_EXHAUSTED));
    // the first attempt and three retries
    assert_that!(observed.attempts.load(Ordering::SeqCst), eq(4));
}

#[test(tokio::test)]
async fn replay_returns_the_recorded_values() {
    let observed = Arc::new(Observed::default());
    let env = TestEnv::start(registry(Arc::clone(&observed))).await;

    let invocation_id = env.engine.submit(inventory("lottery")).await.unwrap();
    env.wait_until_suspended(invocation_id).await;
    env.clock.advance_time_by(Duration::from_secs(1));
    let output = env.engine.attach(invocation_id).await.unwrap();

    let draws = observed.draws.lock().clone();
    assert_that!(draws, len(eq(2)));
    assert_that!(draws[1], eq(draws[0]));
    assert_that!(draws[0].1, eq(START));
    assert_that!(output, eq(Bytes::from(draws[0].0.to_string())));
}

#[test(tokio::test)]
async fn resuming_from_any_journal_prefix_records_the_same_journal() {
    let env = TestEnv::start(registry(Default::default())).await;
    let invocation_id = env.engine.submit(inventory("ledger")).await.unwrap();
    let output = env.engine.attach(invocation_id).await.unwrap();
    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    let invocation = env
        .storage
        .get_invocation(&invocation_id)
        .await
        .unwrap()
        .unwrap();
    env.engine.shutdown();
    assert_that!(journal, len(eq(6)));

    for recorded in 0..=journal.len() {
        // the state storage holds after crashing once `recorded` entries were written
        let storage = MemoryStorage::new();
        storage
            .put_invocation_if_absent(&Invocation {
                status: InvocationStatus::Running,
                ..invocation.clone()
            })
            .await
            .unwrap();
        for entry in &journal[..recorded] {
            storage
                .append_journal_entry(&invocation_id, entry)
                .await
                .unwrap();
        }

        let observed = Arc::new(Observed::default());
        let resumed = TestEnv::start_on(
            storage,
            ManualClock::new(START),
            registry(Arc::clone(&observed)),
            test_options(),
        )
        .await;
        assert_that!(
            resumed.engine.attach(invocation_id).await.unwrap(),
            eq(output.clone())
        );
        assert_that!(
            resumed.storage.get_journal(&invocation_id).await.unwrap(),
            eq(journal.clone())
        );
        // the recorded side effect is not executed again
        let expected_side_effects = usize::from(recorded == 0);
        assert_that!(
            observed.side_effects.load(Ordering::SeqCst),
            eq(expected_side_effects)
        );
        resumed.engine.shutdown();
    }
}

#[test(tokio::test)]
async fn diverging_replay_fails_the_invocation() {
    let observed = Arc::new(Observed::default());
    let env = TestEnv::start(registry(Arc::clone(&observed))).await;

    let invocation_id = env.engine.submit(inventory("drifting")).await.unwrap();
    env.wait_until_suspended(invocation_id).await;
    env.clock.advance_time_by(Duration::from_secs(1));

    let_assert!(Err(err) = env.engine.attach(invocation_id).await);
    assert_that!(err.code(), eq(codes::JOURNAL_MISMATCH));
}

#[test(tokio::test)]
async fn unknown_handlers_are_not_found() {
    let env = TestEnv::start(registry(Default::default())).await;

    let_assert!(
        Err(err) = env
            .engine
            .invoke(InvocationRequest::new(
                Address::service("Inventory", "restock"),
                Bytes::new(),
            ))
            .await
    );
    assert_that!(err.code(), eq(codes::NOT_FOUND));
}
