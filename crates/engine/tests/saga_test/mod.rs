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
use std::time::Duration;

use bytes::Bytes;
use googletest::prelude::*;
use parking_lot::Mutex;
use test_log::test;

use durable_engine::events::InvocationEventKind;
use durable_engine::{
    Address, CompensationReport, Context, EngineError, HandlerError, HandlerRegistry,
    InvocationRequest, ServiceBuilder,
};
use durable_test_util::let_assert;
use durable_types::errors::codes;
use durable_types::identifiers::{EntryIndex, InvocationId};
use durable_types::journal::EntryResult;

use crate::TestEnv;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn travel(handler: &'static str) -> Address {
    Address::service("Travel", handler)
}

async fn book(_ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    Ok(Bytes::from_static(b"booked"))
}

async fn cancel(
    _ctx: Context,
    _input: Bytes,
    log: Log,
    step: &'static str,
) -> std::result::Result<Bytes, HandlerError> {
    log.lock().push(step);
    Ok(Bytes::new())
}

async fn cancel_broken(_ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    Err(HandlerError::terminal(codes::CONFLICT, "cannot cancel"))
}

/// Books the flight and the hotel, then fails before the car is booked.
async fn book_trip(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let flight = ctx
        .compensations()
        .register(&travel("cancelFlight"), Bytes::new())
        .await?;
    ctx.call(&travel("bookFlight"), Bytes::new()).await?;
    ctx.compensations().arm(&flight).await?;

    let hotel = ctx
        .compensations()
        .register(&travel("cancelHotel"), Bytes::new())
        .await?;
    ctx.call(&travel("bookHotel"), Bytes::new()).await?;
    ctx.compensations().arm(&hotel).await?;

    ctx.compensations()
        .register(&travel("cancelCar"), Bytes::new())
        .await?;
    Err(HandlerError::terminal(codes::CONFLICT, "no cars left"))
}

async fn book_trip_with_broken_undo(
    mut ctx: Context,
    _input: Bytes,
) -> std::result::Result<Bytes, HandlerError> {
    for undo in ["cancelFlight", "cancelBroken", "cancelHotel"] {
        let handle = ctx
            .compensations()
            .register(&travel(undo), Bytes::new())
            .await?;
        ctx.compensations().arm(&handle).await?;
    }
    Err(HandlerError::terminal(codes::CONFLICT, "no cars left"))
}

/// Books the flight and undoes it on its own.
async fn book_and_undo(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let flight = ctx
        .compensations()
        .register(&travel("cancelFlight"), Bytes::new())
        .await?;
    ctx.call(&travel("bookFlight"), Bytes::new()).await?;
    ctx.compensations().arm(&flight).await?;
    ctx.compensations()
        .register(&travel("cancelHotel"), Bytes::new())
        .await?;

    let report = ctx.compensations().run_all().await?;
    Ok(Bytes::from(format!(
        "{}/{}",
        report.executed.len(),
        report.discarded
    )))
}

fn registry(log: Log) -> HandlerRegistry {
    let mut service = ServiceBuilder::service("Travel")
        .handler("bookFlight", book)
        .handler("bookHotel", book)
        .handler("cancelBroken", cancel_broken);
    for step in ["cancelFlight", "cancelHotel", "cancelCar"] {
        let log = Arc::clone(&log);
        service = service.handler(step, move |ctx, input| {
            cancel(ctx, input, Arc::clone(&log), step)
        });
    }

    HandlerRegistry::default()
        .with_service(service)
        .and_then(|registry| {
            registry.with_service(
                ServiceBuilder::service("Trip")
                    .handler("book", book_trip)
                    .handler("bookWithBrokenUndo", book_trip_with_broken_undo)
                    .handler("bookAndUndo", book_and_undo),
            )
        })
        .unwrap()
}

async fn submit_trip(env: &TestEnv, handler: &'static str) -> InvocationId {
    env.engine
        .submit(InvocationRequest::new(
            Address::service("Trip", handler),
            Bytes::new(),
        ))
        .await
        .unwrap()
}

fn executed_compensations(env: &TestEnv, invocation_id: InvocationId) -> Vec<(EntryIndex, bool)> {
    env.events
        .kinds_of(invocation_id)
        .into_iter()
        .filter_map(|kind| match kind {
            InvocationEventKind::CompensationExecuted { index, outcome } => {
                Some((index, matches!(outcome, EntryResult::Success(_))))
            }
            _ => None,
        })
        .collect()
}

#[test(tokio::test)]
async fn armed_compensations_run_in_reverse_order_after_a_terminal_failure() {
    let log = Log::default();
    let env = TestEnv::start(registry(Arc::clone(&log))).await;
    let trip_id = submit_trip(&env, "book").await;

    // the original failure is kept as outcome
    let_assert!(Err(err) = env.engine.attach(trip_id).await);
    assert_that!(err.code(), eq(codes::CONFLICT));

    assert_that!(log.lock().clone(), elements_are![eq("cancelHotel"), eq("cancelFlight")]);
    assert_that!(
        executed_compensations(&env, trip_id),
        elements_are![eq((4, true)), eq((0, true))]
    );
}

#[test(tokio::test)]
async fn trip_booked_again_after_key_expiry_compensates_again() {
    let log = Log::default();
    let env = TestEnv::start(registry(Arc::clone(&log))).await;
    let trip = || {
        InvocationRequest::new(Address::service("Trip", "book"), Bytes::new())
            .with_idempotency_key("trip-1")
    };

    let_assert!(Err(err) = env.engine.invoke(trip()).await);
    assert_that!(err.code(), eq(codes::CONFLICT));
    assert_that!(log.lock().len(), eq(2));

    env.clock.advance_time_by(Duration::from_secs(25 * 60 * 60));
    let_assert!(Err(err) = env.engine.invoke(trip()).await);
    assert_that!(err.code(), eq(codes::CONFLICT));
    assert_that!(
        log.lock().clone(),
        elements_are![
            eq("cancelHotel"),
            eq("cancelFlight"),
            eq("cancelHotel"),
            eq("cancelFlight")
        ]
    );
}

#[test(tokio::test)]
async fn failing_compensation_does_not_stop_the_others() {
    let log = Log::default();
    let env = TestEnv::start(registry(Arc::clone(&log))).await;
    let trip_id = submit_trip(&env, "bookWithBrokenUndo").await;

    let_assert!(Err(err) = env.engine.attach(trip_id).await);
    assert_that!(err.code(), eq(codes::CONFLICT));

    assert_that!(log.lock().clone(), elements_are![eq("cancelHotel"), eq("cancelFlight")]);
    assert_that!(
        executed_compensations(&env, trip_id),
        elements_are![eq((4, true)), eq((2, false)), eq((0, true))]
    );
}

#[test(tokio::test)]
async fn handlers_can_run_their_compensations() {
    let log = Log::default();
    let env = TestEnv::start(registry(Arc::clone(&log))).await;
    let trip_id = submit_trip(&env, "bookAndUndo").await;

    assert_that!(
        env.engine.attach(trip_id).await.unwrap(),
        eq(Bytes::from_static(b"1/1"))
    );
    assert_that!(log.lock().clone(), elements_are![eq("cancelFlight")]);

    // nothing is left to compensate
    assert_that!(
        env.engine.run_compensations(trip_id).await.unwrap(),
        eq(CompensationReport::default())
    );
    assert_that!(log.lock().clone(), len(eq(1)));
}

#[test(tokio::test)]
async fn compensations_of_unknown_invocations() {
    let env = TestEnv::start(registry(Log::default())).await;
    let unknown = InvocationId::from_u128(42);

    let_assert!(
        Err(EngineError::NotFound(invocation_id)) = env.engine.run_compensations(unknown).await
    );
    assert_that!(invocation_id, eq(unknown));
}
