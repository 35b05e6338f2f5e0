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

use bytes::Bytes;
use futures::future;
use googletest::prelude::*;
use test_log::test;

use durable_engine::{
    Address, Context, HandlerError, HandlerRegistry, InvocationRequest, ServiceBuilder,
};
use durable_test_util::let_assert;
use durable_types::errors::codes;
use durable_types::invocation::InvocationStatus;

use crate::TestEnv;

#[derive(Default)]
struct Concurrency {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Adds an item to the cart under the key in the input.
async fn checkout(mut ctx: Context, input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let key = String::from_utf8_lossy(&input).into_owned();
    ctx.call(&Address::keyed("Cart", key, "add"), Bytes::new())
        .await
}

async fn add(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let items = ctx.get_json::<u64>("items").await?.unwrap_or(0) + 1;
    ctx.set_json("items", &items).await?;
    Ok(Bytes::from(items.to_string()))
}

async fn slow_add(
    mut ctx: Context,
    input: Bytes,
    concurrency: Arc<Concurrency>,
) -> std::result::Result<Bytes, HandlerError> {
    let running = concurrency.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    concurrency
        .max_in_flight
        .fetch_max(running, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let result = add(ctx, input).await;
    concurrency.in_flight.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn peek(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    let items = ctx.get_json::<u64>("items").await?.unwrap_or(0);
    Ok(Bytes::from(items.to_string()))
}

async fn sneak(mut ctx: Context, _input: Bytes) -> std::result::Result<Bytes, HandlerError> {
    ctx.set_json("items", &100).await?;
    Ok(Bytes::new())
}

fn registry(concurrency: Arc<Concurrency>) -> HandlerRegistry {
    HandlerRegistry::default()
        .with_service(
            ServiceBuilder::virtual_object("Cart")
                .handler("checkout", checkout)
                .handler("add", add)
                .handler("slow_add", move |ctx, input| {
                    slow_add(ctx, input, Arc::clone(&concurrency))
                })
                .shared_handler("peek", peek)
                .shared_handler("sneak", sneak),
        )
        .unwrap()
}

fn cart(key: &'static str, handler: &'static str, input: &'static str) -> InvocationRequest {
    InvocationRequest::new(Address::keyed("Cart", key, handler), input)
}

#[test(tokio::test)]
async fn nested_exclusive_call_on_the_same_key_deadlocks() {
    let env = TestEnv::start(registry(Default::default())).await;

    let checkout_id = env
        .engine
        .submit(cart("cart-A", "checkout", "cart-A"))
        .await
        .unwrap();
    let_assert!(Err(err) = env.engine.attach(checkout_id).await);
    assert_that!(err.code(), eq(codes::DEADLOCK));

    // the nested call was rejected without running
    let add_id = env.child_of(checkout_id, 0).await;
    let_assert!(Some(InvocationStatus::Failed(add_err)) = env.status(add_id).await);
    assert_that!(add_err.code(), eq(codes::DEADLOCK));
    assert_that!(
        env.engine.invoke(cart("cart-A", "peek", "")).await.unwrap(),
        eq(Bytes::from_static(b"0"))
    );
}

#[test(tokio::test)]
async fn nested_exclusive_call_on_another_key_succeeds() {
    let env = TestEnv::start(registry(Default::default())).await;

    assert_that!(
        env.engine
            .invoke(cart("cart-A", "checkout", "cart-B"))
            .await
            .unwrap(),
        eq(Bytes::from_static(b"1"))
    );
    assert_that!(
        env.engine.invoke(cart("cart-B", "peek", "")).await.unwrap(),
        eq(Bytes::from_static(b"1"))
    );
}

#[test(tokio::test)]
async fn shared_handlers_cannot_write_state() {
    let env = TestEnv::start(registry(Default::default())).await;

    let_assert!(Err(err) = env.engine.invoke(cart("cart-A", "sneak", "")).await);
    assert_that!(err.code(), eq(codes::STATE_READ_ONLY));
    assert_that!(
        env.engine.invoke(cart("cart-A", "peek", "")).await.unwrap(),
        eq(Bytes::from_static(b"0"))
    );
}

#[test(tokio::test)]
async fn exclusive_handlers_on_one_key_never_overlap() {
    let concurrency = Arc::new(Concurrency::default());
    let env = TestEnv::start(registry(Arc::clone(&concurrency))).await;

    let outcomes = future::join_all(
        (0..5).map(|_| env.engine.invoke(cart("cart-A", "slow_add", ""))),
    )
    .await;

    let mut items: Vec<_> = outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .collect();
    items.sort();
    assert_that!(
        items,
        elements_are![
            eq(Bytes::from_static(b"1")),
            eq(Bytes::from_static(b"2")),
            eq(Bytes::from_static(b"3")),
            eq(Bytes::from_static(b"4")),
            eq(Bytes::from_static(b"5"))
        ]
    );
    assert_that!(concurrency.max_in_flight.load(Ordering::SeqCst), eq(1));
}

#[test(tokio::test)]
async fn different_keys_run_concurrently() {
    let concurrency = Arc::new(Concurrency::default());
    let env = TestEnv::start(registry(Arc::clone(&concurrency))).await;

    let outcomes = future::join_all(
        ["cart-A", "cart-B", "cart-C"]
            .into_iter()
            .map(|key| env.engine.invoke(cart(key, "slow_add", ""))),
    )
    .await;

    for outcome in outcomes {
        assert_that!(outcome.unwrap(), eq(Bytes::from_static(b"1")));
    }
    assert_that!(
        concurrency.max_in_flight.load(Ordering::SeqCst),
        ge(2)
    );
}
