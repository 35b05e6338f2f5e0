// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable invocation engine.
//!
//! Handlers are registered in a [`HandlerRegistry`] and invoked through the [`Engine`]. Every
//! non-deterministic operation of a handler goes through its [`Context`] and is recorded in the
//! journal of the invocation, so a failed or restarted invocation replays up to where it stopped
//! and continues from there.

mod context;
mod dedup;
mod engine;
mod error;
pub mod events;
mod fan_out;
mod metric_definitions;
mod promises;
mod registry;
mod saga;
mod timers;

pub use context::Context;
pub use dedup::{DeduplicationIndex, IdempotencyKeyCheck, check_idempotency_key};
pub use engine::{Engine, InvocationRequest};
pub use error::{EngineError, HandlerError, Suspension};
pub use fan_out::{CallHandle, JoinAll};
pub use promises::{DurablePromise, FirstCompleted};
pub use registry::{
    Address, HandlerFn, HandlerRegistry, RegistryError, ServiceBuilder, WORKFLOW_RUN_HANDLER,
};
pub use saga::{CompensationHandle, CompensationReport, Compensations};
pub use timers::TimerHandle;
