// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Timer service firing durable timers in wake up order. Timers live in storage; the service keeps
//! a bounded window of the earliest ones in memory and reads the rest through a [`TimerReader`].

use std::future::Future;

mod service;

pub use durable_types::timer::{Timer, TimerKey};
#[cfg(any(test, feature = "test-util"))]
pub use service::clock::ManualClock;
pub use service::TimerService;
pub use service::clock::{Clock, TokioClock};

/// Read access to the durably stored timers.
pub trait TimerReader<T: Timer> {
    /// Returns at most `num_timers` stored timers in ascending [`TimerKey`] order, starting
    /// strictly after `previous_timer_key` or at the first timer if it is `None`.
    fn get_timers(
        &mut self,
        num_timers: usize,
        previous_timer_key: Option<T::TimerKey>,
    ) -> impl Future<Output = Vec<T>> + Send;
}
