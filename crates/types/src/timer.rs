// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Traits shared by the timer service and the timer storage.

use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;

use crate::time::MillisSinceEpoch;

/// A durable timer. Timers which carry no payload besides their key are their own key.
pub trait Timer: Hash + Eq + Borrow<Self::TimerKey> {
    type TimerKey: TimerKey + Send;

    fn timer_key(&self) -> &Self::TimerKey;
}

/// Total order of timers: by wake up time first, ties broken by the timer identity. Timers are
/// stored and scanned in this order, so it must be identical in memory and in storage.
pub trait TimerKey: Ord + Clone + Hash + Debug {
    fn wake_up_time(&self) -> MillisSinceEpoch;
}
