// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;
use std::time::Duration;

use durable_types::time::MillisSinceEpoch;

/// Source of time for the [`TimerService`](crate::TimerService).
pub trait Clock {
    type SleepFuture: Future<Output = ()> + Send;

    fn now(&self) -> MillisSinceEpoch;

    /// Future completing once `wake_up_time` is reached, or `None` if it already has been.
    fn sleep_until(&mut self, wake_up_time: MillisSinceEpoch) -> Option<Self::SleepFuture>;
}

/// Wall clock backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type SleepFuture = tokio::time::Sleep;

    fn now(&self) -> MillisSinceEpoch {
        MillisSinceEpoch::now()
    }

    fn sleep_until(&mut self, wake_up_time: MillisSinceEpoch) -> Option<Self::SleepFuture> {
        let remaining = wake_up_time.duration_since(self.now());
        (remaining > Duration::ZERO).then(|| tokio::time::sleep(remaining))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "test-util"))]
mod manual {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::{BoxFuture, FutureExt};
    use tokio::sync::watch;

    use durable_types::time::MillisSinceEpoch;

    use super::Clock;

    /// Clock which only moves when told to. All clones observe the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<watch::Sender<MillisSinceEpoch>>,
    }

    impl ManualClock {
        pub fn new(time: MillisSinceEpoch) -> Self {
            Self {
                time: Arc::new(watch::Sender::new(time)),
            }
        }

        pub fn advance_time_by(&self, duration: Duration) {
            self.time.send_modify(|time| *time = *time + duration);
        }

        /// # Panics
        /// If `time` lies before the current time of this clock.
        pub fn advance_time_to(&self, time: MillisSinceEpoch) {
            assert!(self.now() <= time, "manual clock cannot go backwards");
            self.time.send_replace(time);
        }
    }

    impl Clock for ManualClock {
        type SleepFuture = BoxFuture<'static, ()>;

        fn now(&self) -> MillisSinceEpoch {
            *self.time.borrow()
        }

        fn sleep_until(&mut self, wake_up_time: MillisSinceEpoch) -> Option<Self::SleepFuture> {
            if wake_up_time <= self.now() {
                return None;
            }

            let mut time = self.time.subscribe();
            Some(
                async move {
                    // the sender outlives this future as long as the clock does
                    let _ = time.wait_for(|now| *now >= wake_up_time).await;
                }
                .boxed(),
            )
        }
    }
}
