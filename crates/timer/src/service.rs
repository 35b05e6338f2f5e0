// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::{Clock, Timer, TimerKey, TimerReader};

pub(crate) mod clock;

/// Which part of the stored timers is held in memory.
#[derive(Debug)]
enum Window<K> {
    /// Nothing was read from storage yet.
    Unloaded,
    /// Memory holds every stored timer with a key up to and including `K`.
    UpTo(K),
    /// Memory holds every stored timer.
    Complete,
}

struct LoadingTimers<T: Timer> {
    timers: BoxFuture<'static, Vec<T>>,
    /// Timers removed while the read was in flight. The read might still return them.
    removed: Vec<T::TimerKey>,
}

/// Fires timers in the order of their [`TimerKey`], each exactly once.
///
/// Callers must store a timer durably before adding it to the service, and delete it from storage
/// when removing it: the service forgets timers beyond its in-memory limit and reads them back
/// through the [`TimerReader`] later.
///
/// [`TimerService::next_timer`] is cancellation safe: dropping the returned future loses no
/// timer, which makes it suitable for `tokio::select!` loops.
pub struct TimerService<T: Timer, C, R> {
    clock: C,
    timer_reader: R,
    max_timers_in_memory: usize,
    timers: BTreeMap<T::TimerKey, T>,
    window: Window<T::TimerKey>,
    loading: Option<LoadingTimers<T>>,
}

impl<T, C, R> TimerService<T, C, R>
where
    T: Timer + Debug + Send + 'static,
    C: Clock,
    R: TimerReader<T> + Clone + Send + 'static,
{
    pub fn new(clock: C, num_timers_in_memory_limit: Option<usize>, timer_reader: R) -> Self {
        Self {
            clock,
            timer_reader,
            max_timers_in_memory: num_timers_in_memory_limit.unwrap_or(usize::MAX).max(1),
            timers: BTreeMap::new(),
            window: Window::Unloaded,
            loading: None,
        }
    }

    pub fn add_timer(&mut self, timer: T) {
        let key = timer.timer_key().clone();
        if let Some(loading) = &mut self.loading {
            loading.removed.retain(|removed| removed != &key);
        }

        // while reading, keep everything: the read might have missed a timer stored after it began
        let admitted = self.loading.is_some()
            || match &self.window {
                Window::Unloaded | Window::Complete => true,
                Window::UpTo(bound) => &key <= bound,
            };

        if admitted {
            trace!("Adding timer {key:?}");
            self.timers.insert(key, timer);
            self.trim();
        } else {
            trace!("Timer {key:?} is beyond the in-memory window, it will be read from storage");
        }
    }

    pub fn remove_timer(&mut self, key: &T::TimerKey) {
        trace!("Removing timer {key:?}");
        self.timers.remove(key);
        if let Some(loading) = &mut self.loading {
            loading.removed.push(key.clone());
        }
    }

    /// Completes with the next due timer. Pending forever if there are no timers.
    pub async fn next_timer(&mut self) -> T {
        loop {
            if self.loading.is_some() || self.needs_loading() {
                self.load_timers().await;
                continue;
            }

            let Some(wake_up_time) = self.timers.first_key_value().map(|(key, _)| key.wake_up_time())
            else {
                return std::future::pending().await;
            };

            if let Some(sleep) = self.clock.sleep_until(wake_up_time) {
                sleep.await;
                // the earliest timer might have changed in the meantime
                continue;
            }

            if let Some((key, timer)) = self.timers.pop_first() {
                trace!("Firing timer {key:?}");
                return timer;
            }
        }
    }

    fn needs_loading(&self) -> bool {
        match self.window {
            Window::Unloaded => true,
            Window::UpTo(_) => self.timers.is_empty(),
            Window::Complete => false,
        }
    }

    async fn load_timers(&mut self) {
        if self.loading.is_none() {
            let previous_timer_key = match &self.window {
                Window::UpTo(bound) => Some(bound.clone()),
                Window::Unloaded | Window::Complete => None,
            };
            let num_timers = self.max_timers_in_memory;
            let mut timer_reader = self.timer_reader.clone();
            debug!("Reading up to {num_timers} timers after {previous_timer_key:?}");

            self.loading = Some(LoadingTimers {
                timers: async move {
                    timer_reader
                        .get_timers(num_timers, previous_timer_key)
                        .await
                }
                .boxed(),
                removed: Vec::new(),
            });
        }

        let Some(loading) = &mut self.loading else {
            return;
        };
        let timers = (&mut loading.timers).await;
        let Some(LoadingTimers { removed, .. }) = self.loading.take() else {
            return;
        };

        let exhausted = timers.len() < self.max_timers_in_memory;
        let last_key = timers.last().map(|timer| timer.timer_key().clone());
        for timer in timers {
            let key = timer.timer_key().clone();
            if !removed.contains(&key) {
                self.timers.entry(key).or_insert(timer);
            }
        }

        match last_key {
            Some(last_key) if !exhausted => {
                let beyond: Vec<_> = self
                    .timers
                    .range((Bound::Excluded(&last_key), Bound::Unbounded))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in beyond {
                    self.timers.remove(&key);
                }
                self.window = Window::UpTo(last_key);
            }
            _ => self.window = Window::Complete,
        }
        self.trim();
    }

    fn trim(&mut self) {
        // the pending read decides about the window once it completes
        if self.loading.is_some() {
            return;
        }
        while self.timers.len() > self.max_timers_in_memory {
            self.timers.pop_last();
            if matches!(self.window, Window::Unloaded) {
                // the first read starts from the beginning and brings the evicted timers back
                continue;
            }
            if let Some((last, _)) = self.timers.last_key_value() {
                self.window = Window::UpTo(last.clone());
            }
        }
    }
}
