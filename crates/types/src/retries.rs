// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! Delays between the executions of an invocation which failed with a retryable error.

use std::borrow::Cow;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;

/// Upper bound of the random delay added to exponential retries, relative to the delay.
const JITTER: f32 = 0.3;

/// How often and after which delays a failed operation is retried.
///
/// `max_attempts` counts retries, the initial attempt excluded. Without it, retries never stop.
/// Intervals use the [`humantime`] format when read from configuration, e.g. `"250ms"`.
#[serde_with::serde_as]
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// Never retry.
    #[default]
    None,
    /// Wait `interval` before every retry.
    FixedDelay {
        #[serde_as(as = "serde_with::DisplayFromStr")]
        interval: humantime::Duration,
        max_attempts: Option<NonZeroUsize>,
    },
    /// Start with `initial_interval` and multiply the delay by `factor` on every retry, up to
    /// `max_interval`.
    Exponential {
        #[serde_as(as = "serde_with::DisplayFromStr")]
        initial_interval: humantime::Duration,
        factor: f32,
        max_attempts: Option<NonZeroUsize>,
        #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
        max_interval: Option<humantime::Duration>,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval: interval.into(),
            max_attempts: max_attempts.and_then(NonZeroUsize::new),
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval: initial_interval.into(),
            factor,
            max_attempts: max_attempts.and_then(NonZeroUsize::new),
            max_interval: max_interval.map(Into::into),
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            Self::None => None,
            Self::FixedDelay { max_attempts, .. } | Self::Exponential { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    /// Runs `operation` until it succeeds, fails with an error for which `retryable` is false, or
    /// the policy gives up. Returns the last error in the latter two cases.
    pub async fn retry_if<T, E, Op, Fut, R>(
        self,
        mut operation: Op,
        mut retryable: R,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E) -> bool,
    {
        let mut delays = self.into_iter();
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match delays.next() {
                Some(delay) if retryable(&err) => tokio::time::sleep(delay).await,
                _ => return Err(err),
            }
        }
    }

    pub fn iter(&self) -> RetryIter<'_> {
        RetryIter::new(Cow::Borrowed(self))
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter<'static>;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter::new(Cow::Owned(self))
    }
}

/// Yields the delay before each retry, and ends once the policy gives up.
#[derive(Debug)]
pub struct RetryIter<'a> {
    policy: Cow<'a, RetryPolicy>,
    retries: usize,
    previous_delay: Option<Duration>,
}

impl<'a> RetryIter<'a> {
    fn new(policy: Cow<'a, RetryPolicy>) -> Self {
        Self {
            policy,
            retries: 0,
            previous_delay: None,
        }
    }

    /// Number of delays handed out so far.
    pub fn retries(&self) -> usize {
        self.retries
    }
}

impl Iterator for RetryIter<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts()
            .is_some_and(|max| self.retries >= max.get())
        {
            return None;
        }

        let delay = match self.policy.as_ref() {
            RetryPolicy::None => return None,
            RetryPolicy::FixedDelay { interval, .. } => (*interval).into(),
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_interval,
                ..
            } => {
                let base = match self.previous_delay {
                    None => Duration::from(*initial_interval),
                    Some(previous) => {
                        let grown = previous.mul_f32(*factor);
                        match max_interval {
                            Some(max) => grown.min((*max).into()),
                            None => grown,
                        }
                    }
                };
                self.previous_delay = Some(base);
                with_jitter(base)
            }
        };
        self.retries += 1;
        Some(delay)
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.mul_f32(JITTER);
    if max_jitter.is_zero() {
        delay
    } else {
        delay + rand::rng().random_range(Duration::ZERO..max_jitter)
    }
}
