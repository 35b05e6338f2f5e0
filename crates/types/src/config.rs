// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::retries::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("configuration loading error: {0}")]
    Figment(Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

// Because thiserror doesn't support auto-boxing or auto implements From with boxing.
impl From<figment::Error> for ConfigLoadError {
    fn from(value: figment::Error) -> Self {
        Self::Figment(Box::new(value))
    }
}

/// # Engine options
///
/// Options of the invocation engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct EngineOptions {
    /// # Retry policy
    ///
    /// Policy applied when a handler fails with a retryable error. The invocation is executed
    /// again from its last durable journal entry after each delay.
    pub retry_policy: RetryPolicy,

    /// # Idempotency retention
    ///
    /// How long the outcome of a request carrying an idempotency key is retained. Within this
    /// window, requests with the same key get the stored outcome back; after it, the key can be
    /// reused.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub idempotency_retention: humantime::Duration,

    /// # Reject timestamp-like idempotency keys
    ///
    /// Idempotency keys which look like they embed a wall-clock timestamp are only reported with
    /// a warning by default. When enabled, such requests are rejected with a terminal error.
    pub reject_timestamp_like_idempotency_keys: bool,

    /// # Timers in memory limit
    ///
    /// Maximum number of durable timers the timer service keeps in memory. Timers beyond this
    /// limit are loaded from storage when earlier ones fire. Unlimited if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timers_in_memory_limit: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(10),
                Some(Duration::from_secs(10)),
            ),
            idempotency_retention: Duration::from_secs(60 * 60 * 24).into(),
            reject_timestamp_like_idempotency_keys: false,
            timers_in_memory_limit: None,
        }
    }
}

impl EngineOptions {
    pub fn idempotency_retention(&self) -> Duration {
        self.idempotency_retention.into()
    }

    /// Loads the options layering, from lowest to highest priority: defaults, the optional TOML
    /// file, `DURABLE_` prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut figment = Figment::from(Serialized::defaults(EngineOptions::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment = figment.merge(
            Env::prefixed("DURABLE_")
                .split("__")
                .map(|k| k.as_str().replace('_', "-").into()),
        );

        let options: EngineOptions = figment.extract()?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        if let RetryPolicy::Exponential { factor, .. } = &self.retry_policy {
            if *factor < 1.0 {
                return Err(ConfigLoadError::InvalidConfiguration(format!(
                    "retry-policy factor must be >= 1.0, got {factor}"
                )));
            }
        }
        if self.timers_in_memory_limit == Some(0) {
            return Err(ConfigLoadError::InvalidConfiguration(
                "timers-in-memory-limit must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}
