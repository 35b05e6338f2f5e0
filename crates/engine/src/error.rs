// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use durable_storage_api::StorageError;
use durable_types::errors::{InvocationErrorCode, MaybeRetryableError, TerminalError, codes};
use durable_types::identifiers::InvocationId;
use durable_types::invocation::WaitCondition;

/// Result of a handler and of every context operation.
///
/// Handler code creates [`HandlerError::Terminal`] and [`HandlerError::Retryable`] errors.
/// [`HandlerError::Suspended`] is only produced by the context when an operation can't complete
/// yet; handlers propagate it with `?` so the engine can park the invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("retryable error: {0:#}")]
    Retryable(anyhow::Error),
    #[error("suspended: {0}")]
    Suspended(Suspension),
}

impl HandlerError {
    pub fn terminal(code: impl Into<InvocationErrorCode>, message: impl Into<String>) -> Self {
        HandlerError::Terminal(TerminalError::new(code, message))
    }

    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Retryable(err.into())
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, HandlerError::Suspended(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(value: anyhow::Error) -> Self {
        HandlerError::Retryable(value)
    }
}

impl From<StorageError> for HandlerError {
    fn from(value: StorageError) -> Self {
        HandlerError::Retryable(value.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        HandlerError::Terminal(TerminalError::new(
            codes::BAD_REQUEST,
            format!("cannot decode payload: {value}"),
        ))
    }
}

/// The conditions an invocation waits for when it suspends. Any of them resumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspension {
    waiting_for: Vec<WaitCondition>,
}

impl Suspension {
    pub(crate) fn new(waiting_for: Vec<WaitCondition>) -> Self {
        Self { waiting_for }
    }

    pub fn waiting_for(&self) -> &[WaitCondition] {
        &self.waiting_for
    }

    pub(crate) fn into_waiting_for(self) -> Vec<WaitCondition> {
        self.waiting_for
    }
}

impl fmt::Display for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiting for ")?;
        for (i, condition) in self.waiting_for.iter().enumerate() {
            if i > 0 {
                write!(f, " or ")?;
            }
            write!(f, "{condition}")?;
        }
        Ok(())
    }
}

/// Errors of the engine operations which don't run handler code.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invocation {0} not found")]
    NotFound(InvocationId),
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl MaybeRetryableError for EngineError {
    fn retryable(&self) -> bool {
        match self {
            EngineError::Storage(err) => err.retryable(),
            EngineError::NotFound(_) => false,
            EngineError::ShuttingDown => true,
        }
    }
}

impl From<EngineError> for TerminalError {
    fn from(value: EngineError) -> Self {
        match value {
            err @ EngineError::NotFound(_) => TerminalError::new(codes::NOT_FOUND, err.to_string()),
            err => TerminalError::internal(err.to_string()),
        }
    }
}
