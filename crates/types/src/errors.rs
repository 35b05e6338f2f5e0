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
use std::fmt::{Debug, Display, Formatter};

/// Errors which might go away when the failed operation is tried again.
pub trait MaybeRetryableError: std::error::Error + 'static {
    fn retryable(&self) -> bool {
        false
    }
}

/// Numeric failure code, modelled after HTTP status codes. Codes from 570 up are specific to
/// durable execution.
#[derive(Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InvocationErrorCode(u16);

impl From<u16> for InvocationErrorCode {
    fn from(value: u16) -> Self {
        InvocationErrorCode(value)
    }
}

impl From<InvocationErrorCode> for u16 {
    fn from(value: InvocationErrorCode) -> Self {
        value.0
    }
}

impl fmt::Display for InvocationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} {name}", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for InvocationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub mod codes {
    use super::InvocationErrorCode;

    macro_rules! codes {
        ($($code:ident = $value:literal, $name:literal;)*) => {
            $(pub const $code: InvocationErrorCode = InvocationErrorCode($value);)*

            impl InvocationErrorCode {
                pub(super) fn name(&self) -> Option<&'static str> {
                    match self.0 {
                        $($value => Some($name),)*
                        _ => None,
                    }
                }
            }
        };
    }

    codes! {
        BAD_REQUEST = 400, "Bad request";
        NOT_FOUND = 404, "Not found";
        STATE_READ_ONLY = 405, "State is read-only";
        CONFLICT = 409, "Conflict";
        INVALID_IDEMPOTENCY_KEY = 422, "Invalid idempotency key";
        DEADLOCK = 423, "Deadlock";
        INTERNAL = 500, "Internal";
        JOURNAL_MISMATCH = 570, "Journal mismatch";
        DUPLICATE_OPERATION = 571, "Duplicate operation";
        RETRIES_EXHAUSTED = 572, "Retries exhausted";
    }
}

/// A permanent failure of an invocation or of one of its journaled operations.
///
/// Terminal errors are never retried. They are recorded in the journal like any other outcome, so
/// replaying a failed operation yields the same error.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TerminalError {
    code: InvocationErrorCode,
    message: String,
}

impl TerminalError {
    pub fn new(code: impl Into<InvocationErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    pub fn service_handler_not_found(
        service: impl fmt::Display,
        handler: impl fmt::Display,
    ) -> Self {
        Self::new(
            codes::NOT_FOUND,
            format!("no handler '{handler}' is registered for service '{service}'"),
        )
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(codes::DEADLOCK, message)
    }

    pub fn duplicate_operation(message: impl Into<String>) -> Self {
        Self::new(codes::DUPLICATE_OPERATION, message)
    }

    pub fn journal_mismatch(message: impl Into<String>) -> Self {
        Self::new(codes::JOURNAL_MISMATCH, message)
    }

    pub fn code(&self) -> InvocationErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for TerminalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Debug for TerminalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for TerminalError {}

impl MaybeRetryableError for TerminalError {}
