// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identifiers of invocations, keyed service instances and idempotent requests.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytestring::ByteString;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::invocation::{InvocationTarget, InvocationTargetType, WorkflowHandlerType};

/// Index of an entry within an invocation journal.
pub type EntryIndex = u32;

#[derive(Debug, thiserror::Error)]
pub enum IdDecodeError {
    #[error("bad length")]
    Length,
    #[error("base62 decode error: {0}")]
    Codec(String),
    #[error("unrecognized resource type prefix")]
    TypeMismatch,
}

/// InvocationId uniquely identifies one invocation. Ids of workflow runs and of requests carrying
/// an idempotency key are derived deterministically from the request, every other id is random.
#[derive(
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    Debug,
    PartialOrd,
    Ord,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct InvocationId(u128);

impl InvocationId {
    const PREFIX: &'static str = "inv_";
    const HASH_SEPARATOR: u8 = 0x2c;

    pub fn generate(invocation_target: &InvocationTarget, idempotency_key: Option<&str>) -> Self {
        // --- Rules for deterministic ID
        // * If the target IS a workflow run, use workflow name + key
        // * If the target IS an idempotent request, use the idempotency scope + key
        // * If the target IS NEITHER an idempotent request or a workflow run, then just generate a random ulid
        match (idempotency_key, invocation_target.invocation_target_ty()) {
            (_, InvocationTargetType::Workflow(WorkflowHandlerType::Workflow)) => {
                Self::hashed(b"wf", |hasher| {
                    hasher.update(invocation_target.service_name());
                    if let Some(key) = invocation_target.key() {
                        hasher.update([Self::HASH_SEPARATOR]);
                        hasher.update(key);
                    }
                })
            }
            (Some(idempotency_key), _) => Self::hashed(b"ik", |hasher| {
                hasher.update(invocation_target.service_name());
                if let Some(key) = invocation_target.key() {
                    hasher.update([Self::HASH_SEPARATOR]);
                    hasher.update(key);
                }
                hasher.update([Self::HASH_SEPARATOR]);
                hasher.update(invocation_target.handler_name());
                hasher.update([Self::HASH_SEPARATOR]);
                hasher.update(idempotency_key);
            }),
            (_, _) => Self::from_u128(Ulid::new().into()),
        }
    }

    /// Id of the workflow run invocation of the given workflow instance.
    pub fn for_workflow(service_name: &str, key: &str) -> Self {
        Self::generate(
            &InvocationTarget::workflow(service_name, key, "run", WorkflowHandlerType::Workflow),
            None,
        )
    }

    /// Deterministic id of the sub-invocation dispatched by the given incarnation of `parent` at
    /// journal entry `index`. Replaying the parent therefore re-attaches to the very same child.
    pub fn for_child(parent: &InvocationId, incarnation: u64, index: EntryIndex) -> Self {
        Self::hashed(b"child", |hasher| {
            hasher.update(parent.0.to_be_bytes());
            hasher.update([Self::HASH_SEPARATOR]);
            hasher.update(incarnation.to_be_bytes());
            hasher.update([Self::HASH_SEPARATOR]);
            hasher.update(index.to_be_bytes());
        })
    }

    pub const fn from_u128(id: u128) -> Self {
        Self(id)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    fn hashed(scope: &[u8], f: impl FnOnce(&mut Sha256)) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scope);
        hasher.update([Self::HASH_SEPARATOR]);
        f(&mut hasher);
        let result = hasher.finalize();
        let mut int_bytes = [0u8; 16];
        int_bytes.copy_from_slice(&result[..16]);
        Self(u128::from_be_bytes(int_bytes))
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, base62::encode(self.0))
    }
}

impl FromStr for InvocationId {
    type Err = IdDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(Self::PREFIX)
            .ok_or(IdDecodeError::TypeMismatch)?;
        if encoded.is_empty() {
            return Err(IdDecodeError::Length);
        }
        base62::decode(encoded)
            .map(InvocationId)
            .map_err(|e| IdDecodeError::Codec(e.to_string()))
    }
}

/// Id of a keyed service instance (virtual object or workflow): all the invocations for the same
/// service name and key share state and are subject to the same access arbitration.
#[derive(
    Eq,
    Hash,
    PartialEq,
    PartialOrd,
    Ord,
    Clone,
    Debug,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[display("{service_name}/{key}")]
pub struct ServiceId {
    /// Identifies the service
    pub service_name: ByteString,
    /// Identifies the service instance for the given service name
    pub key: ByteString,
}

impl ServiceId {
    pub fn new(service_name: impl Into<ByteString>, key: impl Into<ByteString>) -> Self {
        Self {
            service_name: service_name.into(),
            key: key.into(),
        }
    }
}

/// Scope of an idempotency key: the same key used against different handlers, or different
/// object keys, identifies different requests.
#[derive(Eq, Hash, PartialEq, PartialOrd, Ord, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct IdempotencyId {
    /// Identifies the invoked service
    pub service_name: ByteString,
    /// Service key, if any
    pub service_key: Option<ByteString>,
    /// Identifies the invoked service handler
    pub service_handler: ByteString,
    /// The user supplied idempotency_key
    pub idempotency_key: ByteString,
}

impl IdempotencyId {
    pub fn combine(invocation_target: &InvocationTarget, idempotency_key: ByteString) -> Self {
        IdempotencyId {
            service_name: invocation_target.service_name().clone(),
            service_key: invocation_target.key().cloned(),
            service_handler: invocation_target.handler_name().clone(),
            idempotency_key,
        }
    }
}

impl Display for IdempotencyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.service_name)?;
        if let Some(key) = &self.service_key {
            write!(f, "{key}/")?;
        }
        write!(f, "{}#{}", self.service_handler, self.idempotency_key)
    }
}
