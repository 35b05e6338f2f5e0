// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This module contains all the core types representing a service invocation.

use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;

use crate::errors::TerminalError;
use crate::identifiers::{EntryIndex, IdempotencyId, InvocationId, ServiceId};
use crate::journal::EntryResult;

#[derive(
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    Debug,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ServiceType {
    Service,
    VirtualObject,
    Workflow,
}

impl ServiceType {
    pub fn is_keyed(&self) -> bool {
        matches!(self, ServiceType::VirtualObject | ServiceType::Workflow)
    }
}

#[derive(
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    Debug,
    Default,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum VirtualObjectHandlerType {
    #[default]
    Exclusive,
    Shared,
}

#[derive(
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    Debug,
    Default,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum WorkflowHandlerType {
    #[default]
    Workflow,
    Shared,
}

/// How an invocation accesses the state of its key.
#[derive(
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    Debug,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum AccessMode {
    /// Serialized with every other handler on the same key.
    Exclusive,
    /// Concurrent with other shared handlers, never with an exclusive one.
    Shared,
}

#[derive(Eq, Hash, PartialEq, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum InvocationTargetType {
    Service,
    VirtualObject(VirtualObjectHandlerType),
    Workflow(WorkflowHandlerType),
}

impl InvocationTargetType {
    pub fn is_keyed(&self) -> bool {
        !matches!(self, Self::Service)
    }

    pub fn can_read_state(&self) -> bool {
        self.is_keyed()
    }

    /// Only handlers holding the exclusive lease of their key may write its state.
    pub fn can_write_state(&self) -> bool {
        self.access_mode() == Some(AccessMode::Exclusive)
    }

    /// Access mode the scheduler must grant before the handler runs. Plain services are not
    /// subject to key arbitration.
    pub fn access_mode(&self) -> Option<AccessMode> {
        match self {
            InvocationTargetType::Service => None,
            InvocationTargetType::VirtualObject(VirtualObjectHandlerType::Exclusive)
            | InvocationTargetType::Workflow(WorkflowHandlerType::Workflow) => {
                Some(AccessMode::Exclusive)
            }
            InvocationTargetType::VirtualObject(VirtualObjectHandlerType::Shared)
            | InvocationTargetType::Workflow(WorkflowHandlerType::Shared) => {
                Some(AccessMode::Shared)
            }
        }
    }
}

impl fmt::Display for InvocationTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<InvocationTargetType> for ServiceType {
    fn from(value: InvocationTargetType) -> Self {
        match value {
            InvocationTargetType::Service => ServiceType::Service,
            InvocationTargetType::VirtualObject(_) => ServiceType::VirtualObject,
            InvocationTargetType::Workflow(_) => ServiceType::Workflow,
        }
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum InvocationTarget {
    Service {
        name: ByteString,
        handler: ByteString,
    },
    VirtualObject {
        name: ByteString,
        key: ByteString,
        handler: ByteString,
        handler_ty: VirtualObjectHandlerType,
    },
    Workflow {
        name: ByteString,
        key: ByteString,
        handler: ByteString,
        handler_ty: WorkflowHandlerType,
    },
}

impl InvocationTarget {
    pub fn service(name: impl Into<ByteString>, handler: impl Into<ByteString>) -> Self {
        Self::Service {
            name: name.into(),
            handler: handler.into(),
        }
    }

    pub fn virtual_object(
        name: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler: impl Into<ByteString>,
        handler_ty: VirtualObjectHandlerType,
    ) -> Self {
        Self::VirtualObject {
            name: name.into(),
            key: key.into(),
            handler: handler.into(),
            handler_ty,
        }
    }

    pub fn workflow(
        name: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler: impl Into<ByteString>,
        handler_ty: WorkflowHandlerType,
    ) -> Self {
        Self::Workflow {
            name: name.into(),
            key: key.into(),
            handler: handler.into(),
            handler_ty,
        }
    }

    pub fn service_name(&self) -> &ByteString {
        let (Self::Service { name, .. }
        | Self::VirtualObject { name, .. }
        | Self::Workflow { name, .. }) = self;
        name
    }

    /// Key of the object or workflow instance. `None` for plain services.
    pub fn key(&self) -> Option<&ByteString> {
        match self {
            Self::Service { .. } => None,
            Self::VirtualObject { key, .. } | Self::Workflow { key, .. } => Some(key),
        }
    }

    pub fn handler_name(&self) -> &ByteString {
        let (Self::Service { handler, .. }
        | Self::VirtualObject { handler, .. }
        | Self::Workflow { handler, .. }) = self;
        handler
    }

    pub fn as_keyed_service_id(&self) -> Option<ServiceId> {
        self.key()
            .map(|key| ServiceId::new(self.service_name().clone(), key.clone()))
    }

    pub fn service_ty(&self) -> ServiceType {
        self.invocation_target_ty().into()
    }

    pub fn invocation_target_ty(&self) -> InvocationTargetType {
        match *self {
            Self::Service { .. } => InvocationTargetType::Service,
            Self::VirtualObject { handler_ty, .. } => {
                InvocationTargetType::VirtualObject(handler_ty)
            }
            Self::Workflow { handler_ty, .. } => InvocationTargetType::Workflow(handler_ty),
        }
    }
}

impl fmt::Display for InvocationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.service_name())?;
        if let Some(key) = self.key() {
            write!(f, "{key}/")?;
        }
        write!(f, "{}", self.handler_name())?;
        Ok(())
    }
}

/// What a suspended invocation is waiting for. Any of the listed conditions wakes it up.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WaitCondition {
    Promise {
        owner: InvocationId,
        name: ByteString,
    },
    Timer {
        sleep_index: u32,
        fire_at: crate::time::MillisSinceEpoch,
    },
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Promise { owner, name } => write!(f, "promise {owner}/{name}"),
            WaitCondition::Timer { fire_at, .. } => write!(f, "timer at {fire_at}"),
        }
    }
}

/// Lifecycle status of an invocation. Only the engine mutates it; `Completed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InvocationStatus {
    Pending,
    Running,
    Suspended { waiting_for: Vec<WaitCondition> },
    Completed(Bytes),
    Failed(TerminalError),
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Completed(_) | InvocationStatus::Failed(_)
        )
    }

    /// The final outcome, if the invocation reached a terminal status.
    pub fn outcome(&self) -> Option<EntryResult> {
        match self {
            InvocationStatus::Completed(output) => Some(EntryResult::Success(output.clone())),
            InvocationStatus::Failed(err) => Some(EntryResult::Failure(err.clone())),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Running => "running",
            InvocationStatus::Suspended { .. } => "suspended",
            InvocationStatus::Completed(_) => "completed",
            InvocationStatus::Failed(_) => "failed",
        }
    }
}

/// The persisted record of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Invocation {
    pub invocation_id: InvocationId,
    pub invocation_target: InvocationTarget,
    pub argument: Bytes,
    pub status: InvocationStatus,
    /// Random value drawn when the record is created. An invocation re-created under the same id
    /// after its idempotency key expired gets a new incarnation, and with it new child ids.
    pub incarnation: u64,
    /// Idempotency keys of the requests admitted to this invocation. Each of them is committed
    /// with the outcome once the invocation finishes.
    pub idempotency_ids: Vec<IdempotencyId>,
    /// Invocations synchronously waiting on this one, outermost first. Used to detect
    /// self-referential locking.
    pub caller_chain: Vec<InvocationId>,
}

impl Invocation {
    pub fn new(
        invocation_id: InvocationId,
        invocation_target: InvocationTarget,
        argument: Bytes,
    ) -> Self {
        Self {
            invocation_id,
            invocation_target,
            argument,
            status: InvocationStatus::Pending,
            incarnation: rand::random(),
            idempotency_ids: Vec::new(),
            caller_chain: Vec::new(),
        }
    }

    /// Id of the sub-invocation started at journal `index` by this incarnation.
    pub fn child_id(&self, index: EntryIndex) -> InvocationId {
        InvocationId::for_child(&self.invocation_id, self.incarnation, index)
    }

    /// The chain this invocation passes to its synchronous callees.
    pub fn callee_chain(&self) -> Vec<InvocationId> {
        let mut chain = self.caller_chain.clone();
        chain.push(self.invocation_id);
        chain
    }
}
