// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Explicit handler registration.
//!
//! Services are described with a [`ServiceBuilder`] and registered once in a [`HandlerRegistry`]
//! before the engine starts. The engine owns the registry afterwards, so handlers can't be added
//! or replaced while invocations run.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use durable_types::errors::{TerminalError, codes};
use durable_types::invocation::{
    InvocationTarget, InvocationTargetType, ServiceType, VirtualObjectHandlerType,
    WorkflowHandlerType,
};

use crate::context::Context;
use crate::error::HandlerError;

/// Type-erased handler function.
pub type HandlerFn =
    Arc<dyn Fn(Context, Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> + Send + Sync>;

/// Name of the workflow handler which runs exactly once per workflow key.
pub const WORKFLOW_RUN_HANDLER: &str = "run";

/// Logical address of a handler, as used by callers. It is resolved against the registry to an
/// [`InvocationTarget`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub service: ByteString,
    pub key: Option<ByteString>,
    pub handler: ByteString,
}

impl Address {
    /// Address of a handler of a plain service.
    pub fn service(service: impl Into<ByteString>, handler: impl Into<ByteString>) -> Self {
        Self {
            service: service.into(),
            key: None,
            handler: handler.into(),
        }
    }

    /// Address of a handler of a virtual object or workflow instance.
    pub fn keyed(
        service: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler: impl Into<ByteString>,
    ) -> Self {
        Self {
            service: service.into(),
            key: Some(key.into()),
            handler: handler.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.service)?;
        if let Some(key) = &self.key {
            write!(f, "{key}/")?;
        }
        write!(f, "{}", self.handler)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service '{0}' is registered already")]
    DuplicateService(ByteString),
}

struct HandlerDefinition {
    target_ty: InvocationTargetType,
    handler: HandlerFn,
}

/// Describes one service and its handlers.
pub struct ServiceBuilder {
    name: ByteString,
    ty: ServiceType,
    handlers: HashMap<ByteString, HandlerDefinition>,
}

impl ServiceBuilder {
    /// A stateless service. Its handlers run concurrently without any lease.
    pub fn service(name: impl Into<ByteString>) -> Self {
        Self::new(name.into(), ServiceType::Service)
    }

    /// A virtual object. Its handlers are exclusive unless added with
    /// [`ServiceBuilder::shared_handler`].
    pub fn virtual_object(name: impl Into<ByteString>) -> Self {
        Self::new(name.into(), ServiceType::VirtualObject)
    }

    /// A workflow. Its [`ServiceBuilder::run`] handler executes once per key, every other handler
    /// is shared.
    pub fn workflow(name: impl Into<ByteString>) -> Self {
        Self::new(name.into(), ServiceType::Workflow)
    }

    fn new(name: ByteString, ty: ServiceType) -> Self {
        Self {
            name,
            ty,
            handlers: HashMap::new(),
        }
    }

    /// Adds a handler with the default type of the service: plain for services, exclusive for
    /// virtual objects, shared for workflows.
    pub fn handler<F, Fut>(self, name: impl Into<ByteString>, handler: F) -> Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        let target_ty = match self.ty {
            ServiceType::Service => InvocationTargetType::Service,
            ServiceType::VirtualObject => {
                InvocationTargetType::VirtualObject(VirtualObjectHandlerType::Exclusive)
            }
            ServiceType::Workflow => InvocationTargetType::Workflow(WorkflowHandlerType::Shared),
        };
        self.add(name.into(), target_ty, handler)
    }

    /// Adds a handler which runs concurrently with other shared handlers of the same key and can
    /// only read state.
    pub fn shared_handler<F, Fut>(self, name: impl Into<ByteString>, handler: F) -> Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        let target_ty = match self.ty {
            ServiceType::Service => InvocationTargetType::Service,
            ServiceType::VirtualObject => {
                InvocationTargetType::VirtualObject(VirtualObjectHandlerType::Shared)
            }
            ServiceType::Workflow => InvocationTargetType::Workflow(WorkflowHandlerType::Shared),
        };
        self.add(name.into(), target_ty, handler)
    }

    /// Adds the workflow run handler, named [`WORKFLOW_RUN_HANDLER`]. On other service types this
    /// is the same as [`ServiceBuilder::handler`].
    pub fn run<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        match self.ty {
            ServiceType::Workflow => self.add(
                ByteString::from_static(WORKFLOW_RUN_HANDLER),
                InvocationTargetType::Workflow(WorkflowHandlerType::Workflow),
                handler,
            ),
            _ => self.handler(WORKFLOW_RUN_HANDLER, handler),
        }
    }

    fn add<F, Fut>(mut self, name: ByteString, target_ty: InvocationTargetType, handler: F) -> Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.handlers.insert(name, HandlerDefinition { target_ty, handler });
        self
    }
}

struct ServiceDefinition {
    ty: ServiceType,
    handlers: HashMap<ByteString, HandlerDefinition>,
}

/// Maps `(service, handler)` to the handler function.
#[derive(Default)]
pub struct HandlerRegistry {
    services: HashMap<ByteString, ServiceDefinition>,
}

impl HandlerRegistry {
    pub fn register(&mut self, service: ServiceBuilder) -> Result<(), RegistryError> {
        if self.services.contains_key(&service.name) {
            return Err(RegistryError::DuplicateService(service.name));
        }
        debug!(
            "Registering {} '{}' with {} handlers",
            service.ty,
            service.name,
            service.handlers.len()
        );
        self.services.insert(
            service.name,
            ServiceDefinition {
                ty: service.ty,
                handlers: service.handlers,
            },
        );
        Ok(())
    }

    /// Builder style [`HandlerRegistry::register`].
    pub fn with_service(mut self, service: ServiceBuilder) -> Result<Self, RegistryError> {
        self.register(service)?;
        Ok(self)
    }

    /// Resolves the address to the target of the registered handler.
    pub fn resolve(&self, address: &Address) -> Result<InvocationTarget, TerminalError> {
        let Some(definition) = self
            .services
            .get(&address.service)
            .and_then(|service| Some((service, service.handlers.get(&address.handler)?)))
        else {
            return Err(TerminalError::service_handler_not_found(
                &address.service,
                &address.handler,
            ));
        };
        let (service, handler) = definition;

        match (service.ty.is_keyed(), &address.key) {
            (true, None) => {
                return Err(TerminalError::new(
                    codes::BAD_REQUEST,
                    format!("{} '{}' requires a key", service.ty, address.service),
                ));
            }
            (false, Some(_)) => {
                return Err(TerminalError::new(
                    codes::BAD_REQUEST,
                    format!("service '{}' is not keyed", address.service),
                ));
            }
            _ => {}
        }

        let service_name = address.service.clone();
        let handler_name = address.handler.clone();
        Ok(match (handler.target_ty, &address.key) {
            (InvocationTargetType::VirtualObject(handler_ty), Some(key)) => {
                InvocationTarget::virtual_object(service_name, key.clone(), handler_name, handler_ty)
            }
            (InvocationTargetType::Workflow(handler_ty), Some(key)) => {
                InvocationTarget::workflow(service_name, key.clone(), handler_name, handler_ty)
            }
            _ => InvocationTarget::service(service_name, handler_name),
        })
    }

    /// The handler function of a resolved target.
    pub fn handler(&self, target: &InvocationTarget) -> Option<HandlerFn> {
        self.services
            .get(target.service_name())?
            .handlers
            .get(target.handler_name())
            .map(|definition| Arc::clone(&definition.handler))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services = f.debug_map();
        for (name, service) in &self.services {
            services.entry(name, &service.ty);
        }
        services.finish()
    }
}
