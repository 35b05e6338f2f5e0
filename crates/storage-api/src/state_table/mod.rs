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

use bytes::Bytes;
use bytestring::ByteString;

use durable_types::identifiers::ServiceId;

use crate::Result;

/// A state value together with its version. The version starts at 1 and is incremented by every
/// write of the same state name; it is informational only.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ObjectState {
    pub value: Bytes,
    pub version: u64,
}

pub trait StateTable {
    fn get_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
    ) -> impl Future<Output = Result<Option<ObjectState>>> + Send;

    /// Returns the new version of the state entry.
    fn put_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
        state_value: Bytes,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn delete_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_all_user_state(
        &self,
        service_id: &ServiceId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// State names of the service instance, in lexicographic order.
    fn get_user_state_keys(
        &self,
        service_id: &ServiceId,
    ) -> impl Future<Output = Result<Vec<ByteString>>> + Send;
}
