// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Types shared by all the crates of the durable invocation runtime.

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod invocation;
pub mod journal;
pub mod retries;
pub mod time;
pub mod timer;
