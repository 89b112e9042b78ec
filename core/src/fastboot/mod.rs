// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Android Fastboot path: framed command/response engine (C11) with
//! sparse-image streaming and a flash-script orchestrator. See spec §4.11.

pub mod protocol;
pub mod script;

pub use protocol::{FastbootEngine, Reply};
