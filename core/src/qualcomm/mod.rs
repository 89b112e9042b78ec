// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Qualcomm path: Sahara handshake (C7) → Firehose XML engine (C8),
//! vendor authentication (C9), and the GPT/rawprogram readers (C5) that
//! feed partition operations into Firehose.

pub mod firehose;
pub mod firehose_parsers;
pub mod gpt;
pub mod rawprogram;
pub mod sahara;
pub mod vendor_auth;

pub use firehose::{FirehoseConfig, FirehoseEngine, FirehoseResetMode, FirehoseStorageType};
pub use sahara::{SaharaCmdModeCmd, SaharaEngine, SaharaMode};
