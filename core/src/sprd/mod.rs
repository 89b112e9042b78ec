// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Spreadtrum/Unisoc path: HDLC-like framing (C2) → BootROM handshake →
//! FDL1/FDL2 stage machine (C10), fed by the PAC firmware-package parser
//! (C4). See spec §4.4, §4.10.

pub mod bootrom;
pub mod fdl;
pub mod hdlc;
pub mod pac;

pub use fdl::{SprdEngine, SprdStage};
