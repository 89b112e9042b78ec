// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! `flashcore`: a vendor-neutral engine for flashing Qualcomm (Sahara +
//! Firehose), Spreadtrum/Unisoc (BootROM + FDL), and Android Fastboot
//! targets over serial or USB bulk transports.
//!
//! Callers enter through one of the three facades in [`facade`]; everything
//! below it (framing, codecs, engines) is an implementation detail reached
//! through those facades or, for offline file-format work (GPT, PAC,
//! sparse, OTA payload), directly.

pub mod error;
pub mod facade;
pub mod fastboot;
pub mod payload;
pub mod qualcomm;
pub mod spak;
pub mod sparse;
pub mod sprd;
pub mod transport;
pub mod types;

pub use error::{FlashError, Result};
pub use facade::{FastbootFacade, QualcommFacade, SprdFacade};
pub use types::{Backend, CancellationToken, ConnectOptions, FlashEvent, Partition};
