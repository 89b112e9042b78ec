// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! BootROM (BROM) probe and the chunked-upload primitive shared by FDL1 and
//! FDL2 loading (§4.10). The BROM hello is sent unframed; everything after
//! it uses the HDLC codec in `super::hdlc`.

use crate::error::{FlashError, FramingError, ProtocolError, Result};
use crate::sprd::hdlc::{self, ChecksumMode};
use crate::transport::{Transport, read_exact_cancellable, write_all_cancellable};
use crate::types::CancellationToken;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 0x840;
const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BromCmd {
    Version = 0x00,
    StartData = 0x01,
    MidData = 0x02,
    EndData = 0x03,
    Exec = 0x04,
}

/// Emits a single unframed `0x7E` probe and expects a framed acknowledgement
/// back (§4.10 "BROM probe").
pub fn probe(t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
    write_all_cancellable(t, &[0x7E], FRAME_TIMEOUT, cancel)?;
    let mut first = [0u8; 1];
    read_exact_cancellable(t, &mut first, FRAME_TIMEOUT, cancel)?;
    if first[0] != 0x7E {
        return Err(FramingError::BadMagic { offset: 0 }.into());
    }
    // Drain the rest of the acknowledgement frame up to and including the
    // closing 0x7E; BROM's ack carries no meaningful payload.
    let mut byte = [0u8; 1];
    loop {
        read_exact_cancellable(t, &mut byte, FRAME_TIMEOUT, cancel)?;
        if byte[0] == 0x7E {
            return Ok(());
        }
    }
}

/// Reads the BROM `Version` (type 0x00) reply confirming the device is
/// alive in BROM stage.
pub fn read_version(t: &mut dyn Transport, cancel: &CancellationToken) -> Result<Vec<u8>> {
    let frame = read_hdlc_frame(t, cancel, ChecksumMode::Crc16)?;
    if frame.1 != BromCmd::Version as u16 {
        return Err(FramingError::UnexpectedCommand(frame.1 as u32).into());
    }
    Ok(frame.0)
}

fn read_hdlc_frame(
    t: &mut dyn Transport,
    cancel: &CancellationToken,
    mode: ChecksumMode,
) -> Result<(Vec<u8>, u16)> {
    let mut raw = vec![0x7Eu8];
    let mut byte = [0u8; 1];
    // skip any leading flag bytes (devices sometimes pad with extra 0x7E)
    loop {
        read_exact_cancellable(t, &mut byte, FRAME_TIMEOUT, cancel)?;
        if byte[0] != 0x7E {
            raw.push(byte[0]);
            break;
        }
    }
    loop {
        read_exact_cancellable(t, &mut byte, FRAME_TIMEOUT, cancel)?;
        raw.push(byte[0]);
        if byte[0] == 0x7E {
            break;
        }
    }
    let _ = mode;
    hdlc::unframe(&raw)
}

/// Start-data (type 0x01): declares load address, size, and checksum mode
/// for the upload that follows (§4.10).
pub fn start_data(
    t: &mut dyn Transport,
    cancel: &CancellationToken,
    load_address: u32,
    size: u32,
    mode: ChecksumMode,
) -> Result<()> {
    let mut payload = Vec::with_capacity(9);
    payload.write_u32::<BigEndian>(load_address).unwrap();
    payload.write_u32::<BigEndian>(size).unwrap();
    payload.push(match mode {
        ChecksumMode::Crc16 => 0,
        ChecksumMode::Sum16 => 1,
    });
    let frame = hdlc::frame(&payload, BromCmd::StartData as u16, mode);
    write_all_cancellable(t, &frame, FRAME_TIMEOUT, cancel)?;
    let (_, ack_type) = read_hdlc_frame(t, cancel, mode)?;
    expect_ack(ack_type)
}

/// Mid-data (type 0x02): one sequential upload chunk. Every chunk's length
/// equals `DEFAULT_CHUNK_SIZE` except possibly the last, which may be
/// short (§4.10 chunking invariants). Each chunk must be acknowledged
/// within 5s or the transfer fails with a timeout.
pub fn mid_data_chunk(
    t: &mut dyn Transport,
    cancel: &CancellationToken,
    chunk: &[u8],
    mode: ChecksumMode,
) -> Result<()> {
    let frame = hdlc::frame(chunk, BromCmd::MidData as u16, mode);
    write_all_cancellable(t, &frame, FRAME_TIMEOUT, cancel)?;
    let mut raw = vec![0x7Eu8];
    let mut byte = [0u8; 1];
    loop {
        read_exact_cancellable(t, &mut byte, CHUNK_ACK_TIMEOUT, cancel)?;
        if byte[0] != 0x7E {
            raw.push(byte[0]);
            break;
        }
    }
    loop {
        read_exact_cancellable(t, &mut byte, CHUNK_ACK_TIMEOUT, cancel)?;
        raw.push(byte[0]);
        if byte[0] == 0x7E {
            break;
        }
    }
    let (_, ack_type) = hdlc::unframe(&raw)?;
    expect_ack(ack_type)
}

pub fn end_data(t: &mut dyn Transport, cancel: &CancellationToken, mode: ChecksumMode) -> Result<()> {
    let frame = hdlc::frame(&[], BromCmd::EndData as u16, mode);
    write_all_cancellable(t, &frame, FRAME_TIMEOUT, cancel)?;
    let (_, ack_type) = read_hdlc_frame(t, cancel, mode)?;
    expect_ack(ack_type)
}

pub fn exec(t: &mut dyn Transport, cancel: &CancellationToken, mode: ChecksumMode) -> Result<()> {
    let frame = hdlc::frame(&[], BromCmd::Exec as u16, mode);
    write_all_cancellable(t, &frame, FRAME_TIMEOUT, cancel)?;
    let (_, ack_type) = read_hdlc_frame(t, cancel, mode)?;
    expect_ack(ack_type)
}

fn expect_ack(ack_type: u16) -> Result<()> {
    // Acks echo back the command type they respond to on most Spreadtrum
    // BROM/FDL generations; anything else is a NAK.
    if ack_type == BromCmd::StartData as u16
        || ack_type == BromCmd::MidData as u16
        || ack_type == BromCmd::EndData as u16
        || ack_type == BromCmd::Exec as u16
        || ack_type == 0x80
    {
        Ok(())
    } else {
        Err(FlashError::Protocol(ProtocolError::Nak { detail: format!("unexpected ack type 0x{ack_type:x}") }))
    }
}

/// Uploads a whole image in `DEFAULT_CHUNK_SIZE` chunks via start/mid/end,
/// then executes it. Shared by FDL1 and FDL2 upload (§4.10).
pub fn upload_and_exec(
    t: &mut dyn Transport,
    cancel: &CancellationToken,
    image: &[u8],
    load_address: u32,
    chunk_size: usize,
    mode: ChecksumMode,
) -> Result<()> {
    start_data(t, cancel, load_address, image.len() as u32, mode)?;
    for chunk in image.chunks(chunk_size) {
        mid_data_chunk(t, cancel, chunk, mode)?;
    }
    end_data(t, cancel, mode)?;
    exec(t, cancel, mode)
}
