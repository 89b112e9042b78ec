// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Sahara boot-ROM handshake + loader upload (C7), and the 8-byte Sahara
//! frame codec (part of C2). See spec §4.2 and §4.7.

use crate::error::{FlashError, FramingError, ProtocolError, Result};
use crate::transport::{Transport, read_exact_cancellable, write_all_cancellable};
use crate::types::CancellationToken;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::time::Duration;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_PACKET: u32 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCmd {
    Hello = 0x01,
    HelloResponse = 0x02,
    ReadData32 = 0x03,
    EndImageTransfer = 0x04,
    Done = 0x05,
    DoneResponse = 0x06,
    Reset = 0x07,
    ResetResponse = 0x08,
    CommandReady = 0x0B,
    SwitchMode = 0x0C,
    Execute = 0x0D,
    ExecuteResponse = 0x0E,
    ExecuteData = 0x0F,
    ReadData64 = 0x12,
    ResetStateMachine = 0x13,
}

impl SaharaCmd {
    fn from_u32(v: u32) -> Option<Self> {
        use SaharaCmd::*;
        Some(match v {
            0x01 => Hello,
            0x02 => HelloResponse,
            0x03 => ReadData32,
            0x04 => EndImageTransfer,
            0x05 => Done,
            0x06 => DoneResponse,
            0x07 => Reset,
            0x08 => ResetResponse,
            0x0B => CommandReady,
            0x0C => SwitchMode,
            0x0D => Execute,
            0x0E => ExecuteResponse,
            0x0F => ExecuteData,
            0x12 => ReadData64,
            0x13 => ResetStateMachine,
            _ => return None,
        })
    }
}

/// A decoded Sahara frame: {command, payload}. The 8-byte header
/// {command: u32-LE, length: u32-LE} is stripped; `length` always equals
/// `8 + payload.len()` on the wire (§4.2).
pub struct SaharaFrame {
    pub command: u32,
    pub payload: Vec<u8>,
}

/// Reads one Sahara frame off `t`: an 8-byte header followed by
/// `length - 8` payload bytes. No byte-stuffing, no checksum.
pub fn read_frame(
    t: &mut dyn Transport,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<SaharaFrame> {
    let mut header = [0u8; 8];
    read_exact_cancellable(t, &mut header, timeout, cancel)?;
    let mut cur = &header[..];
    let command = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| FlashError::from(FramingError::BadLength { offset: 0 }))?;
    let length = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| FlashError::from(FramingError::BadLength { offset: 4 }))?;
    if length < 8 {
        return Err(FramingError::BadLength { offset: 4 }.into());
    }
    let mut payload = vec![0u8; (length - 8) as usize];
    if !payload.is_empty() {
        read_exact_cancellable(t, &mut payload, timeout, cancel)?;
    }
    Ok(SaharaFrame { command, payload })
}

pub fn write_frame(
    t: &mut dyn Transport,
    cancel: &CancellationToken,
    timeout: Duration,
    command: SaharaCmd,
    payload: &[u8],
) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.write_u32::<LittleEndian>(command as u32).unwrap();
    buf.write_u32::<LittleEndian>((8 + payload.len()) as u32).unwrap();
    buf.extend_from_slice(payload);
    write_all_cancellable(t, &buf, timeout, cancel)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaMode {
    /// IMAGE-XFER: host streams a loader file in response to ReadData[64].
    WaitingForImage,
    /// COMMAND: host issues Execute for a handful of device-info commands.
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    /// aka MSM-ID
    ReadHwId = 0x02,
    ReadOemKeyHash = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaharaState {
    Init,
    Negotiated,
    Loading,
    Done,
    Fault,
    Command,
}

/// One Sahara session (§3 "Sahara session"): protocol version, max packet,
/// current stage.
pub struct SaharaEngine {
    pub version: u32,
    pub max_packet: u32,
    state: SaharaState,
    pub verbose: bool,
}

impl Default for SaharaEngine {
    fn default() -> Self {
        SaharaEngine {
            version: 3,
            max_packet: DEFAULT_MAX_PACKET,
            state: SaharaState::Init,
            verbose: false,
        }
    }
}

impl SaharaEngine {
    pub fn new(verbose: bool) -> Self {
        SaharaEngine { verbose, ..Default::default() }
    }

    fn negotiate_hello(&mut self, hello_payload: &[u8]) -> Result<()> {
        // Hello payload layout (post 8-byte header): version, compatible,
        // cmd_packet_length/max-packet, mode, 6 reserved u32s.
        if hello_payload.len() < 8 {
            return Err(FramingError::BadLength { offset: 8 }.into());
        }
        let version = u32::from_le_bytes(hello_payload[0..4].try_into().unwrap());
        if version < 1 {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }
        // Versions beyond what we speak are tolerated: we advertise compat=2.
        self.version = version.min(3);
        self.state = SaharaState::Negotiated;
        Ok(())
    }

    fn hello_response_payload(&self, mode: SaharaMode) -> Vec<u8> {
        let mut buf = Vec::with_capacity(0x30);
        let mode_val: u32 = match mode {
            SaharaMode::WaitingForImage => 0x00,
            SaharaMode::Command => 0x03,
        };
        buf.write_u32::<LittleEndian>(self.version).unwrap();
        buf.write_u32::<LittleEndian>(if self.version > 2 { 2 } else { self.version }).unwrap();
        buf.write_u32::<LittleEndian>(self.max_packet).unwrap();
        buf.write_u32::<LittleEndian>(mode_val).unwrap();
        for _ in 0..6 {
            buf.write_u32::<LittleEndian>(0).unwrap();
        }
        buf
    }

    /// Sends a `HelloResponse` without first waiting for the device's
    /// `Hello` — used when another process already drained it (§4.7, the
    /// `--skip-hello-wait` escape hatch).
    pub fn send_hello_response(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        mode: SaharaMode,
    ) -> Result<()> {
        let payload = self.hello_response_payload(mode);
        write_frame(t, cancel, FRAME_TIMEOUT, SaharaCmd::HelloResponse, &payload)
    }

    /// Drives one full Sahara transaction: either COMMAND-mode device-info
    /// read (`cmd` set) or IMAGE-XFER loader upload (`files` non-empty).
    /// Mirrors the teacher's `sahara_run(dev, mode, cmd, buf, files, verbose)`.
    pub fn run(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        mode: SaharaMode,
        cmd: Option<SaharaCmdModeCmd>,
        files: &mut [Vec<u8>],
    ) -> Result<Vec<u8>> {
        // Input buffer must not be flushed ahead of Hello: late BootROM
        // hello bytes are valid (§4.7 buffer policy). We simply never issue
        // a read that discards unread bytes before this point.
        let hello = read_frame(t, cancel, HELLO_TIMEOUT)?;
        if hello.command != SaharaCmd::Hello as u32 {
            return Err(FramingError::UnexpectedCommand(hello.command).into());
        }
        self.negotiate_hello(&hello.payload)?;
        self.send_hello_response(t, cancel, mode)?;

        match mode {
            SaharaMode::Command => self.run_command_mode(t, cancel, cmd),
            SaharaMode::WaitingForImage => {
                self.run_image_transfer(t, cancel, files)?;
                Ok(Vec::new())
            }
        }
    }

    fn run_command_mode(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        cmd: Option<SaharaCmdModeCmd>,
    ) -> Result<Vec<u8>> {
        let ready = read_frame(t, cancel, FRAME_TIMEOUT)?;
        if ready.command != SaharaCmd::CommandReady as u32 {
            return Err(FramingError::UnexpectedCommand(ready.command).into());
        }
        self.state = SaharaState::Command;

        let cmd = cmd.ok_or(ProtocolError::StageMismatch)?;
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(cmd as u32).unwrap();
        write_frame(t, cancel, FRAME_TIMEOUT, SaharaCmd::Execute, &payload)?;

        let resp = read_frame(t, cancel, FRAME_TIMEOUT)?;
        if resp.command != SaharaCmd::ExecuteResponse as u32 || resp.payload.len() < 8 {
            self.state = SaharaState::Fault;
            return Err(FramingError::UnexpectedCommand(resp.command).into());
        }
        let data_len = u32::from_le_bytes(resp.payload[4..8].try_into().unwrap());

        let mut req = Vec::new();
        req.write_u32::<LittleEndian>(cmd as u32).unwrap();
        write_frame(t, cancel, FRAME_TIMEOUT, SaharaCmd::ExecuteData, &req)?;

        let mut data = vec![0u8; data_len as usize];
        if !data.is_empty() {
            read_exact_cancellable(t, &mut data, FRAME_TIMEOUT, cancel)?;
        }
        Ok(data)
    }

    fn run_image_transfer(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        files: &mut [Vec<u8>],
    ) -> Result<()> {
        self.state = SaharaState::Loading;
        loop {
            let frame = read_frame(t, cancel, FRAME_TIMEOUT)?;
            let Some(kind) = SaharaCmd::from_u32(frame.command) else {
                self.state = SaharaState::Fault;
                return Err(FramingError::UnexpectedCommand(frame.command).into());
            };
            match kind {
                SaharaCmd::ReadData32 | SaharaCmd::ReadData64 => {
                    self.serve_read_data(t, cancel, &frame.payload, kind == SaharaCmd::ReadData64, files)?;
                }
                SaharaCmd::EndImageTransfer => {
                    let status = if frame.payload.len() >= 8 {
                        u32::from_le_bytes(frame.payload[4..8].try_into().unwrap())
                    } else {
                        0
                    };
                    if status == 0 {
                        self.state = SaharaState::Done;
                        return Ok(());
                    } else {
                        self.state = SaharaState::Fault;
                        return Err(ProtocolError::Nak { detail: format!("EndImageTransfer status={status}") }.into());
                    }
                }
                _ => {
                    self.state = SaharaState::Fault;
                    return Err(FramingError::UnexpectedCommand(frame.command).into());
                }
            }
        }
    }

    fn serve_read_data(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        payload: &[u8],
        wide: bool,
        files: &mut [Vec<u8>],
    ) -> Result<()> {
        let (image_id, offset, length) = if wide {
            if payload.len() < 24 {
                return Err(FramingError::BadLength { offset: 0 }.into());
            }
            (
                u64::from_le_bytes(payload[0..8].try_into().unwrap()),
                u64::from_le_bytes(payload[8..16].try_into().unwrap()),
                u64::from_le_bytes(payload[16..24].try_into().unwrap()),
            )
        } else {
            if payload.len() < 12 {
                return Err(FramingError::BadLength { offset: 0 }.into());
            }
            (
                u32::from_le_bytes(payload[0..4].try_into().unwrap()) as u64,
                u32::from_le_bytes(payload[4..8].try_into().unwrap()) as u64,
                u32::from_le_bytes(payload[8..12].try_into().unwrap()) as u64,
            )
        };
        let file = files
            .get(image_id as usize)
            .ok_or(crate::error::ResourceError::MissingLoader(format!("image id {image_id}")))?;
        let mut chunk = vec![0u8; length as usize];
        let start = offset as usize;
        let end = (start + length as usize).min(file.len());
        if start < file.len() {
            let n = end - start;
            chunk[..n].copy_from_slice(&file[start..end]);
        }
        if self.verbose {
            tracing::debug!(image_id, offset, length, "sahara ReadData");
        }
        write_all_cancellable(t, &chunk, FRAME_TIMEOUT, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn hello_frame(version: u32, mode: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(version).unwrap();
        payload.write_u32::<LittleEndian>(2).unwrap();
        payload.write_u32::<LittleEndian>(0xFFFF).unwrap();
        payload.write_u32::<LittleEndian>(mode).unwrap();
        for _ in 0..6 {
            payload.write_u32::<LittleEndian>(0).unwrap();
        }
        let mut frame = Vec::new();
        frame.write_u32::<LittleEndian>(SaharaCmd::Hello as u32).unwrap();
        frame.write_u32::<LittleEndian>((8 + payload.len()) as u32).unwrap();
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn accepts_version_above_three_with_compat_two() {
        let mut engine = SaharaEngine::new(false);
        let mut t = MemoryTransport::new(hello_frame(5, 0));
        let cancel = CancellationToken::new();
        let frame = read_frame(&mut t, &cancel, Duration::from_secs(1)).unwrap();
        engine.negotiate_hello(&frame.payload).unwrap();
        let resp = engine.hello_response_payload(SaharaMode::Command);
        assert_eq!(u32::from_le_bytes(resp[4..8].try_into().unwrap()), 2);
    }

    #[test]
    fn rejects_version_zero() {
        let mut engine = SaharaEngine::new(false);
        let mut t = MemoryTransport::new(hello_frame(0, 0));
        let cancel = CancellationToken::new();
        let frame = read_frame(&mut t, &cancel, Duration::from_secs(1)).unwrap();
        let err = engine.negotiate_hello(&frame.payload);
        assert!(matches!(
            err,
            Err(FlashError::Protocol(ProtocolError::UnsupportedVersion(0)))
        ));
    }
}
