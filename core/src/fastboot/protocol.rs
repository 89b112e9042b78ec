// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Fastboot command/response engine (C11): 64-byte ASCII commands, OKAY/
//! FAIL/INFO/DATA replies, sparse-aware download/flash streaming. See
//! spec §4.2, §4.11.

use crate::error::{FramingError, ProtocolError, Result};
use crate::sparse::SparseReader;
use crate::transport::Transport;
use crate::types::{CancellationToken, EventSink, FlashEvent};
use std::io::Read;
use std::time::Duration;

const MAX_COMMAND_LEN: usize = 64;
const MAX_REPLY_LEN: usize = 256;
const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Okay(String),
    Data(usize),
    Fail(String),
    Info(String),
}

impl Reply {
    fn parse(raw: &[u8]) -> Result<Reply> {
        if raw.len() < 4 {
            return Err(FramingError::BadLength { offset: 0 }.into());
        }
        let (kind, data) = raw.split_at(4);
        let s = String::from_utf8_lossy(data).trim_matches('\0').to_string();
        Ok(match kind {
            b"OKAY" => Reply::Okay(s),
            b"INFO" => Reply::Info(s),
            b"FAIL" => Reply::Fail(s),
            b"DATA" => {
                let size = usize::from_str_radix(&s, 16)
                    .map_err(|_| FramingError::BadLength { offset: 4 })?;
                Reply::Data(size)
            }
            _ => return Err(FramingError::UnexpectedCommand(u32::from_be_bytes(kind.try_into().unwrap())).into()),
        })
    }
}

/// Fastboot session fields (§3 "Fastboot session").
pub struct FastbootEngine {
    pub device_serial: String,
    pub slot_count: u8,
    pub current_slot: String,
    pub unlocked: bool,
    pub max_download_size: usize,
}

impl FastbootEngine {
    pub fn new(device_serial: String) -> Self {
        FastbootEngine {
            device_serial,
            slot_count: 0,
            current_slot: String::new(),
            unlocked: false,
            max_download_size: 512 * 1024 * 1024,
        }
    }

    /// Sends one command and blocks until a terminal reply. `INFO` replies
    /// do not terminate the wait (§8 property 8); timeouts retry, any other
    /// I/O error is fatal.
    fn send(&self, t: &mut dyn Transport, cancel: &CancellationToken, payload: &[u8]) -> Result<Reply> {
        if payload.len() > MAX_COMMAND_LEN {
            return Err(FramingError::BadLength { offset: 0 }.into());
        }
        crate::transport::write_all_cancellable(t, payload, ROUND_TIMEOUT, cancel)?;
        loop {
            if cancel.is_cancelled() {
                return Err(crate::error::LogicalError::Cancelled.into());
            }
            let mut buf = [0u8; MAX_REPLY_LEN];
            match t.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    let reply = Reply::parse(&buf[..n])?;
                    if let Reply::Info(ref msg) = reply {
                        tracing::debug!(info = %msg, "fastboot INFO");
                        continue;
                    }
                    return Ok(reply);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(crate::error::TransportError::IoFault(e).into()),
            }
        }
    }

    fn expect_okay(reply: Reply) -> Result<String> {
        match reply {
            Reply::Okay(v) => Ok(v),
            Reply::Fail(msg) => Err(ProtocolError::Nak { detail: msg }.into()),
            other => Err(ProtocolError::Nak { detail: format!("unexpected reply {other:?}") }.into()),
        }
    }

    pub fn getvar(&self, t: &mut dyn Transport, cancel: &CancellationToken, name: &str) -> Result<String> {
        let reply = self.send(t, cancel, format!("getvar:{name}").as_bytes())?;
        Self::expect_okay(reply)
    }

    /// `download N` followed by exactly N bytes; the device replies `DATA N`
    /// first, then the terminal `OKAY`/`FAIL` once the payload lands.
    pub fn download(&self, t: &mut dyn Transport, cancel: &CancellationToken, data: &[u8]) -> Result<()> {
        let reply = self.send(t, cancel, format!("download:{:08x}", data.len()).as_bytes())?;
        match reply {
            Reply::Data(n) if n == data.len() => {}
            Reply::Fail(msg) => return Err(ProtocolError::Nak { detail: msg }.into()),
            other => return Err(ProtocolError::Nak { detail: format!("unexpected reply {other:?}") }.into()),
        }
        crate::transport::write_all_cancellable(t, data, ROUND_TIMEOUT, cancel)?;
        let reply = self.read_terminal(t, cancel)?;
        Self::expect_okay(reply).map(|_| ())
    }

    fn read_terminal(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<Reply> {
        loop {
            if cancel.is_cancelled() {
                return Err(crate::error::LogicalError::Cancelled.into());
            }
            let mut buf = [0u8; MAX_REPLY_LEN];
            match t.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    let reply = Reply::parse(&buf[..n])?;
                    if matches!(reply, Reply::Info(_)) {
                        continue;
                    }
                    return Ok(reply);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(crate::error::TransportError::IoFault(e).into()),
            }
        }
    }

    pub fn flash_downloaded(&self, t: &mut dyn Transport, cancel: &CancellationToken, partition: &str) -> Result<()> {
        let reply = self.send(t, cancel, format!("flash:{partition}").as_bytes())?;
        Self::expect_okay(reply).map(|_| ())
    }

    /// Streams `source` into `partition` in ≤ `max_download_size` rounds,
    /// re-running `download`/`flash` for each segment (§4.11's sparse-aware
    /// streaming form; S4).
    pub fn flash_streaming(
        &self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        partition: &str,
        source: &mut dyn Read,
        total_len: u64,
        events: Option<&EventSink>,
    ) -> Result<()> {
        let mut done = 0u64;
        let mut buf = vec![0u8; self.max_download_size];
        loop {
            if cancel.is_cancelled() {
                return Err(crate::error::LogicalError::Cancelled.into());
            }
            let n = read_fill(source, &mut buf)?;
            if n == 0 {
                break;
            }
            self.download(t, cancel, &buf[..n])?;
            self.flash_downloaded(t, cancel, partition)?;
            done += n as u64;
            if let Some(ev) = events {
                ev.emit(FlashEvent::ProgressChanged { done, total: total_len });
            }
        }
        Ok(())
    }

    /// Same as `flash_streaming` but decodes an Android sparse image on the
    /// fly, preserving DONT_CARE holes instead of materialising zeros.
    pub fn flash_sparse(
        &self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        partition: &str,
        sparse: &mut SparseReader<impl Read + std::io::Seek>,
        events: Option<&EventSink>,
    ) -> Result<()> {
        let total = sparse.total_size();
        self.flash_streaming(t, cancel, partition, sparse, total, events)
    }

    pub fn erase(&self, t: &mut dyn Transport, cancel: &CancellationToken, partition: &str) -> Result<()> {
        let reply = self.send(t, cancel, format!("erase:{partition}").as_bytes())?;
        Self::expect_okay(reply).map(|_| ())
    }

    pub fn format(&self, t: &mut dyn Transport, cancel: &CancellationToken, partition: &str) -> Result<()> {
        let reply = self.send(t, cancel, format!("format:{partition}").as_bytes())?;
        Self::expect_okay(reply).map(|_| ())
    }

    pub fn set_active(&mut self, t: &mut dyn Transport, cancel: &CancellationToken, slot: &str) -> Result<()> {
        let reply = self.send(t, cancel, format!("set_active:{slot}").as_bytes())?;
        Self::expect_okay(reply)?;
        self.current_slot = slot.to_string();
        Ok(())
    }

    pub fn oem(&self, t: &mut dyn Transport, cancel: &CancellationToken, args: &str) -> Result<String> {
        let reply = self.send(t, cancel, format!("oem {args}").as_bytes())?;
        Self::expect_okay(reply)
    }

    pub fn flashing_unlock(&mut self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.expect_okay(self.send(t, cancel, b"flashing unlock")?)?;
        self.unlocked = true;
        Ok(())
    }

    pub fn flashing_lock(&mut self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.expect_okay(self.send(t, cancel, b"flashing lock")?)?;
        self.unlocked = false;
        Ok(())
    }

    pub fn reboot(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.send(t, cancel, b"reboot").map(|_| ())
    }

    pub fn reboot_bootloader(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.send(t, cancel, b"reboot-bootloader").map(|_| ())
    }

    pub fn reboot_fastboot(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.send(t, cancel, b"reboot-fastboot").map(|_| ())
    }

    pub fn reboot_recovery(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.send(t, cancel, b"reboot-recovery").map(|_| ())
    }
}

fn read_fill(r: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).map_err(crate::error::TransportError::IoFault)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_reply_does_not_parse_as_terminal() {
        let mut buf = *b"INFOsome-status-msg_____________________________";
        let reply = Reply::parse(&mut buf).unwrap();
        assert!(matches!(reply, Reply::Info(_)));
    }

    #[test]
    fn data_reply_parses_hex_length() {
        let reply = Reply::parse(b"DATA00001000").unwrap();
        assert_eq!(reply, Reply::Data(0x1000));
    }

    #[test]
    fn fail_reply_carries_message() {
        let reply = Reply::parse(b"FAILbad partition").unwrap();
        assert_eq!(reply, Reply::Fail("bad partition".to_string()));
    }
}
