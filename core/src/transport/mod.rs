// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Byte-level duplex transport (C1). Knows nothing about framing or
//! payload semantics; see spec §4.1.

#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

use crate::error::{Result, TransportError};
use crate::types::CancellationToken;
use std::time::{Duration, Instant};

/// How often a blocking transport call re-checks cancellation, per §4.1.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closed,
    Faulted,
}

/// A single exclusively-owned duplex byte channel. Implementations must
/// honour at most one outstanding `send` and one outstanding `receive` at a
/// time (§4.1): callers serialize access through a `&mut` borrow.
pub trait Transport: std::io::Read + std::io::Write + Send {
    fn id(&self) -> &str;
    fn state(&self) -> TransportState;
    fn set_baud(&mut self, _rate: u32) -> Result<()> {
        Ok(())
    }
    fn close(&mut self) -> Result<()>;
}

/// Reads exactly `buf.len()` bytes, polling `cancel` at `CANCEL_POLL_INTERVAL`
/// and failing with `LogicalError::Cancelled` if it fires, or
/// `TransportError::Timeout` if `deadline` elapses first. The transport stays
/// `Open` on timeout; only an I/O fault moves it to `Faulted` (§4.1).
pub fn read_exact_cancellable(
    t: &mut dyn Transport,
    buf: &mut [u8],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    while filled < buf.len() {
        if cancel.is_cancelled() {
            return Err(crate::error::LogicalError::Cancelled.into());
        }
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout(buf.len() - filled).into());
        }
        match t.read(&mut buf[filled..]) {
            Ok(0) => continue,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(CANCEL_POLL_INTERVAL.min(timeout));
                continue;
            }
            Err(e) => return Err(TransportError::IoFault(e).into()),
        }
    }
    Ok(())
}

pub fn write_all_cancellable(
    t: &mut dyn Transport,
    buf: &[u8],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut sent = 0;
    while sent < buf.len() {
        if cancel.is_cancelled() {
            return Err(crate::error::LogicalError::Cancelled.into());
        }
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout(buf.len() - sent).into());
        }
        match t.write(&buf[sent..]) {
            Ok(0) => continue,
            Ok(n) => sent += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(TransportError::IoFault(e).into()),
        }
    }
    t.flush().map_err(TransportError::IoFault)?;
    Ok(())
}

/// A fixed in-memory transport used by unit tests throughout the crate: a
/// preloaded "device reply" buffer to read from, and a `Vec<u8>` capturing
/// everything the engine writes.
#[cfg(test)]
pub struct MemoryTransport {
    pub inbound: std::io::Cursor<Vec<u8>>,
    pub outbound: Vec<u8>,
    pub state: TransportState,
}

#[cfg(test)]
impl MemoryTransport {
    pub fn new(inbound: Vec<u8>) -> Self {
        MemoryTransport {
            inbound: std::io::Cursor::new(inbound),
            outbound: Vec::new(),
            state: TransportState::Open,
        }
    }
}

#[cfg(test)]
impl std::io::Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut self.inbound, buf)
    }
}

#[cfg(test)]
impl std::io::Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        "memory"
    }
    fn state(&self) -> TransportState {
        self.state
    }
    fn close(&mut self) -> Result<()> {
        self.state = TransportState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_exact_cancellable_honours_cancellation() {
        let mut t = MemoryTransport::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut buf = [0u8; 4];
        let err = read_exact_cancellable(&mut t, &mut buf, Duration::from_secs(1), &cancel);
        assert!(matches!(
            err,
            Err(crate::error::FlashError::Logical(
                crate::error::LogicalError::Cancelled
            ))
        ));
    }

    #[test]
    fn read_exact_cancellable_times_out() {
        let mut t = MemoryTransport::new(vec![]);
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 4];
        let err = read_exact_cancellable(&mut t, &mut buf, Duration::from_millis(120), &cancel);
        assert!(matches!(
            err,
            Err(crate::error::FlashError::Transport(
                crate::error::TransportError::Timeout(4)
            ))
        ));
        assert_eq!(t.state(), TransportState::Open);
    }

    #[test]
    fn read_exact_cancellable_reads_available_bytes() {
        let mut t = MemoryTransport::new(vec![1, 2, 3, 4]);
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 4];
        read_exact_cancellable(&mut t, &mut buf, Duration::from_secs(1), &cancel).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
