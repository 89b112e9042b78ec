// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use crate::error::{FlashError, Result, TransportError};
use serial2::SerialPort;
use std::io::{Read, Write};

use super::{Transport, TransportState};

pub struct SerialTransport {
    id: String,
    port: SerialPort,
    state: TransportState,
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Transport for SerialTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn set_baud(&mut self, rate: u32) -> Result<()> {
        self.port.set_baud_rate(rate).map_err(TransportError::IoFault)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state = TransportState::Closed;
        Ok(())
    }
}

/// Opens a serial/USB-CDC endpoint at the default handshake baud (115200),
/// matching the teacher's `qdl::serial::setup_serial_device`.
pub fn open(dev_path: Option<String>) -> Result<SerialTransport> {
    let dev_path = dev_path.ok_or_else(|| {
        FlashError::Resource(crate::error::ResourceError::MissingLoader(
            "serial port path unspecified".into(),
        ))
    })?;

    let port = SerialPort::open(&dev_path, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(115200)?;
        Ok(settings)
    })
    .map_err(TransportError::IoFault)?;

    Ok(SerialTransport {
        id: dev_path,
        port,
        state: TransportState::Open,
    })
}
