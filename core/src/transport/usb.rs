// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use crate::error::{FlashError, Result, ResourceError, TransportError};
use nusb::{
    self, Device, DeviceInfo, MaybeFuture,
    io::{EndpointRead, EndpointWrite},
};
use std::io::{Read, Write};
use std::time::Duration;

use super::{Transport, TransportState};

/// Bulk in/out endpoint pair matched by vendor/product id and interface
/// class triple, generalized from the teacher's Qualcomm-only EDL matcher
/// so it also serves Fastboot's vid 0x18D1 / class 0xFF interface (§4.11).
pub struct UsbMatch {
    pub vendor_id: u16,
    pub product_ids: &'static [u16],
    pub class: u8,
    pub subclass: u8,
    pub protocols: &'static [u8],
}

pub const QCOM_EDL: UsbMatch = UsbMatch {
    vendor_id: 0x05c6,
    product_ids: &[0x9008 /* EDL */, 0x900e /* Ramdump */],
    class: 0xFF,
    subclass: 0xFF,
    protocols: &[0x10, 0x11, 0xFF],
};

pub const ANDROID_FASTBOOT: UsbMatch = UsbMatch {
    vendor_id: 0x18d1,
    product_ids: &[0xd00d, 0x4ee0, 0x0d02],
    class: 0xff,
    subclass: 0x42,
    protocols: &[0x03],
};

pub struct UsbTransport {
    id: String,
    _dev: Device,
    reader: EndpointRead<nusb::transfer::Bulk>,
    writer: EndpointWrite<nusb::transfer::Bulk>,
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
    state: TransportState,
}

impl Write for UsbTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.writer.write(buf);
        self.writer.submit_end();
        n
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Read for UsbTransport {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos < self.cap {
            let n = std::cmp::min(out.len(), self.cap - self.pos);
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.reader.read(out)
    }
}

impl Transport for UsbTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn close(&mut self) -> Result<()> {
        self.state = TransportState::Closed;
        Ok(())
    }
}

fn find_by_serial(
    devices: &mut dyn Iterator<Item = DeviceInfo>,
    serial_no: &str,
) -> Result<Device> {
    for d in devices {
        let matches = d
            .serial_number()
            .map(|sn| sn.eq_ignore_ascii_case(serial_no))
            .unwrap_or(false)
            || d.product_string()
                .and_then(|p| p.find("_SN:").map(|i| &p[i + 4..]))
                .map(|sn| sn.eq_ignore_ascii_case(serial_no))
                .unwrap_or(false);
        if matches {
            return d
                .open()
                .wait()
                .map_err(|e| FlashError::Transport(TransportError::IoFault(e)));
        }
    }
    Err(FlashError::Resource(ResourceError::MissingLoader(format!(
        "found no USB device with serial {serial_no}"
    ))))
}

/// Opens a bulk in/out endpoint pair on the first (or serial-matched) device
/// matching `spec`. Shared by the Qualcomm EDL and Fastboot backends; only
/// the matcher differs (§4.11's vendor 0x18D1/class 0xFF/subclass 0x42 vs
/// §4.7's Qualcomm 0x05c6 EDL descriptor).
pub fn open(spec: &UsbMatch, serial_no: Option<String>) -> Result<UsbTransport> {
    let mut devices = nusb::list_devices().wait().map_err(|e| {
        FlashError::Transport(TransportError::IoFault(e))
    })?;
    let mut devices = devices
        .by_ref()
        .filter(|d| d.vendor_id() == spec.vendor_id && spec.product_ids.contains(&d.product_id()));

    let dev = match serial_no.as_deref() {
        Some(s) => find_by_serial(&mut devices, s)?,
        None => {
            let d = devices.next().ok_or_else(|| {
                FlashError::Resource(ResourceError::MissingLoader(
                    "found no matching USB device".into(),
                ))
            })?;
            d.open().wait().map_err(|e| {
                FlashError::Transport(TransportError::IoFault(e))
            })?
        }
    };

    let cfg_desc = dev
        .active_configuration()
        .map_err(|e| FlashError::Transport(TransportError::IoFault(e)))?;
    let intf_desc = cfg_desc
        .interface_alt_settings()
        .find(|d| {
            d.class() == spec.class
                && d.subclass() == spec.subclass
                && spec.protocols.contains(&d.protocol())
                && d.num_endpoints() >= 2
        })
        .ok_or_else(|| {
            FlashError::Resource(ResourceError::MissingLoader(
                "no matching USB interface".into(),
            ))
        })?;

    let in_ep = intf_desc
        .endpoints()
        .find(|e| {
            e.direction() == nusb::transfer::Direction::In
                && e.transfer_type() == nusb::descriptors::TransferType::Bulk
        })
        .ok_or_else(|| FlashError::Resource(ResourceError::MissingLoader("no bulk IN endpoint".into())))?
        .address();
    let out_ep = intf_desc
        .endpoints()
        .find(|e| {
            e.direction() == nusb::transfer::Direction::Out
                && e.transfer_type() == nusb::descriptors::TransferType::Bulk
        })
        .ok_or_else(|| FlashError::Resource(ResourceError::MissingLoader("no bulk OUT endpoint".into())))?
        .address();

    let serial = serial_no.unwrap_or_else(|| "usb".to_string());

    let intf = dev
        .detach_and_claim_interface(intf_desc.interface_number())
        .wait()
        .map_err(|e| FlashError::Transport(TransportError::IoFault(e)))?;

    let mut rd = intf.endpoint(in_ep)
        .map_err(|e| FlashError::Transport(TransportError::IoFault(e)))?
        .reader(1024 * 1024);
    let mut wr = intf.endpoint(out_ep)
        .map_err(|e| FlashError::Transport(TransportError::IoFault(e)))?
        .writer(1024 * 1024);

    rd.set_read_timeout(Duration::from_secs(10));
    wr.set_write_timeout(Duration::from_secs(10));

    Ok(UsbTransport {
        id: serial,
        _dev: dev,
        reader: rd,
        writer: wr,
        buf: Vec::new(),
        pos: 0,
        cap: 0,
        state: TransportState::Open,
    })
}
