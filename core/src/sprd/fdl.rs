// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! SPRD three-stage automaton (C10): BROM → FDL1 → FDL2, then partition
//! I/O, NV/IMEI/eFuse access, baud switching, and reboot. See spec §4.10.

use crate::error::{LogicalError, ProtocolError, ResourceError, Result};
use crate::sprd::bootrom::{self, DEFAULT_CHUNK_SIZE};
use crate::sprd::hdlc::{self, ChecksumMode};
use crate::transport::{Transport, read_exact_cancellable, write_all_cancellable};
use crate::types::{CancellationToken, EventSink, FlashEvent, Partition};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Read, Write};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprdStage {
    Disconnected,
    Brom,
    Fdl1,
    Fdl2,
}

/// Caller overrides for FDL1/FDL2 image + load address. Priority is
/// user > PAC-XML > PAC-embedded > chip-database default (§4.10).
#[derive(Debug, Clone, Default)]
pub struct FdlOverride {
    pub path: Option<Vec<u8>>,
    pub address: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChipDefaults {
    pub chip_id: u32,
    pub fdl1_address: u32,
    pub fdl2_address: u32,
    pub checksum_mode: ChecksumMode,
}

const MAX_PARTITION_NAME_LEN: usize = 32;
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// One SPRD session (§3 "SPRD session").
pub struct SprdEngine {
    pub chip_id: u32,
    pub stage: SprdStage,
    pub baud: u32,
    pub mode: ChecksumMode,
    pub partitions: Vec<Partition>,
}

impl SprdEngine {
    pub fn new(defaults: &ChipDefaults) -> Self {
        SprdEngine {
            chip_id: defaults.chip_id,
            stage: SprdStage::Disconnected,
            baud: 115_200,
            mode: defaults.checksum_mode,
            partitions: Vec::new(),
        }
    }

    fn resolve_fdl1(&self, defaults: &ChipDefaults, pac_xml_addr: Option<u32>, user: &FdlOverride, pac_embedded: &[u8]) -> (Vec<u8>, u32) {
        let addr = user.address.or(pac_xml_addr).unwrap_or(defaults.fdl1_address);
        let image = user.path.clone().unwrap_or_else(|| pac_embedded.to_vec());
        (image, addr)
    }

    /// BROM → FDL1: probe, confirm version, upload FDL1, execute.
    pub fn connect_and_load_fdl1(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        defaults: &ChipDefaults,
        pac_xml_addr: Option<u32>,
        user_override: &FdlOverride,
        pac_embedded_fdl1: &[u8],
        events: Option<&EventSink>,
    ) -> Result<()> {
        bootrom::probe(t, cancel)?;
        self.stage = SprdStage::Brom;
        bootrom::read_version(t, cancel)?;
        if let Some(ev) = events {
            ev.emit(FlashEvent::StageChanged("brom".into()));
        }

        let (image, address) = self.resolve_fdl1(defaults, pac_xml_addr, user_override, pac_embedded_fdl1);
        if image.is_empty() {
            return Err(ResourceError::MissingLoader("FDL1 image not supplied".into()).into());
        }
        bootrom::upload_and_exec(t, cancel, &image, address, DEFAULT_CHUNK_SIZE, self.mode)?;
        self.stage = SprdStage::Fdl1;
        if let Some(ev) = events {
            ev.emit(FlashEvent::StageChanged("fdl1".into()));
        }
        Ok(())
    }

    /// FDL1 → FDL2: optional baud switch, upload FDL2, execute, read
    /// partition table (§4.10, S3).
    pub fn load_fdl2(
        &mut self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        defaults: &ChipDefaults,
        pac_xml_addr: Option<u32>,
        user_override: &FdlOverride,
        pac_embedded_fdl2: &[u8],
        new_baud: Option<u32>,
        events: Option<&EventSink>,
    ) -> Result<()> {
        if self.stage != SprdStage::Fdl1 {
            return Err(ProtocolError::StageMismatch.into());
        }
        if let Some(baud) = new_baud {
            self.set_baud(t, cancel, baud)?;
        }

        let addr = user_override.address.or(pac_xml_addr).unwrap_or(defaults.fdl2_address);
        let image = user_override.path.clone().unwrap_or_else(|| pac_embedded_fdl2.to_vec());
        if image.is_empty() {
            return Err(ResourceError::MissingLoader("FDL2 image not supplied".into()).into());
        }
        bootrom::upload_and_exec(t, cancel, &image, addr, DEFAULT_CHUNK_SIZE, self.mode)?;
        self.stage = SprdStage::Fdl2;
        if let Some(ev) = events {
            ev.emit(FlashEvent::StageChanged("fdl2".into()));
        }

        self.partitions = self.read_partition_table(t, cancel)?;
        if let Some(ev) = events {
            ev.emit(FlashEvent::PartitionTableLoaded(self.partitions.len()));
        }
        Ok(())
    }

    fn require_fdl2(&self) -> Result<()> {
        if self.stage == SprdStage::Fdl2 {
            Ok(())
        } else {
            Err(ProtocolError::StageMismatch.into())
        }
    }

    fn check_name(name: &str) -> Result<()> {
        if name.len() > MAX_PARTITION_NAME_LEN {
            Err(ResourceError::PartitionNotFound(format!("{name}: PartitionNameTooLong")).into())
        } else {
            Ok(())
        }
    }

    const CMD_SET_BAUD: u16 = 0x0101;
    const CMD_READ_CHIP_TYPE: u16 = 0x0102;
    const CMD_READ_FLASH_INFO: u16 = 0x0103;
    const CMD_READ_PARTITION: u16 = 0x0104;
    const CMD_WRITE_PARTITION: u16 = 0x0105;
    const CMD_ERASE_PARTITION: u16 = 0x0106;
    const CMD_READ_NV: u16 = 0x0107;
    const CMD_WRITE_NV: u16 = 0x0108;
    const CMD_READ_EFUSE: u16 = 0x0109;
    const CMD_REBOOT: u16 = 0x010A;
    const CMD_POWER_OFF: u16 = 0x010B;
    const CMD_REPARTITION: u16 = 0x010C;
    const CMD_READ_PARTITION_TABLE: u16 = 0x010D;

    fn roundtrip(
        &self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        command: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let frame = hdlc::frame(payload, command, self.mode);
        write_all_cancellable(t, &frame, FRAME_TIMEOUT, cancel)?;
        let mut raw = vec![0x7Eu8];
        let mut byte = [0u8; 1];
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
        let (resp, _) = hdlc::unframe(&raw)?;
        Ok(resp)
    }

    pub fn set_baud(&mut self, t: &mut dyn Transport, cancel: &CancellationToken, baud: u32) -> Result<()> {
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(baud).unwrap();
        self.roundtrip(t, cancel, Self::CMD_SET_BAUD, &payload)?;
        t.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    pub fn read_chip_type(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<u32> {
        let resp = self.roundtrip(t, cancel, Self::CMD_READ_CHIP_TYPE, &[])?;
        if resp.len() < 4 {
            return Err(ProtocolError::Nak { detail: "short chip-type reply".into() }.into());
        }
        Ok(u32::from_be_bytes(resp[0..4].try_into().unwrap()))
    }

    pub fn read_partition_table(&self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<Vec<Partition>> {
        self.require_fdl2()?;
        let resp = self.roundtrip(t, cancel, Self::CMD_READ_PARTITION_TABLE, &[])?;
        let mut out = Vec::new();
        // Each entry: 32-byte ASCII name, u64-BE size-in-bytes.
        for (i, chunk) in resp.chunks_exact(40).enumerate() {
            let name = String::from_utf8_lossy(&chunk[..32]).trim_end_matches('\0').to_string();
            if name.is_empty() {
                continue;
            }
            let size = u64::from_be_bytes(chunk[32..40].try_into().unwrap());
            out.push(Partition {
                lun: 0,
                name,
                start_sector: 0,
                num_sectors: size,
                sector_size: 1,
                type_guid: [0; 16],
                unique_guid: [0; 16],
                attributes: 0,
                entry_index: i as i32,
            });
        }
        Ok(out)
    }

    pub fn read_partition(
        &self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        name: &str,
        size: u64,
        sink: &mut dyn Write,
        events: Option<&EventSink>,
    ) -> Result<()> {
        self.require_fdl2()?;
        Self::check_name(name)?;
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.resize(32, 0);
        payload.write_u64::<BigEndian>(size).unwrap();
        write_all_cancellable(t, &hdlc::frame(&payload, Self::CMD_READ_PARTITION, self.mode), FRAME_TIMEOUT, cancel)?;

        let mut done = 0u64;
        while done < size {
            if cancel.is_cancelled() {
                return Err(LogicalError::Cancelled.into());
            }
            let mut raw = vec![0x7Eu8];
            let mut byte = [0u8; 1];
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
            let (chunk, _) = hdlc::unframe(&raw)?;
            sink.write_all(&chunk).map_err(crate::error::TransportError::IoFault)?;
            done += chunk.len() as u64;
            if let Some(ev) = events {
                ev.emit(FlashEvent::ProgressChanged { done, total: size });
            }
        }
        Ok(())
    }

    pub fn write_partition(
        &self,
        t: &mut dyn Transport,
        cancel: &CancellationToken,
        name: &str,
        source: &mut dyn Read,
        size: u64,
        events: Option<&EventSink>,
    ) -> Result<()> {
        self.require_fdl2()?;
        Self::check_name(name)?;
        let mut header = Vec::new();
        header.extend_from_slice(name.as_bytes());
        header.resize(32, 0);
        header.write_u64::<BigEndian>(size).unwrap();
        self.roundtrip(t, cancel, Self::CMD_WRITE_PARTITION, &header)?;

        let mut done = 0u64;
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        while done < size {
            if cancel.is_cancelled() {
                return Err(LogicalError::Cancelled.into());
            }
            let want = (size - done).min(buf.len() as u64) as usize;
            let n = source.read(&mut buf[..want]).map_err(crate::error::TransportError::IoFault)?;
            if n < want {
                buf[n..want].fill(0);
            }
            bootrom::mid_data_chunk(t, cancel, &buf[..want], self.mode)?;
            done += want as u64;
            if let Some(ev) = events {
                ev.emit(FlashEvent::ProgressChanged { done, total: size });
            }
        }
        Ok(())
    }

    pub fn erase_partition(&self, t: &mut dyn Transport, cancel: &CancellationToken, name: &str, size: u64) -> Result<()> {
        self.require_fdl2()?;
        Self::check_name(name)?;
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.resize(32, 0);
        payload.write_u64::<BigEndian>(size).unwrap();
        self.roundtrip(t, cancel, Self::CMD_ERASE_PARTITION, &payload)?;
        Ok(())
    }

    pub fn read_nv(&self, t: &mut dyn Transport, cancel: &CancellationToken, id: u32) -> Result<Vec<u8>> {
        self.require_fdl2()?;
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(id).unwrap();
        self.roundtrip(t, cancel, Self::CMD_READ_NV, &payload)
    }

    pub fn write_nv(&self, t: &mut dyn Transport, cancel: &CancellationToken, id: u32, bytes: &[u8]) -> Result<()> {
        self.require_fdl2()?;
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(id).unwrap();
        payload.extend_from_slice(bytes);
        self.roundtrip(t, cancel, Self::CMD_WRITE_NV, &payload)?;
        Ok(())
    }

    pub fn read_efuse(&self, t: &mut dyn Transport, cancel: &CancellationToken, block: u32) -> Result<Vec<u8>> {
        self.require_fdl2()?;
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(block).unwrap();
        self.roundtrip(t, cancel, Self::CMD_READ_EFUSE, &payload)
    }

    pub fn repartition(&self, t: &mut dyn Transport, cancel: &CancellationToken, table_bytes: &[u8]) -> Result<()> {
        self.require_fdl2()?;
        self.roundtrip(t, cancel, Self::CMD_REPARTITION, table_bytes)?;
        Ok(())
    }

    pub fn reboot(&mut self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.roundtrip(t, cancel, Self::CMD_REBOOT, &[])?;
        self.stage = SprdStage::Disconnected;
        Ok(())
    }

    pub fn power_off(&mut self, t: &mut dyn Transport, cancel: &CancellationToken) -> Result<()> {
        self.roundtrip(t, cancel, Self::CMD_POWER_OFF, &[])?;
        self.stage = SprdStage::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_partition_name() {
        let name = "a".repeat(MAX_PARTITION_NAME_LEN + 1);
        assert!(SprdEngine::check_name(&name).is_err());
    }

    #[test]
    fn accepts_name_at_limit() {
        let name = "a".repeat(MAX_PARTITION_NAME_LEN);
        assert!(SprdEngine::check_name(&name).is_ok());
    }
}
