// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Android OTA `payload.bin` parser (C6). Reads the payload header and its
//! protobuf-like manifest, then yields a lazy per-partition operation
//! sequence an applier can turn into raw bytes. See spec §4.6.

use crate::error::{FormatError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};

const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOpType {
    Replace,
    ReplaceBz,
    ReplaceXz,
    Zero,
    Copy,
    SourceCopy,
    SourceBsdiff,
}

impl PayloadOpType {
    fn from_wire(v: u64) -> Option<PayloadOpType> {
        Some(match v {
            0 => PayloadOpType::Replace,
            1 => PayloadOpType::ReplaceBz,
            2 => PayloadOpType::Copy,
            3 => PayloadOpType::SourceCopy,
            4 => PayloadOpType::Zero,
            9 => PayloadOpType::SourceBsdiff,
            8 => PayloadOpType::ReplaceXz,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

#[derive(Debug, Clone)]
pub struct PayloadOp {
    pub op_type: PayloadOpType,
    pub dst_extents: Vec<Extent>,
    pub data_offset: Option<u64>,
    pub data_length: Option<u64>,
    pub data_sha256: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PartitionDescriptor {
    pub partition_name: String,
    pub new_partition_size: u64,
    pub operations: Vec<PayloadOp>,
}

pub struct PayloadHeader {
    pub version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
}

/// Opened payload: the header plus an offset into `bytes` where operation
/// data (the "blob store") begins, so each `PayloadOp`'s `data_offset` is
/// relative to this point.
pub struct Payload<'a> {
    pub header: PayloadHeader,
    pub partitions: Vec<PartitionDescriptor>,
    blob_store: &'a [u8],
}

impl<'a> Payload<'a> {
    /// Parses a raw `payload.bin` buffer. Use `from_zip` for an OTA ZIP
    /// envelope that streams the embedded `payload.bin` member instead.
    pub fn parse(bytes: &'a [u8]) -> Result<Payload<'a>> {
        let mut cur = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).map_err(crate::error::TransportError::IoFault)?;
        if &magic != PAYLOAD_MAGIC {
            return Err(FormatError::BadPayload("bad magic, expected 'CrAU'".into()).into());
        }
        let version = cur.read_u64::<BigEndian>().map_err(crate::error::TransportError::IoFault)?;
        let manifest_size = cur.read_u64::<BigEndian>().map_err(crate::error::TransportError::IoFault)?;
        let metadata_signature_size = if version >= 2 {
            cur.read_u32::<BigEndian>().map_err(crate::error::TransportError::IoFault)?
        } else {
            0
        };

        let manifest_start = cur.position() as usize;
        let manifest_end = manifest_start
            .checked_add(manifest_size as usize)
            .ok_or_else(|| FormatError::BadPayload("manifest_size overflow".into()))?;
        let manifest_bytes = bytes
            .get(manifest_start..manifest_end)
            .ok_or_else(|| FormatError::BadPayload("manifest extends past end of file".into()))?;

        let blob_store_start = manifest_end + metadata_signature_size as usize;
        let blob_store = bytes.get(blob_store_start..).unwrap_or(&[]);

        let partitions = parse_manifest(manifest_bytes)?;

        Ok(Payload {
            header: PayloadHeader { version, manifest_size, metadata_signature_size },
            partitions,
            blob_store,
        })
    }

    /// Reads and decompresses `op`'s operation data, verifying its SHA-256
    /// digest when the manifest carried one.
    pub fn read_op_data(&self, op: &PayloadOp) -> Result<Vec<u8>> {
        let (offset, length) = match (op.data_offset, op.data_length) {
            (Some(o), Some(l)) => (o as usize, l as usize),
            _ => return Ok(Vec::new()),
        };
        let raw = self
            .blob_store
            .get(offset..offset + length)
            .ok_or_else(|| FormatError::BadPayload("operation data out of bounds".into()))?;

        if let Some(expected) = &op.data_sha256 {
            let mut hasher = Sha256::new();
            hasher.update(raw);
            let actual = hasher.finalize();
            if actual.as_slice() != expected.as_slice() {
                return Err(FormatError::BadPayload("operation data failed SHA-256 verification".into()).into());
            }
        }

        match op.op_type {
            PayloadOpType::Replace | PayloadOpType::Copy | PayloadOpType::SourceCopy | PayloadOpType::SourceBsdiff => {
                Ok(raw.to_vec())
            }
            PayloadOpType::ReplaceBz => {
                let mut decoder = bzip2::read::BzDecoder::new(raw);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).map_err(crate::error::TransportError::IoFault)?;
                Ok(out)
            }
            PayloadOpType::ReplaceXz => {
                let mut decoder = xz2::read::XzDecoder::new(raw);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).map_err(crate::error::TransportError::IoFault)?;
                Ok(out)
            }
            PayloadOpType::Zero => Ok(Vec::new()),
        }
    }
}

/// Extracts the `payload.bin` member out of an OTA ZIP envelope without
/// decompressing anything else the archive carries (§4.6 "ZIP/OTA
/// envelope"). The returned bytes can be handed to `Payload::parse`.
pub fn extract_payload_from_zip(zip_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;
    let mut file = archive
        .by_name("payload.bin")
        .map_err(|_| FormatError::BadPayload("ZIP envelope has no payload.bin member".into()))?;
    let mut out = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut out).map_err(crate::error::TransportError::IoFault)?;
    Ok(out)
}

// --- minimal protobuf wire-format reader for DeltaArchiveManifest -------
//
// Only the fields this tool needs are decoded: `install_operations` nested
// inside `partitions`. No schema/codegen dependency is introduced; this
// walks the wire format directly the same way the PAC/HDLC codecs walk
// their own bespoke binary layouts.

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

enum WireValue<'a> {
    Varint(u64),
    LengthDelimited(&'a [u8]),
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| FormatError::BadPayload("truncated varint".into()))?;
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(FormatError::BadPayload("varint too long".into()).into());
            }
        }
        Ok(result)
    }

    fn read_field(&mut self) -> Result<Option<(u32, WireValue<'a>)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.read_varint()?;
        let field_number = (tag >> 3) as u32;
        let wire_type = tag & 0x7;
        let value = match wire_type {
            0 => WireValue::Varint(self.read_varint()?),
            2 => {
                let len = self.read_varint()? as usize;
                let start = self.pos;
                let end = start
                    .checked_add(len)
                    .ok_or_else(|| FormatError::BadPayload("length-delimited field overflow".into()))?;
                let slice = self
                    .buf
                    .get(start..end)
                    .ok_or_else(|| FormatError::BadPayload("length-delimited field out of bounds".into()))?;
                self.pos = end;
                WireValue::LengthDelimited(slice)
            }
            5 => {
                let start = self.pos;
                self.pos += 4;
                WireValue::LengthDelimited(
                    self.buf
                        .get(start..self.pos)
                        .ok_or_else(|| FormatError::BadPayload("truncated 32-bit field".into()))?,
                )
            }
            1 => {
                let start = self.pos;
                self.pos += 8;
                WireValue::LengthDelimited(
                    self.buf
                        .get(start..self.pos)
                        .ok_or_else(|| FormatError::BadPayload("truncated 64-bit field".into()))?,
                )
            }
            other => return Err(FormatError::BadPayload(format!("unsupported wire type {other}")).into()),
        };
        Ok(Some((field_number, value)))
    }
}

fn as_string(v: &[u8]) -> String {
    String::from_utf8_lossy(v).to_string()
}

fn parse_manifest(bytes: &[u8]) -> Result<Vec<PartitionDescriptor>> {
    let mut reader = WireReader::new(bytes);
    let mut partitions = Vec::new();
    // DeltaArchiveManifest field 13 is `repeated PartitionUpdate partitions`.
    while let Some((field, value)) = reader.read_field()? {
        if field == 13 {
            if let WireValue::LengthDelimited(body) = value {
                partitions.push(parse_partition_update(body)?);
            }
        }
    }
    Ok(partitions)
}

fn parse_partition_update(bytes: &[u8]) -> Result<PartitionDescriptor> {
    let mut reader = WireReader::new(bytes);
    let mut partition_name = String::new();
    let mut new_partition_size = 0u64;
    let mut operations = Vec::new();
    while let Some((field, value)) = reader.read_field()? {
        match (field, value) {
            (1, WireValue::LengthDelimited(v)) => partition_name = as_string(v),
            // `new_partition_info` (field 2) wraps {size, hash}; we only need size.
            (2, WireValue::LengthDelimited(v)) => {
                new_partition_size = parse_partition_info_size(v)?;
            }
            (3, WireValue::LengthDelimited(v)) => {
                if let Some(op) = parse_install_operation(v)? {
                    operations.push(op);
                }
            }
            _ => {}
        }
    }
    Ok(PartitionDescriptor { partition_name, new_partition_size, operations })
}

fn parse_partition_info_size(bytes: &[u8]) -> Result<u64> {
    let mut reader = WireReader::new(bytes);
    let mut size = 0u64;
    while let Some((field, value)) = reader.read_field()? {
        if field == 1 {
            if let WireValue::Varint(v) = value {
                size = v;
            }
        }
    }
    Ok(size)
}

fn parse_install_operation(bytes: &[u8]) -> Result<Option<PayloadOp>> {
    let mut reader = WireReader::new(bytes);
    let mut op_type = None;
    let mut dst_extents = Vec::new();
    let mut data_offset = None;
    let mut data_length = None;
    let mut data_sha256 = None;
    while let Some((field, value)) = reader.read_field()? {
        match (field, value) {
            (1, WireValue::Varint(v)) => op_type = PayloadOpType::from_wire(v),
            (2, WireValue::Varint(v)) => data_offset = Some(v),
            (3, WireValue::Varint(v)) => data_length = Some(v),
            (4, WireValue::LengthDelimited(v)) => dst_extents.push(parse_extent(v)?),
            (6, WireValue::LengthDelimited(v)) => data_sha256 = Some(v.to_vec()),
            _ => {}
        }
    }
    Ok(op_type.map(|op_type| PayloadOp { op_type, dst_extents, data_offset, data_length, data_sha256 }))
}

fn parse_extent(bytes: &[u8]) -> Result<Extent> {
    let mut reader = WireReader::new(bytes);
    let mut start_block = 0u64;
    let mut num_blocks = 0u64;
    while let Some((field, value)) = reader.read_field()? {
        match (field, value) {
            (1, WireValue::Varint(v)) => start_block = v,
            (2, WireValue::Varint(v)) => num_blocks = v,
            _ => {}
        }
    }
    Ok(Extent { start_block, num_blocks })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
        out
    }

    fn tag(field: u32, wire_type: u8) -> Vec<u8> {
        varint(((field as u64) << 3) | wire_type as u64)
    }

    fn length_delimited(field: u32, body: &[u8]) -> Vec<u8> {
        let mut out = tag(field, 2);
        out.extend(varint(body.len() as u64));
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn rejects_bad_magic() {
        let err = Payload::parse(b"NOPE0000");
        assert!(err.is_err());
    }

    #[test]
    fn parses_header_and_single_partition_replace_op() {
        let mut extent = tag(1, 0);
        extent.extend(varint(0));
        extent.extend(tag(2, 0));
        extent.extend(varint(4));

        let mut op = tag(1, 0);
        op.extend(varint(0)); // REPLACE
        op.extend(tag(2, 0));
        op.extend(varint(0)); // data_offset
        op.extend(tag(3, 0));
        op.extend(varint(16)); // data_length
        op.extend(length_delimited(4, &extent));

        let mut size_info = tag(1, 0);
        size_info.extend(varint(4096));

        let mut partition = length_delimited(1, b"boot");
        partition.extend(length_delimited(2, &size_info));
        partition.extend(length_delimited(3, &op));

        let manifest = length_delimited(13, &partition);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(PAYLOAD_MAGIC);
        bytes.extend_from_slice(&2u64.to_be_bytes());
        bytes.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&manifest);
        bytes.extend_from_slice(&[0u8; 16]); // blob store

        let payload = Payload::parse(&bytes).unwrap();
        assert_eq!(payload.partitions.len(), 1);
        let part = &payload.partitions[0];
        assert_eq!(part.partition_name, "boot");
        assert_eq!(part.new_partition_size, 4096);
        assert_eq!(part.operations.len(), 1);
        assert_eq!(part.operations[0].op_type, PayloadOpType::Replace);
    }
}
