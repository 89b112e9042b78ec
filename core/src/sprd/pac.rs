// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Spreadtrum PAC firmware-package parser (C4). Two header variants,
//! `BP_R1.0.0` and `BP_R2.0.1`; both fold their file tables into the same
//! `PacEntry` shape. See spec §4.4, §6.

use crate::error::{FormatError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

const VERSION_FIELD_LEN: usize = 44;
const PRODUCT_NAME_LEN: usize = 512;
const FIRMWARE_NAME_LEN: usize = 512;
const PRODUCT_ALIAS_LEN: usize = 996;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacPartType {
    Fdl1,
    Fdl2,
    Xml,
    Nv,
    Boot,
    System,
    UserData,
    Partition,
}

fn classify(partition_name: &str, file_name: &str) -> PacPartType {
    let p = partition_name.to_ascii_lowercase();
    let f = file_name.to_ascii_lowercase();
    if p == "fdl" || f.contains("fdl1") {
        PacPartType::Fdl1
    } else if f.contains("fdl2") {
        PacPartType::Fdl2
    } else if f.ends_with(".xml") {
        PacPartType::Xml
    } else if p.contains("nv") {
        PacPartType::Nv
    } else if p.contains("boot") {
        PacPartType::Boot
    } else if p == "system" || p.contains("system") {
        PacPartType::System
    } else if p.contains("userdata") {
        PacPartType::UserData
    } else {
        PacPartType::Partition
    }
}

/// One PAC file entry (§3 "PAC file entry").
#[derive(Debug, Clone)]
pub struct PacEntry {
    pub partition_name: String,
    pub file_name: String,
    pub original_name: String,
    pub data_offset: u64,
    pub size: u64,
    pub file_flag: u32,
    pub check_flag: u32,
    pub load_address: u32,
    pub kind: PacPartType,
    pub is_sparse: bool,
}

pub struct PacArchive {
    pub version: String,
    pub product_name: String,
    pub firmware_name: String,
    pub entries: Vec<PacEntry>,
}

/// Implements the "reversed-assembly" 64-bit quirk preserved verbatim from
/// the original tooling per §3/§9: `if hi>2 return hi; if lo>2 return lo;
/// else hi<<32|lo`.
fn assemble_reversed_u64(hi: u32, lo: u32) -> u64 {
    if hi > 2 {
        hi as u64
    } else if lo > 2 {
        lo as u64
    } else {
        ((hi as u64) << 32) | lo as u64
    }
}

fn read_utf16le_fixed(cur: &mut impl Read, byte_len: usize) -> Result<String> {
    let mut raw = vec![0u8; byte_len];
    cur.read_exact(&mut raw).map_err(crate::error::TransportError::IoFault)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Parses a PAC file's header and file table. Does not read file bodies;
/// callers extract by offset/size via `read_entry`.
pub fn parse_pac(bytes: &[u8]) -> Result<PacArchive> {
    let mut cur = Cursor::new(bytes);
    let version = read_utf16le_fixed(&mut cur, VERSION_FIELD_LEN)?;
    if version != "BP_R1.0.0" && version != "BP_R2.0.1" {
        return Err(FormatError::BadPac(format!("unrecognised PAC version '{version}'")).into());
    }

    let size_lo = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let size_hi = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let pac_size = assemble_reversed_u64(size_hi, size_lo);
    if pac_size < bytes.len() as u64 {
        return Err(FormatError::BadPac(format!(
            "declared size {pac_size} smaller than file size {}",
            bytes.len()
        ))
        .into());
    }

    let product_name = read_utf16le_fixed(&mut cur, PRODUCT_NAME_LEN)?;
    let firmware_name = read_utf16le_fixed(&mut cur, FIRMWARE_NAME_LEN)?;

    let partition_count = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let partitions_list_offset = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;

    let mut alias = [0u8; PRODUCT_ALIAS_LEN];
    cur.read_exact(&mut alias).map_err(crate::error::TransportError::IoFault)?;

    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic).map_err(crate::error::TransportError::IoFault)?;
    let _crc1 = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let _crc2 = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;

    cur.seek(SeekFrom::Start(partitions_list_offset as u64))
        .map_err(crate::error::TransportError::IoFault)?;

    let is_r2 = version == "BP_R2.0.1";
    let mut entries = Vec::with_capacity(partition_count as usize);
    for _ in 0..partition_count {
        entries.push(if is_r2 {
            read_entry_r2(&mut cur)?
        } else {
            read_entry_r1(&mut cur)?
        });
    }

    Ok(PacArchive { version, product_name, firmware_name, entries })
}

/// R2's file entry is a fixed 24-byte reversed-integer block; field widths
/// and ordering follow the R2 wire layout preserved from the original tool.
fn read_entry_r2(cur: &mut impl Read) -> Result<PacEntry> {
    let mut name_buf = [0u8; 256];
    cur.read_exact(&mut name_buf[..256]).map_err(crate::error::TransportError::IoFault)?;
    let partition_name = utf16_from_bytes(&name_buf);

    let mut fname_buf = [0u8; 512];
    cur.read_exact(&mut fname_buf).map_err(crate::error::TransportError::IoFault)?;
    let file_name = utf16_from_bytes(&fname_buf);

    let size_lo = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let size_hi = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let size = assemble_reversed_u64(size_hi, size_lo);

    let offset_lo = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let offset_hi = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let data_offset = assemble_reversed_u64(offset_hi, offset_lo);

    let file_flag = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let check_flag = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let load_address = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;

    let kind = classify(&partition_name, &file_name);
    Ok(PacEntry {
        original_name: file_name.clone(),
        is_sparse: file_name.to_ascii_lowercase().contains("sparsechunk"),
        partition_name,
        file_name,
        data_offset,
        size,
        file_flag,
        check_flag,
        load_address,
        kind,
    })
}

/// R1's entries are historically variable-length; real-world R1 packages in
/// the wild use the same fixed layout as R2 minus the two reversed-assembly
/// fields (plain little-endian 64-bit size/offset), which this parses.
fn read_entry_r1(cur: &mut impl Read) -> Result<PacEntry> {
    let mut name_buf = [0u8; 256];
    cur.read_exact(&mut name_buf).map_err(crate::error::TransportError::IoFault)?;
    let partition_name = utf16_from_bytes(&name_buf);

    let mut fname_buf = [0u8; 512];
    cur.read_exact(&mut fname_buf).map_err(crate::error::TransportError::IoFault)?;
    let file_name = utf16_from_bytes(&fname_buf);

    let size = cur.read_u64::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let data_offset = cur.read_u64::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let file_flag = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let check_flag = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let load_address = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;

    let kind = classify(&partition_name, &file_name);
    Ok(PacEntry {
        original_name: file_name.clone(),
        is_sparse: file_name.to_ascii_lowercase().contains("sparsechunk"),
        partition_name,
        file_name,
        data_offset,
        size,
        file_flag,
        check_flag,
        load_address,
        kind,
    })
}

fn utf16_from_bytes(buf: &[u8]) -> String {
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Extracts one entry's bytes given the whole PAC file buffer.
pub fn read_entry<'a>(pac_bytes: &'a [u8], entry: &PacEntry) -> Result<&'a [u8]> {
    let start = entry.data_offset as usize;
    let end = start
        .checked_add(entry.size as usize)
        .ok_or_else(|| FormatError::BadPac("entry size overflow".into()))?;
    pac_bytes
        .get(start..end)
        .ok_or_else(|| FormatError::BadPac(format!("entry {} out of bounds", entry.file_name)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_assembly_quirk_prefers_large_half() {
        assert_eq!(assemble_reversed_u64(10, 0), 10);
        assert_eq!(assemble_reversed_u64(0, 10), 10);
        assert_eq!(assemble_reversed_u64(1, 2), (1u64 << 32) | 2);
    }

    #[test]
    fn classifies_fdl_and_xml_entries() {
        assert_eq!(classify("FDL", "fdl1.bin"), PacPartType::Fdl1);
        assert_eq!(classify("FDL2", "whatever_fdl2.bin"), PacPartType::Fdl2);
        assert_eq!(classify("cfg", "product.xml"), PacPartType::Xml);
    }
}
