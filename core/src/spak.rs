// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Read-only loader for the `SPAK` resource-pack container (§6, §E). The
//! core crate only ever reads a SPAK file; nothing here writes one.

use crate::error::{FormatError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

const SPAK_MAGIC: &[u8; 4] = b"SPAK";
const SPAK_VERSION: u16 = 0x0200;
const HEADER_LEN: usize = 32;
const ENTRY_LEN: usize = 128;

const FLAG_GZIP: u32 = 1 << 0;

#[derive(Debug, Clone)]
pub struct SpakEntry {
    pub name: String,
    pub category: String,
    pub subcategory: String,
    pub data_offset: u32,
    pub compressed_size: u32,
    pub original_size: u32,
    pub crc32: u32,
    pub entry_type: u32,
    pub flags: u32,
    pub address: u32,
}

pub struct SpakArchive {
    bytes: Vec<u8>,
    data_offset: u32,
    entries: Vec<SpakEntry>,
}

fn read_fixed_str(cur: &mut impl Read, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf).map_err(crate::error::TransportError::IoFault)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&buf[..end]).to_string())
}

impl SpakArchive {
    /// Opens a SPAK container already read fully into memory.
    pub fn open(bytes: Vec<u8>) -> Result<SpakArchive> {
        let mut cur = Cursor::new(&bytes);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).map_err(crate::error::TransportError::IoFault)?;
        if &magic != SPAK_MAGIC {
            return Err(FormatError::BadPac("SPAK: bad magic".into()).into());
        }
        let version = cur.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
        if version != SPAK_VERSION {
            return Err(FormatError::BadPac(format!("SPAK: unsupported version 0x{version:x}")).into());
        }
        let entry_count = cur.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
        let _flags = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
        let _checksum = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
        let data_offset = cur.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
        let mut reserved = [0u8; 8];
        cur.read_exact(&mut reserved).map_err(crate::error::TransportError::IoFault)?;

        let table_start = HEADER_LEN;
        let table_end = table_start + entry_count as usize * ENTRY_LEN;
        let table = bytes
            .get(table_start..table_end)
            .ok_or_else(|| FormatError::BadPac("SPAK: entry table out of bounds".into()))?;

        let mut entries = Vec::with_capacity(entry_count as usize);
        for chunk in table.chunks_exact(ENTRY_LEN) {
            let mut c = Cursor::new(chunk);
            let name = read_fixed_str(&mut c, 32)?;
            let category = read_fixed_str(&mut c, 16)?;
            let subcategory = read_fixed_str(&mut c, 16)?;
            let data_offset = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let compressed_size = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let original_size = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let crc32 = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let entry_type = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let flags = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let address = c.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            entries.push(SpakEntry {
                name,
                category,
                subcategory,
                data_offset,
                compressed_size,
                original_size,
                crc32,
                entry_type,
                flags,
                address,
            });
        }

        Ok(SpakArchive { bytes, data_offset, entries })
    }

    pub fn entries(&self) -> &[SpakEntry] {
        &self.entries
    }

    /// Looks up an entry by name and returns its decompressed bytes,
    /// inflating gzip bodies transparently (flag bit 0).
    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entries.iter().find(|e| e.name == name) else {
            return Ok(None);
        };
        let start = self.data_offset as usize + entry.data_offset as usize;
        let end = start + entry.compressed_size as usize;
        let raw = self
            .bytes
            .get(start..end)
            .ok_or_else(|| FormatError::BadPac(format!("SPAK entry '{name}' out of bounds")))?;

        if entry.flags & FLAG_GZIP != 0 {
            let mut decoder = flate2::read::GzDecoder::new(raw);
            let mut out = Vec::with_capacity(entry.original_size as usize);
            decoder.read_to_end(&mut out).map_err(crate::error::TransportError::IoFault)?;
            Ok(Some(out))
        } else {
            Ok(Some(raw.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let table_len = entries.len() * ENTRY_LEN;
        let data_offset = (HEADER_LEN + table_len) as u32;

        let mut out = Vec::new();
        out.extend_from_slice(SPAK_MAGIC);
        out.extend_from_slice(&SPAK_VERSION.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&data_offset.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);

        let mut running_offset = 0u32;
        let mut bodies = Vec::new();
        for (name, body) in entries {
            let mut name_buf = [0u8; 32];
            name_buf[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&name_buf);
            out.extend_from_slice(&[0u8; 16]);
            out.extend_from_slice(&[0u8; 16]);
            out.extend_from_slice(&running_offset.to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&[0u8; 36]);
            bodies.extend_from_slice(body);
            running_offset += body.len() as u32;
        }
        out.extend_from_slice(&bodies);
        out
    }

    #[test]
    fn reads_entry_by_name() {
        let bytes = build_archive(&[("chip_db", b"hello world")]);
        let archive = SpakArchive::open(bytes).unwrap();
        assert_eq!(archive.entries().len(), 1);
        assert_eq!(archive.get("chip_db").unwrap().unwrap(), b"hello world");
        assert!(archive.get("missing").unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(SpakArchive::open(vec![0u8; HEADER_LEN]).is_err());
    }
}
