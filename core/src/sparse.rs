// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Android sparse image codec (C3): a lazy sequence of (device-offset,
//! data-source) chunks read straight off a seekable source, without
//! materialising the expanded image. See spec §4.3.

use crate::error::{FormatError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26FF3A;
const HEADER_LEN: u64 = 28;
const CHUNK_HEADER_LEN: u64 = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, Copy)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

/// What produced a chunk's bytes, matching §4.3's decoder output records.
#[derive(Debug, Clone)]
pub enum ChunkSource {
    /// Inline bytes read verbatim from the sparse stream.
    Raw(Vec<u8>),
    /// A 4-byte pattern repeated to fill the chunk's expanded length.
    Fill([u8; 4]),
    /// No write; only the device offset advances.
    DontCare,
    /// A CRC32 checksum chunk carrying no device bytes of its own.
    Crc32(u32),
}

#[derive(Debug, Clone)]
pub struct SparseChunk {
    pub device_offset: u64,
    pub expanded_len: u64,
    pub source: ChunkSource,
}

fn read_header(r: &mut impl Read) -> Result<SparseHeader> {
    let magic = r.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    if magic != SPARSE_HEADER_MAGIC {
        return Err(FormatError::BadSparse(format!("bad magic 0x{magic:x}")).into());
    }
    let major_version = r.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let minor_version = r.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let header_size = r.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let chunk_header_size = r.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let block_size = r.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let total_blocks = r.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let total_chunks = r.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    let image_checksum = r.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
    if header_size as u64 != HEADER_LEN || chunk_header_size as u64 != CHUNK_HEADER_LEN {
        return Err(FormatError::BadSparse(format!(
            "unexpected header sizes {header_size}/{chunk_header_size}"
        ))
        .into());
    }
    Ok(SparseHeader { major_version, minor_version, block_size, total_blocks, total_chunks, image_checksum })
}

/// Decodes a sparse image from a seekable source, returning the header and
/// the full chunk list in order. Each chunk's declared size is validated
/// against its on-wire byte count (§4.3 "Decoder MUST reject...").
pub struct SparseReader<R: Read + Seek> {
    inner: R,
    header: SparseHeader,
    chunks: Vec<SparseChunk>,
    cursor_chunk: usize,
    cursor_within: u64,
}

impl<R: Read + Seek> SparseReader<R> {
    pub fn open(mut inner: R) -> Result<Self> {
        let header = read_header(&mut inner)?;
        let mut chunks = Vec::with_capacity(header.total_chunks as usize);
        let mut device_offset = 0u64;
        for _ in 0..header.total_chunks {
            let chunk_type = inner.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let _reserved = inner.read_u16::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let chunk_sz_blocks = inner.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
            let total_sz = inner.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)? as u64;
            let expanded_len = chunk_sz_blocks as u64 * header.block_size as u64;
            let body_len = total_sz.checked_sub(CHUNK_HEADER_LEN).ok_or_else(|| {
                FormatError::BadSparse(format!("chunk total_sz {total_sz} shorter than chunk header"))
            })?;

            let source = match chunk_type {
                CHUNK_TYPE_RAW => {
                    if body_len != expanded_len {
                        return Err(FormatError::BadSparse(format!(
                            "RAW chunk body {body_len} bytes does not match expanded length {expanded_len}"
                        ))
                        .into());
                    }
                    let mut buf = vec![0u8; body_len as usize];
                    inner.read_exact(&mut buf).map_err(crate::error::TransportError::IoFault)?;
                    ChunkSource::Raw(buf)
                }
                CHUNK_TYPE_FILL => {
                    if body_len != 4 {
                        return Err(FormatError::BadSparse(format!(
                            "FILL chunk body {body_len} bytes, expected 4"
                        ))
                        .into());
                    }
                    let mut pattern = [0u8; 4];
                    inner.read_exact(&mut pattern).map_err(crate::error::TransportError::IoFault)?;
                    ChunkSource::Fill(pattern)
                }
                CHUNK_TYPE_DONT_CARE => {
                    if body_len != 0 {
                        return Err(FormatError::BadSparse(format!(
                            "DONT_CARE chunk carries {body_len} unexpected bytes"
                        ))
                        .into());
                    }
                    ChunkSource::DontCare
                }
                CHUNK_TYPE_CRC32 => {
                    if body_len != 4 {
                        return Err(FormatError::BadSparse(format!(
                            "CRC32 chunk body {body_len} bytes, expected 4"
                        ))
                        .into());
                    }
                    let crc = inner.read_u32::<LittleEndian>().map_err(crate::error::TransportError::IoFault)?;
                    ChunkSource::Crc32(crc)
                }
                other => return Err(FormatError::BadSparse(format!("unknown chunk type 0x{other:x}")).into()),
            };

            chunks.push(SparseChunk { device_offset, expanded_len, source });
            device_offset += expanded_len;
        }

        Ok(SparseReader { inner, header, chunks, cursor_chunk: 0, cursor_within: 0 })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    pub fn chunks(&self) -> &[SparseChunk] {
        &self.chunks
    }

    pub fn total_size(&self) -> u64 {
        self.header.total_blocks as u64 * self.header.block_size as u64
    }

    /// Re-reads the declared `load_address`/offset-relative byte range for
    /// `chunk` from the underlying source, used when a caller wants to seek
    /// back to a RAW chunk without holding every chunk's bytes in memory.
    pub fn seek_to_expanded_offset(&mut self, byte_offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(byte_offset)).map_err(crate::error::TransportError::IoFault)?;
        Ok(())
    }
}

/// Expands a chunk's source to `expanded_len` bytes, writing them to `out`.
/// Used by callers that must materialise a segment (e.g. device-sparse
/// transports that don't understand DONT_CARE and must skip it themselves).
pub fn expand_chunk(chunk: &SparseChunk, out: &mut Vec<u8>) {
    match &chunk.source {
        ChunkSource::Raw(bytes) => out.extend_from_slice(bytes),
        ChunkSource::Fill(pattern) => {
            let n = (chunk.expanded_len / 4) as usize;
            out.reserve(n * 4);
            for _ in 0..n {
                out.extend_from_slice(pattern);
            }
        }
        ChunkSource::DontCare | ChunkSource::Crc32(_) => {}
    }
}

/// Reads `len` bytes for a streaming consumer (e.g. Fastboot/Firehose
/// `program`), treating DONT_CARE chunks as zero-filled rather than
/// skipped, since both targets require every byte of the partition.
impl<R: Read + Seek> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.cursor_chunk < self.chunks.len() {
            let chunk = &self.chunks[self.cursor_chunk];
            let remaining_in_chunk = chunk.expanded_len - self.cursor_within;
            if remaining_in_chunk == 0 {
                self.cursor_chunk += 1;
                self.cursor_within = 0;
                continue;
            }
            let want = remaining_in_chunk.min((buf.len() - written) as u64) as usize;
            match &chunk.source {
                ChunkSource::Raw(bytes) => {
                    let start = self.cursor_within as usize;
                    buf[written..written + want].copy_from_slice(&bytes[start..start + want]);
                }
                ChunkSource::Fill(pattern) => {
                    for i in 0..want {
                        buf[written + i] = pattern[(self.cursor_within as usize + i) % 4];
                    }
                }
                ChunkSource::DontCare => {
                    for b in &mut buf[written..written + want] {
                        *b = 0;
                    }
                }
                ChunkSource::Crc32(_) => {}
            }
            self.cursor_within += want as u64;
            written += want;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_image(chunks: &[(u16, u32, Vec<u8>)]) -> Vec<u8> {
        let block_size = 4u32;
        let total_blocks: u32 = chunks.iter().map(|(_, sz, _)| sz).sum();
        let mut out = Vec::new();
        out.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        out.extend_from_slice(&(CHUNK_HEADER_LEN as u16).to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        out.extend_from_slice(&total_blocks.to_le_bytes());
        out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for (chunk_type, sz_blocks, body) in chunks {
            out.extend_from_slice(&chunk_type.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&sz_blocks.to_le_bytes());
            out.extend_from_slice(&((CHUNK_HEADER_LEN as u32) + body.len() as u32).to_le_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn decodes_raw_fill_and_dont_care_chunks() {
        let raw_body = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let fill_pattern = 0xAAAAAAAAu32.to_le_bytes().to_vec();
        let image = build_image(&[
            (CHUNK_TYPE_RAW, 2, raw_body.clone()),
            (CHUNK_TYPE_FILL, 1, fill_pattern),
            (CHUNK_TYPE_DONT_CARE, 3, vec![]),
        ]);
        let mut reader = SparseReader::open(Cursor::new(image)).unwrap();
        assert_eq!(reader.chunks().len(), 3);
        assert_eq!(reader.total_size(), 6 * 4);
        assert!(matches!(reader.chunks()[0].source, ChunkSource::Raw(ref b) if *b == raw_body));
        assert!(matches!(reader.chunks()[2].source, ChunkSource::DontCare));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), reader.total_size() as usize);
    }

    #[test]
    fn rejects_raw_chunk_with_mismatched_declared_size() {
        let image = build_image(&[(CHUNK_TYPE_RAW, 4, vec![1, 2, 3, 4])]);
        let err = SparseReader::open(Cursor::new(image));
        assert!(err.is_err());
    }
}
