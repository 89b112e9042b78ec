// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! SPRD HDLC-like frame codec (C2). Start `0x7E`, 16-bit BE type, 16-bit BE
//! length, payload, 16-bit BE CRC16-CCITT over type||length||payload, end
//! `0x7E`; 0x7E/0x7D inside the frame are escaped. See spec §4.2.

use crate::error::{FlashError, FramingError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// CRC16-CCITT, poly 0x1021, init 0, no xorout (§4.2). A hand-rolled table
/// rather than a crate dependency, matching the style of comparable
/// bootrom-protocol tools that inline their own small CRC routines.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Checksum mode selected per-device by the FDL2 handshake (§4.2): some
/// devices replace the CRC16 with a plain 16-bit sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Crc16,
    Sum16,
}

fn checksum(data: &[u8], mode: ChecksumMode) -> u16 {
    match mode {
        ChecksumMode::Crc16 => crc16_ccitt(data),
        ChecksumMode::Sum16 => data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16)),
    }
}

fn escape_into(out: &mut Vec<u8>, byte: u8) {
    match byte {
        FLAG => {
            out.push(ESCAPE);
            out.push(FLAG ^ ESCAPE_XOR);
        }
        ESCAPE => {
            out.push(ESCAPE);
            out.push(ESCAPE ^ ESCAPE_XOR);
        }
        b => out.push(b),
    }
}

/// Byte-stuffs and frames `payload` under `frame_type`: the inverse of
/// `unframe`. §8 property 7 requires this to round-trip for every payload
/// up to 65 535 bytes, escape bytes included.
pub fn frame(payload: &[u8], frame_type: u16, mode: ChecksumMode) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.write_u16::<BigEndian>(frame_type).unwrap();
    body.write_u16::<BigEndian>(payload.len() as u16).unwrap();
    body.extend_from_slice(payload);
    let crc = checksum(&body, mode);

    let mut out = Vec::with_capacity(body.len() + 8);
    out.push(FLAG);
    for &b in &body {
        escape_into(&mut out, b);
    }
    let mut crc_bytes = [0u8; 2];
    (&mut crc_bytes[..]).write_u16::<BigEndian>(crc).unwrap();
    for &b in &crc_bytes {
        escape_into(&mut out, b);
    }
    out.push(FLAG);
    out
}

/// Unescapes and validates one complete frame (including the leading and
/// trailing `0x7E`), returning `(payload, frame_type)`.
pub fn unframe(raw: &[u8]) -> Result<(Vec<u8>, u16)> {
    if raw.len() < 2 || raw[0] != FLAG || raw[raw.len() - 1] != FLAG {
        return Err(FramingError::BadMagic { offset: 0 }.into());
    }
    let mut unescaped = Vec::with_capacity(raw.len());
    let mut i = 1;
    while i < raw.len() - 1 {
        let b = raw[i];
        if b == ESCAPE {
            let Some(&next) = raw.get(i + 1) else {
                return Err(FramingError::Escape { offset: i }.into());
            };
            unescaped.push(next ^ ESCAPE_XOR);
            i += 2;
        } else {
            unescaped.push(b);
            i += 1;
        }
    }

    if unescaped.len() < 6 {
        return Err(FramingError::BadLength { offset: 0 }.into());
    }
    let (body, crc_bytes) = unescaped.split_at(unescaped.len() - 2);
    let mut crc_cur = crc_bytes;
    let on_wire_crc = crc_cur
        .read_u16::<BigEndian>()
        .map_err(|_| FlashError::from(FramingError::BadLength { offset: unescaped.len() - 2 }))?;

    let mut cur = body;
    let frame_type = cur
        .read_u16::<BigEndian>()
        .map_err(|_| FlashError::from(FramingError::BadLength { offset: 0 }))?;
    let length = cur
        .read_u16::<BigEndian>()
        .map_err(|_| FlashError::from(FramingError::BadLength { offset: 2 }))? as usize;
    if cur.len() != length {
        return Err(FramingError::BadLength { offset: 4 }.into());
    }

    for &mode in &[ChecksumMode::Crc16, ChecksumMode::Sum16] {
        if checksum(body, mode) == on_wire_crc {
            return Ok((cur.to_vec(), frame_type));
        }
    }
    Err(FramingError::BadChecksum { offset: unescaped.len() - 2 }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_payloads_with_escape_bytes() {
        let payloads: &[&[u8]] = &[
            b"hello world",
            &[0x7E, 0x7D, 0x01, 0x7E, 0x7E, 0x7D],
            &[],
            &(0u16..=255).map(|b| b as u8).collect::<Vec<u8>>(),
        ];
        for payload in payloads {
            let framed = frame(payload, 0x0001, ChecksumMode::Crc16);
            let (decoded, frame_type) = unframe(&framed).unwrap();
            assert_eq!(&decoded, payload);
            assert_eq!(frame_type, 0x0001);
        }
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut framed = frame(b"abc", 2, ChecksumMode::Crc16);
        let last = framed.len() - 2;
        framed[last] ^= 0xFF;
        assert!(unframe(&framed).is_err());
    }
}
