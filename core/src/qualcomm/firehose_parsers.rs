// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Stand-alone attribute parsers kept separate from the engine for log
//! replay / offline analysis, matching the teacher's `qdl::parsers` split.

use crate::error::{FlashError, ProtocolError, Result};
use indexmap::IndexMap;

/// The highest Firehose protocol version this engine speaks.
pub const FH_PROTO_VERSION_SUPPORTED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckNak {
    Ack,
    Nak,
}

pub fn parse_ack_nak(attrs: &IndexMap<String, String>) -> Result<AckNak> {
    match attrs.get("value").map(String::as_str) {
        Some("ACK") => Ok(AckNak::Ack),
        Some("NAK") => Ok(AckNak::Nak),
        _ => Err(crate::error::malformed_attrs(attrs)),
    }
}

/// Parsed `<configure>` response: device-reported limits the session must
/// adopt (§4.8).
#[derive(Debug, Clone)]
pub struct ConfigureResponse {
    pub max_payload_to_target: usize,
    pub max_payload_to_target_supported: usize,
    pub max_xml_size: usize,
    pub version: String,
    pub min_version_supported: u32,
}

pub fn parse_configure_response(attrs: &IndexMap<String, String>) -> Result<ConfigureResponse> {
    let get_usize = |k: &str| -> Result<usize> {
        attrs
            .get(k)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| crate::error::malformed_attrs(attrs))
    };
    let min_version_supported = attrs
        .get("MinVersionSupported")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| crate::error::malformed_attrs(attrs))?;
    if min_version_supported < FH_PROTO_VERSION_SUPPORTED {
        return Err(ProtocolError::UnsupportedVersion(min_version_supported).into());
    }
    Ok(ConfigureResponse {
        max_payload_to_target: get_usize("MaxPayloadSizeToTargetInBytes")?,
        max_payload_to_target_supported: get_usize("MaxPayloadSizeToTargetInBytesSupported")?,
        max_xml_size: get_usize("MaxXMLSizeInBytes")?,
        version: attrs.get("Version").cloned().unwrap_or_default(),
        min_version_supported,
    })
}

/// Parsed `<getstorageinfo>` response.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub block_size: u64,
    pub total_blocks: u64,
    pub manufacturer: String,
}

pub fn parse_storage_info(attrs: &IndexMap<String, String>) -> Result<StorageInfo> {
    Ok(StorageInfo {
        block_size: attrs.get("block_size").and_then(|v| v.parse().ok()).unwrap_or(0),
        total_blocks: attrs.get("total_blocks").and_then(|v| v.parse().ok()).unwrap_or(0),
        manufacturer: attrs.get("manufacturer").cloned().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn ack_nak_roundtrip() {
        assert_eq!(parse_ack_nak(&attrs(&[("value", "ACK")])).unwrap(), AckNak::Ack);
        assert_eq!(parse_ack_nak(&attrs(&[("value", "NAK")])).unwrap(), AckNak::Nak);
        assert!(parse_ack_nak(&attrs(&[("value", "WAT")])).is_err());
    }

    #[test]
    fn configure_response_rejects_stale_min_version() {
        let a = attrs(&[
            ("MaxPayloadSizeToTargetInBytes", "1048576"),
            ("MaxPayloadSizeToTargetInBytesSupported", "1048576"),
            ("MaxXMLSizeInBytes", "4096"),
            ("Version", "1.0"),
            ("MinVersionSupported", "0"),
        ]);
        let err = parse_configure_response(&a);
        assert!(matches!(err, Err(FlashError::Protocol(ProtocolError::UnsupportedVersion(0)))));
    }
}
