// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Vendor-neutral error taxonomy shared by every engine and the facade.

use indexmap::IndexMap;

/// Transport-level failures. Anything in this family marks the owning
/// session `FAULTED`; only `disconnect` is legal afterwards.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("port is held by another session")]
    PortBusy,
    #[error("device disappeared mid-transaction")]
    PortGone,
    #[error("timed out waiting for {0} bytes")]
    Timeout(usize),
    #[error("I/O fault: {0}")]
    IoFault(#[from] std::io::Error),
}

/// Framing-level failures, one per codec in §4.2.
#[derive(thiserror::Error, Debug)]
pub enum FramingError {
    #[error("bad magic at offset {offset}")]
    BadMagic { offset: usize },
    #[error("checksum mismatch at offset {offset}")]
    BadChecksum { offset: usize },
    #[error("length field inconsistent at offset {offset}")]
    BadLength { offset: usize },
    #[error("invalid byte-stuffing escape at offset {offset}")]
    Escape { offset: usize },
    #[error("unexpected command 0x{0:x}")]
    UnexpectedCommand(u32),
}

/// Errors returned while NAK/ACK round-tripping a protocol command.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("device NAKed: {detail}")]
    Nak { detail: String },
    #[error("authentication required before this operation")]
    Unauthenticated,
    #[error("device reports unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("operation attempted in the wrong session stage")]
    StageMismatch,
}

/// Errors rooted in the host's own resources rather than the wire.
#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("loader/programmer file not found: {0}")]
    MissingLoader(String),
    #[error("authentication material not found: {0}")]
    MissingAuthMaterial(String),
    #[error("partition not found: {0}")]
    PartitionNotFound(String),
    #[error("partition {0} is too small for the requested image")]
    PartitionTooSmall(String),
    #[error("image is larger than the target supports")]
    ImageTooLarge,
    #[error("refusing to touch sensitive partition {0} without an explicit override")]
    SensitivePartitionBlocked(String),
}

/// Errors about the ambient call/session state rather than the device.
#[derive(thiserror::Error, Debug)]
pub enum LogicalError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error("session is not connected")]
    NotConnected,
    #[error("device is already claimed by another session")]
    DeviceBusy,
}

/// File-format parsing errors, one per format in §6.
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("malformed GPT: {0}")]
    BadGpt(String),
    #[error("malformed sparse image: {0}")]
    BadSparse(String),
    #[error("malformed OTA payload: {0}")]
    BadPayload(String),
    #[error("malformed PAC package: {0}")]
    BadPac(String),
    #[error("malformed XML: {0}")]
    BadXml(String),
}

/// The single error type returned across every facade boundary (C12).
#[derive(thiserror::Error, Debug)]
pub enum FlashError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Logical(#[from] LogicalError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed GPT table: {0}")]
    Gpt(#[from] gptman::Error),
    #[error("malformed XML: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, FlashError>;

impl FlashError {
    /// Whether the caller may retry the operation without a full reconnect,
    /// per the propagation policy of §7.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            FlashError::Protocol(_) | FlashError::Logical(LogicalError::Cancelled)
        )
    }
}

/// Raised by Firehose XML parsing when a response is well-formed XML but
/// missing attributes the protocol requires.
pub fn malformed_attrs(attrs: &IndexMap<String, String>) -> FlashError {
    FlashError::Format(FormatError::BadXml(format!("{attrs:?}")))
}
