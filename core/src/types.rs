// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Shared data model: partition records, sessions, events, cancellation.
//!
//! See spec §3 (Data model) and §5 (Concurrency & resource model).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

/// GUID Partition Table entry, vendor-neutral (§3 "Partition record").
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub lun: u8,
    pub name: String,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub sector_size: u32,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub attributes: u64,
    pub entry_index: i32,
}

impl Partition {
    pub fn size_bytes(&self) -> u64 {
        self.num_sectors * self.sector_size as u64
    }
}

/// Connection backend selector, generalized across all three vendor paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Serial,
    Usb,
}

impl std::str::FromStr for Backend {
    type Err = crate::error::FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(Backend::Serial),
            "usb" => Ok(Backend::Usb),
            other => Err(crate::error::FlashError::Resource(
                crate::error::ResourceError::MissingLoader(format!(
                    "unknown backend '{other}', expected serial/usb"
                )),
            )),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Usb
    }
}

/// Options accepted by every facade's `connect`. Serializable so a host
/// application can load them from its own config format (§SPEC_FULL.md C).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectOptions {
    pub backend: Backend,
    pub dev_path: Option<String>,
    pub serial_no: Option<String>,
    pub sector_size: Option<usize>,
    pub bypass_storage: bool,
    #[serde(default)]
    pub skip_hello_wait: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            backend: Backend::default(),
            dev_path: None,
            serial_no: None,
            sector_size: None,
            bypass_storage: false,
            skip_hello_wait: false,
        }
    }
}

// Backend doesn't derive Serialize/Deserialize above via proc-macro directly
// because it lives in this module; implement by hand against the string form.
impl serde::Serialize for Backend {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(match self {
            Backend::Serial => "serial",
            Backend::Usb => "usb",
        })
    }
}

impl<'de> serde::Deserialize<'de> for Backend {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A cooperative cancellation signal, checked at least every 50ms inside
/// transport calls per §4.1, and at every chunk boundary per §5.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Events the facade publishes to a consumer-supplied sink (§6, §9: engines
/// publish events to a consumer sink, never hold a back-reference to a UI).
#[derive(Debug, Clone)]
pub enum FlashEvent {
    ProgressChanged { done: u64, total: u64 },
    StageChanged(String),
    DeviceConnected,
    DeviceDisconnected,
    PartitionTableLoaded(usize),
    ErrorOccurred {
        kind: String,
        message: String,
        recoverable: bool,
    },
}

/// Bounded event queue (128 entries, §5) so a slow consumer can never block
/// the engine thread; a full queue drops the event and is observable once
/// via `EventSink::backpressured`.
pub struct EventSink {
    tx: SyncSender<FlashEvent>,
    dropped: Arc<AtomicBool>,
}

pub struct EventStream {
    rx: Receiver<FlashEvent>,
}

const EVENT_QUEUE_DEPTH: usize = 128;

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = sync_channel(EVENT_QUEUE_DEPTH);
    (
        EventSink {
            tx,
            dropped: Arc::new(AtomicBool::new(false)),
        },
        EventStream { rx },
    )
}

impl EventSink {
    pub fn emit(&self, event: FlashEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.store(true, Ordering::Relaxed);
                tracing::warn!("event queue full, dropping event (EventBackpressure)");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("event stream has no listener");
            }
        }
    }

    /// Whether an event was ever dropped for backpressure since creation.
    pub fn backpressured(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventStream {
    pub fn try_recv(&self) -> Option<FlashEvent> {
        self.rx.try_recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = FlashEvent> + '_ {
        self.rx.try_iter()
    }
}

/// Outcome of one item in a batch operation (§7: batch ops continue past
/// individual failures and return a per-item outcome list).
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub label: String,
    pub result: crate::error::Result<T>,
}
