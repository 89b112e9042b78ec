// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use flashcore::types::{EventStream, FlashEvent, Partition};
use pbr::ProgressBar;
use std::fmt::Write as _;
use std::io::Stdout;

/// Renders a partition table the way `qdl --print-gpt` did, generalized
/// across vendors (SPRD/Fastboot tables carry a synthetic `lun`/GUID of 0).
pub fn format_partition_table(partitions: &[Partition]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<20} {:>4} {:>12} {:>12}", "name", "lun", "start_sector", "num_sectors");
    for p in partitions {
        let _ = writeln!(out, "{:<20} {:>4} {:>12} {:>12}", p.name, p.lun, p.start_sector, p.num_sectors);
    }
    out
}

/// Drains whatever `ProgressChanged`/`StageChanged` events a just-finished
/// facade call left queued and renders them as a `pbr` bar. The call that
/// produced them already blocked to completion, so this replays the queue
/// rather than tracking progress live; events dropped under backpressure
/// (spec §5) simply don't appear here.
pub fn drain_progress(events: &EventStream, label: &str) {
    let mut bar: Option<ProgressBar<Stdout>> = None;
    for event in events.iter() {
        match event {
            FlashEvent::ProgressChanged { done, total } => {
                let bar = bar.get_or_insert_with(|| {
                    let mut b = ProgressBar::new(total);
                    b.message(&format!("{label}: "));
                    b
                });
                bar.set(done);
            }
            FlashEvent::StageChanged(stage) => {
                tracing::debug!(stage, "stage changed");
            }
            FlashEvent::ErrorOccurred { kind, message, recoverable } => {
                tracing::warn!(kind, message, recoverable, "device reported an error");
            }
            _ => {}
        }
    }
    if let Some(mut bar) = bar {
        bar.finish();
    }
}
