// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! GPT parsing (C5), wrapping `gptman` the way the teacher's `util.rs`
//! does, but generalized to any caller-supplied LUN/sector size (§4.5: GPT
//! itself does not encode sector size — it comes from Firehose's
//! `getstorageinfo`/`configure` reply). `gptman::GPT::read_from` already
//! falls back to the backup header at the last LBA when the primary header
//! or its entries fail CRC32 validation.

use crate::error::{FormatError, Result};
use crate::types::Partition;
use gptman::{GPT, GPTPartitionEntry};
use std::io::{Read, Seek};

/// Parses a protective-MBR + primary/backup GPT from `reader` at the given
/// LUN, tagging every returned partition with it.
pub fn read_gpt<R: Read + Seek>(reader: &mut R, lun: u8, sector_size: u64) -> Result<Vec<Partition>> {
    let gpt = GPT::read_from(reader, sector_size).map_err(|e| FormatError::BadGpt(e.to_string()))?;
    Ok(gpt
        .iter()
        .filter(|(_, p)| !p.is_unused())
        .map(|(idx, p)| to_partition(lun, idx as i32, p, gpt.sector_size as u32))
        .collect())
}

fn to_partition(lun: u8, entry_index: i32, entry: &GPTPartitionEntry, sector_size: u32) -> Partition {
    let num_sectors = entry.ending_lba.saturating_sub(entry.starting_lba) + 1;
    Partition {
        lun,
        name: entry.partition_name.to_string(),
        start_sector: entry.starting_lba,
        num_sectors,
        sector_size,
        type_guid: entry.partition_type_guid,
        unique_guid: entry.unique_partition_guid,
        attributes: entry.attribute_bits,
        entry_index,
    }
}

/// Re-serializes a parsed table with the same sector size it was read with;
/// backs the GPT round-trip invariant (§8 property 1).
pub fn write_gpt<W: std::io::Write + Seek>(writer: &mut W, gpt: &GPT) -> Result<()> {
    gpt.write_into(writer).map_err(|e| FormatError::BadGpt(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_read_round_trips_a_partition() {
        let sector_size = 512u64;
        let mut disk = Cursor::new(vec![0u8; 10 * 1024 * 1024]);
        let mut gpt = GPT::new_from(&mut disk, sector_size, [0x11; 16]).unwrap();
        let first = gpt.header.first_usable_lba;
        gpt[1] = GPTPartitionEntry {
            partition_type_guid: [0x22; 16],
            unique_partition_guid: [0x33; 16],
            starting_lba: first,
            ending_lba: first + 100,
            attribute_bits: 0,
            partition_name: "boot_a".into(),
        };

        write_gpt(&mut disk, &gpt).unwrap();
        disk.rewind().unwrap();
        let partitions = read_gpt(&mut disk, 0, sector_size).unwrap();

        let boot = partitions.iter().find(|p| p.name == "boot_a").expect("boot_a survives the round trip");
        assert_eq!(boot.start_sector, first);
        assert_eq!(boot.num_sectors, 101);
        assert_eq!(boot.type_guid, [0x22; 16]);
    }

    #[test]
    fn partition_size_bytes_matches_sectors_times_sector_size() {
        let p = Partition {
            lun: 0,
            name: "boot_a".into(),
            start_sector: 100,
            num_sectors: 2048,
            sector_size: 4096,
            type_guid: [0; 16],
            unique_guid: [0; 16],
            attributes: 0,
            entry_index: 1,
        };
        assert_eq!(p.size_bytes(), 2048 * 4096);
    }
}
