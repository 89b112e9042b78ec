// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Flash-script orchestrator (§4.11): a line-based dialect is parsed into a
//! list of `ScriptTask`s whose semantics map onto `FastbootEngine` calls.

use crate::error::{FormatError, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptTask {
    Flash { partition: String, file: PathBuf },
    Erase { partition: String },
    Reboot(RebootKind),
    SetActive { slot: String },
    GetVar { name: String },
    Sleep { millis: u64 },
    IfPartitionExists { partition: String, then: Box<ScriptTask> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootKind {
    Normal,
    Bootloader,
    Fastboot,
    Recovery,
}

/// Filename-convention overrides a caller may honour when executing a
/// parsed script (§4.11 "Keep-data and lock-BL variants").
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptOverrides {
    pub keep_data: bool,
    pub skip_lock: bool,
}

/// Inspects a flashing image filename for the `except_storage` / `_lock`
/// conventions that flag userdata-preserving or bootloader-locking scripts.
pub fn detect_overrides(script_path: &Path) -> ScriptOverrides {
    let stem = script_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    ScriptOverrides {
        keep_data: stem.contains("except_storage"),
        skip_lock: stem.contains("_lock"),
    }
}

/// Parses a flash script into an ordered task list. Lines are whitespace
/// separated; a leading `#` marks a comment. Relative file paths resolve
/// against `base_dir` (the script's own directory).
pub fn parse_script(text: &str, base_dir: &Path) -> Result<Vec<ScriptTask>> {
    let mut tasks = Vec::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let task = parse_line(line, base_dir).map_err(|msg| {
            FormatError::BadXml(format!("script line {}: {msg}", lineno + 1))
        })?;
        tasks.push(task);
    }
    Ok(tasks)
}

fn parse_line(line: &str, base_dir: &Path) -> std::result::Result<ScriptTask, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["flash", partition, file] => Ok(ScriptTask::Flash {
            partition: partition.to_string(),
            file: resolve_path(base_dir, file),
        }),
        ["erase", partition] => Ok(ScriptTask::Erase { partition: partition.to_string() }),
        ["reboot"] => Ok(ScriptTask::Reboot(RebootKind::Normal)),
        ["reboot-bootloader"] => Ok(ScriptTask::Reboot(RebootKind::Bootloader)),
        ["reboot-fastboot"] => Ok(ScriptTask::Reboot(RebootKind::Fastboot)),
        ["reboot-recovery"] => Ok(ScriptTask::Reboot(RebootKind::Recovery)),
        ["set_active", slot] => Ok(ScriptTask::SetActive { slot: slot.to_string() }),
        ["getvar", name] => Ok(ScriptTask::GetVar { name: name.to_string() }),
        ["sleep", millis] => {
            let millis = millis.parse::<u64>().map_err(|_| format!("bad sleep duration '{millis}'"))?;
            Ok(ScriptTask::Sleep { millis })
        }
        ["if", partition, "exists", rest @ ..] if !rest.is_empty() => {
            let inner = parse_line(&rest.join(" "), base_dir)?;
            Ok(ScriptTask::IfPartitionExists { partition: partition.to_string(), then: Box::new(inner) })
        }
        _ => Err(format!("unrecognised script line '{line}'")),
    }
}

fn resolve_path(base_dir: &Path, file: &str) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flash_and_reboot_lines() {
        let script = "# comment\nflash boot boot.img\nreboot-bootloader\n";
        let tasks = parse_script(script, Path::new("/images")).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0],
            ScriptTask::Flash { partition: "boot".to_string(), file: PathBuf::from("/images/boot.img") }
        );
        assert_eq!(tasks[1], ScriptTask::Reboot(RebootKind::Bootloader));
    }

    #[test]
    fn parses_conditional_erase() {
        let tasks = parse_script("if persist exists erase persist", Path::new(".")).unwrap();
        assert_eq!(
            tasks[0],
            ScriptTask::IfPartitionExists {
                partition: "persist".to_string(),
                then: Box::new(ScriptTask::Erase { partition: "persist".to_string() }),
            }
        );
    }

    #[test]
    fn detects_keep_data_and_lock_conventions() {
        let ov = detect_overrides(Path::new("flash_except_storage_lock.txt"));
        assert!(ov.keep_data);
        assert!(ov.skip_lock);
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(parse_script("bogus foo bar", Path::new(".")).is_err());
    }
}
