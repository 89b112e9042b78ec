// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::Result;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

mod util;

use flashcore::error::TransportError;
use flashcore::facade::{default_chip_defaults, FastbootFacade, QualcommFacade, SprdFacade};
use flashcore::fastboot::script::{self, RebootKind, ScriptOverrides, ScriptTask};
use flashcore::qualcomm::firehose::FirehoseResetMode;
use flashcore::qualcomm::vendor_auth::{DemaciaTokenAuth, DigestSignatureAuth, MiAuth, VendorAuth};
use flashcore::sprd::fdl::FdlOverride;
use flashcore::types::{Backend, ConnectOptions};

#[derive(Debug, Subcommand)]
enum Vendor {
    /// Qualcomm Sahara + Firehose path
    Qualcomm {
        #[command(subcommand)]
        cmd: QualcommCmd,
    },
    /// Spreadtrum/Unisoc BootROM + FDL path
    Sprd {
        #[command(subcommand)]
        cmd: SprdCmd,
    },
    /// Android Fastboot path
    Fastboot {
        #[command(subcommand)]
        cmd: FastbootCmd,
    },
}

#[derive(Debug, Subcommand)]
enum QualcommCmd {
    /// Write a file to a partition by name
    Flash { name: String, file: String },
    /// Read a partition out to <outdir>/<name>
    Dump { name: String, outdir: String },
    Erase { name: String },
    /// Reboot the target (edl/off/system)
    Reset {
        #[arg(default_value = "edl")]
        mode: String,
    },
    /// Read a partition and discard it, for verifying access without writing to disk
    Peek { name: String },
    /// Flash every `program` entry of a rawprogram*.xml/patch*.xml set (§4.5)
    FlashRawprogram {
        #[arg(help = "directory holding rawprogram*.xml (and its referenced image files)")]
        dir: String,
    },
}

#[derive(Debug, Subcommand)]
enum SprdCmd {
    Flash { name: String, file: String },
    Dump { name: String, outdir: String },
    Erase { name: String },
    Reboot,
}

#[derive(Debug, Subcommand)]
enum FastbootCmd {
    Flash { name: String, file: String },
    Erase { name: String },
    /// Run a flash script (see spec §4.11) end to end
    Script { path: String },
    /// normal/bootloader/fastboot/recovery
    Reboot {
        #[arg(default_value = "normal")]
        mode: String,
    },
    /// Apply an OTA payload.bin (or the .zip it ships in) (§4.6/§4.11)
    FlashPayload {
        file: String,
        #[arg(long, help = "restrict the run to a single partition")]
        partition: Option<String>,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, value_name = "usb|serial", default_value = "usb")]
    backend: String,

    #[arg(short, long, help = "E.g. COM4 on Windows, or /dev/ttyUSB0")]
    dev_path: Option<String>,

    #[arg(long)]
    serial_no: Option<String>,

    #[arg(short, long, value_name = "FILE", help = "Qualcomm Sahara programmer (MBN) image")]
    loader_path: Option<String>,

    #[arg(long)]
    sector_size: Option<usize>,

    /// Accept the requested operation but never touch real storage.
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Expand Android sparse images on the host before streaming instead of
    /// forwarding them as a device-sparse passthrough (§4.8).
    #[arg(long, default_value = "false")]
    host_expand_sparse: bool,

    #[arg(long, value_name = "digest-signature|miauth|demacia", help = "qualcomm only: vendor auth strategy to try lazily on an auth NAK")]
    auth_strategy: Option<String>,

    #[arg(long, help = "demacia auth only: scratch partition the token is written to")]
    demacia_scratch_partition: Option<String>,

    #[arg(long, value_name = "FILE", help = "sprd only: PAC firmware package to pull FDL1/FDL2 from")]
    pac_path: Option<String>,

    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    vendor: Vendor,
}

fn connect_options(args: &Args) -> Result<ConnectOptions> {
    Ok(ConnectOptions {
        backend: Backend::from_str(&args.backend).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        dev_path: args.dev_path.clone(),
        serial_no: args.serial_no.clone(),
        sector_size: args.sector_size,
        bypass_storage: args.dry_run,
        skip_hello_wait: false,
    })
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    println!("{} {}", env!("CARGO_PKG_NAME").green(), env!("CARGO_PKG_VERSION").yellow());

    match &args.vendor {
        Vendor::Qualcomm { cmd } => run_qualcomm(&args, cmd),
        Vendor::Sprd { cmd } => run_sprd(&args, cmd),
        Vendor::Fastboot { cmd } => run_fastboot(&args, cmd),
    }
}

fn build_auth(args: &Args) -> Result<Option<Box<dyn VendorAuth>>> {
    let Some(strategy) = args.auth_strategy.as_deref() else { return Ok(None) };
    let auth: Box<dyn VendorAuth> = match strategy {
        "digest-signature" => Box::new(DigestSignatureAuth),
        "miauth" => Box::new(MiAuth::new(Vec::new())),
        "demacia" => {
            let scratch_partition = args
                .demacia_scratch_partition
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--demacia-scratch-partition is required with --auth-strategy demacia"))?;
            Box::new(DemaciaTokenAuth { scratch_partition })
        }
        other => return Err(anyhow::anyhow!("unknown --auth-strategy '{other}'")),
    };
    Ok(Some(auth))
}

fn run_qualcomm(args: &Args, cmd: &QualcommCmd) -> Result<()> {
    let loader_path = args
        .loader_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--loader-path is required on the qualcomm path"))?;
    let loader = fs::read(loader_path).map_err(|e| anyhow::anyhow!("couldn't open programmer image: {e}"))?;
    let programmer_dir = Path::new(loader_path).parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let mut facade = QualcommFacade::new().with_programmer_dir(programmer_dir);
    if let Some(auth) = build_auth(args)? {
        facade = facade.with_auth(auth);
    }
    facade.set_host_expand_sparse(args.host_expand_sparse);

    let opts = connect_options(args)?;
    facade.connect(&opts, loader).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let table = facade.read_partition_table(0).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("{}", util::format_partition_table(&table).bright_black());

    let result = match cmd {
        QualcommCmd::Flash { name, file } => {
            let mut f = File::open(file)?;
            facade.write_partition(name, &mut f, file.ends_with(".sparse"))
        }
        QualcommCmd::Dump { name, outdir } => {
            fs::create_dir_all(outdir)?;
            let mut out = File::create(Path::new(outdir).join(name))?;
            facade.read_partition(name, &mut out)
        }
        QualcommCmd::Erase { name } => facade.erase_partition(name),
        QualcommCmd::Reset { mode } => {
            let mode = FirehoseResetMode::from_str(mode).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            facade.reboot(mode)
        }
        QualcommCmd::Peek { name } => facade.read_partition(name, &mut std::io::sink()),
        QualcommCmd::FlashRawprogram { dir } => run_rawprogram_dir(&mut facade, dir),
    };
    util::drain_progress(facade.events(), "qualcomm");
    facade.disconnect().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    result.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("{}", "done".bright_green());
    Ok(())
}

/// Scans `dir` for `rawprogram*.xml`, flashing every non-sensitive `program`
/// entry that names a file (§4.5). Sensitive or empty-filename entries are
/// skipped, as rawprogram descriptors expect the host to leave those sector
/// ranges alone rather than auto-flash them.
fn run_rawprogram_dir(facade: &mut QualcommFacade, dir: &str) -> flashcore::Result<()> {
    let dir = Path::new(dir);
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(TransportError::IoFault)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("rawprogram") && n.ends_with(".xml"))
                .unwrap_or(false)
        })
        .collect();
    entries.sort();

    for xml_path in entries {
        let xml_bytes = fs::read(&xml_path).map_err(TransportError::IoFault)?;
        let (tasks, _patches) = flashcore::qualcomm::rawprogram::parse_rawprogram(&xml_bytes, dir)?;
        for task in tasks {
            if task.is_sensitive {
                tracing::info!(label = %task.label, "skipping sensitive partition in rawprogram batch");
                continue;
            }
            let Some(file_path) = &task.file_path else {
                tracing::debug!(label = %task.label, "rawprogram entry reserves sectors but names no file, skipping");
                continue;
            };
            let mut f = fs::File::open(file_path).map_err(TransportError::IoFault)?;
            facade.write_partition(&task.label, &mut f, task.sparse)?;
        }
    }
    Ok(())
}

fn run_sprd(args: &Args, cmd: &SprdCmd) -> Result<()> {
    let defaults = default_chip_defaults(0);
    let mut facade = SprdFacade::new(&defaults);
    let opts = connect_options(args)?;
    let pac_bytes = args
        .pac_path
        .as_ref()
        .map(|p| fs::read(p).map_err(|e| anyhow::anyhow!("couldn't read --pac-path: {e}")))
        .transpose()?;
    facade
        .connect(&opts, &defaults, FdlOverride::default(), FdlOverride::default(), None, pac_bytes.as_deref())
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let table = facade.read_partition_table().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("{}", util::format_partition_table(&table).bright_black());

    let result = match cmd {
        SprdCmd::Flash { name, file } => {
            let size = fs::metadata(file)?.len();
            let mut f = File::open(file)?;
            facade.write_partition(name, &mut f, size)
        }
        SprdCmd::Dump { name, outdir } => {
            fs::create_dir_all(outdir)?;
            let mut out = File::create(Path::new(outdir).join(name))?;
            facade.read_partition(name, &mut out)
        }
        SprdCmd::Erase { name } => facade.erase_partition(name),
        SprdCmd::Reboot => facade.reboot(),
    };
    util::drain_progress(facade.events(), "sprd");
    facade.disconnect().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    result.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("{}", "done".bright_green());
    Ok(())
}

fn run_fastboot(args: &Args, cmd: &FastbootCmd) -> Result<()> {
    let mut facade = FastbootFacade::new(args.serial_no.clone().unwrap_or_default());
    let opts = connect_options(args)?;
    facade.connect(&opts).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let result = match cmd {
        FastbootCmd::Flash { name, file } => {
            let size = fs::metadata(file)?.len();
            let mut f = File::open(file)?;
            facade.write_partition(name, &mut f, size)
        }
        FastbootCmd::Erase { name } => facade.erase_partition(name),
        FastbootCmd::Script { path } => run_script(&mut facade, path),
        FastbootCmd::Reboot { mode } => {
            let kind = match mode.as_str() {
                "bootloader" => RebootKind::Bootloader,
                "fastboot" => RebootKind::Fastboot,
                "recovery" => RebootKind::Recovery,
                _ => RebootKind::Normal,
            };
            facade.reboot(kind)
        }
        FastbootCmd::FlashPayload { file, partition } => run_flash_payload(&mut facade, file, partition.as_deref()),
    };
    util::drain_progress(facade.events(), "fastboot");
    facade.disconnect().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    result.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("{}", "done".bright_green());
    Ok(())
}

/// Applies an OTA `payload.bin`, pulling it out of its `.zip` envelope first
/// when `file` ends in `.zip` (§4.6/§4.11).
fn run_flash_payload(facade: &mut FastbootFacade, file: &str, partition: Option<&str>) -> flashcore::Result<()> {
    let raw = std::fs::read(file).map_err(TransportError::IoFault)?;
    let payload_bytes =
        if file.ends_with(".zip") { flashcore::payload::extract_payload_from_zip(&raw)? } else { raw };
    facade.flash_payload(&payload_bytes, partition)
}

fn run_script(facade: &mut FastbootFacade, path: &str) -> flashcore::Result<()> {
    let text = std::fs::read_to_string(path).map_err(TransportError::IoFault)?;
    let base_dir = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
    let overrides = script::detect_overrides(Path::new(path));
    let tasks = script::parse_script(&text, base_dir)?;

    for task in &tasks {
        run_task(facade, task, overrides)?;
    }
    Ok(())
}

fn run_task(facade: &mut FastbootFacade, task: &ScriptTask, overrides: ScriptOverrides) -> flashcore::Result<()> {
    match task {
        ScriptTask::Flash { partition, file } => {
            if overrides.keep_data && partition == "userdata" {
                tracing::info!("skipping userdata flash: keep-data override set");
                return Ok(());
            }
            let size = std::fs::metadata(file).map_err(TransportError::IoFault)?.len();
            let mut f = std::fs::File::open(file).map_err(TransportError::IoFault)?;
            facade.write_partition(partition, &mut f, size)
        }
        ScriptTask::Erase { partition } => facade.erase_partition(partition),
        ScriptTask::Reboot(kind) => facade.reboot(*kind),
        ScriptTask::SetActive { slot } => facade.set_active_slot(slot),
        ScriptTask::GetVar { name } => {
            let value = facade.getvar(name)?;
            println!("{name}: {value}");
            Ok(())
        }
        ScriptTask::Sleep { millis } => {
            std::thread::sleep(std::time::Duration::from_millis(*millis));
            Ok(())
        }
        ScriptTask::IfPartitionExists { partition, then } => {
            if facade.partition_exists(partition)? {
                run_task(facade, then, overrides)
            } else {
                tracing::info!(partition, "condition false, skipping nested task");
                Ok(())
            }
        }
    }
}
