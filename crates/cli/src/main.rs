// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info};

use dlpatch_core::sim::{LinearMemory, RecordingCache, SimBus};
use dlpatch_core::{Boot, PatchError, PatchReport, Platform, Sequencer};

const EXIT_HANDOFF: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_HALTED: u8 = 3;

const RESULT_SCHEMA_VERSION: &str = "1.0";

fn parse_u32_addr(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value '{}': {}", s, e))
    } else {
        u32::from_str(trimmed).map_err(|e| format!("Invalid value '{}': {}", s, e))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Preloader download handler patcher", long_about = None)]
struct Cli {
    /// Enable debug logging of every search and write
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the patch sequence against a raw memory dump (dry run).
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Raw dump of the preloader code region
    #[arg(short, long)]
    image: PathBuf,

    /// Platform profile (YAML). Defaults to the built-in MT6572 layout.
    #[arg(short, long)]
    platform: Option<PathBuf>,

    /// Address the first byte of the dump is mapped at
    #[arg(long, value_parser = parse_u32_addr)]
    base: Option<u32>,

    /// Value held in the boot argument cell when the handler is re-entered
    #[arg(long, value_parser = parse_u32_addr, default_value = "0")]
    boot_arg: u32,

    /// Write the patched dump here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print a machine-readable summary instead of the console transcript
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum RunStatus {
    Handoff,
    Halted,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    result_schema_version: &'static str,
    status: RunStatus,
    platform: Platform,
    transcript: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    handoff: Option<HandoffSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<PatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HandoffSummary {
    entry: u32,
    target: u32,
    arg0: u32,
    arg1: u32,
}

impl RunSummary {
    fn new(platform: Platform, transcript: String, result: &Result<Boot, PatchError>) -> Self {
        match result {
            Ok(boot) => Self {
                result_schema_version: RESULT_SCHEMA_VERSION,
                status: RunStatus::Handoff,
                platform,
                transcript,
                handoff: Some(HandoffSummary {
                    entry: boot.handoff.entry,
                    target: boot.handoff.target(),
                    arg0: boot.handoff.arg0,
                    arg1: boot.handoff.arg1,
                }),
                report: Some(boot.report),
                error: None,
            },
            Err(e) => Self {
                result_schema_version: RESULT_SCHEMA_VERSION,
                status: RunStatus::Halted,
                platform,
                transcript,
                handoff: None,
                report: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing with appropriate level based on --trace flag.
    // Logs go to stderr so stdout stays a clean transcript or JSON document.
    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> ExitCode {
    let (platform, bus) = match prepare(&args) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    info!(
        "Scanning {:#x}..{:#x} for usbdl_handler",
        platform.code_base, platform.code_end
    );
    let mut sequencer = Sequencer::new(platform, bus, RecordingCache::default(), String::new());
    let result = sequencer.run();
    let (bus, cache, transcript) = sequencer.into_parts();

    if let Ok(boot) = &result {
        info!(
            "{} of 3 stages patched, {} cache lines maintained, handing off to {:#x}",
            boot.report.patched_count(),
            cache.lines().len(),
            boot.handoff.target()
        );
    }

    if let Some(path) = &args.output {
        if let Err(e) = std::fs::write(path, &bus.code.data)
            .with_context(|| format!("Failed to write patched image to {:?}", path))
        {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        info!("Patched image written to {:?}", path);
    }

    if args.json {
        let summary = RunSummary::new(platform, transcript, &result);
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize run summary: {}", e);
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        }
    } else {
        print!("{}", transcript);
    }

    match result {
        Ok(_) => ExitCode::from(EXIT_HANDOFF),
        Err(e) => {
            error!("Halted: {}", e);
            ExitCode::from(EXIT_HALTED)
        }
    }
}

/// Resolves the platform and maps the dump into a simulated bus.
///
/// The scanned range is the platform's code range moved to `--base` and
/// clipped to the size of the dump.
fn prepare(args: &RunArgs) -> Result<(Platform, SimBus)> {
    let mut platform = match &args.platform {
        Some(path) => dlpatch_config::load_platform(path)?,
        None => Platform::MT6572,
    };

    let image = std::fs::read(&args.image)
        .with_context(|| format!("Failed to read image {:?}", args.image))?;
    if image.is_empty() {
        anyhow::bail!("Image {:?} is empty", args.image);
    }
    if image.len() % 2 != 0 {
        anyhow::bail!(
            "Image {:?} has odd length {}; code is fetched in halfwords",
            args.image,
            image.len()
        );
    }

    let base = args.base.unwrap_or(platform.code_base);
    if base & 1 != 0 {
        anyhow::bail!("Base address {:#x} is not halfword aligned", base);
    }
    let mapped_end = base as u64 + image.len() as u64;
    if mapped_end > u32::MAX as u64 {
        anyhow::bail!(
            "Image of {} bytes at {:#x} does not fit the address space",
            image.len(),
            base
        );
    }

    let size = platform.code_end - platform.code_base;
    platform.code_base = base;
    platform.code_end = base + size.min(image.len() as u32);
    if (image.len() as u32) < size {
        info!(
            "Image is {:#x} bytes, smaller than the {:#x} byte code region; scanning the image only",
            image.len(),
            size
        );
    }

    let bus = SimBus::new(LinearMemory::from_bytes(base, image))
        .with_boot_arg(platform.boot_arg_cell, args.boot_arg);
    Ok((platform, bus))
}
