//! ecuflash - firmware update over UDS against a simulated bootloader
//!
//! Runs the tester and the ECU in one process, joined by the loopback link,
//! and drives both on a 1 ms tick until the job finishes.
//!
//! # Usage
//!
//! ```bash
//! ecuflash --image app.bin
//! ecuflash --image app.bin --config config/ecuflash.toml --output flashed.bin --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ecuflash_client::{FirmwareImage, FlashOrchestrator, JobReport};
use ecuflash_ecu::{EcuServer, FileSinkProvider};
use ecuflash_proto::{Clock, LoopbackLink, MonotonicClock};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "ecuflash")]
#[command(about = "Flash a firmware image into a simulated UDS bootloader")]
struct Args {
    /// Firmware image to flash
    #[arg(short, long)]
    image: PathBuf,

    /// Configuration file path (TOML with [ecu] and [client] tables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where the ECU writes the received image (overrides ecu.transfer.output_path)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the job report as JSON
    #[arg(long)]
    json: bool,

    /// Emit log lines as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };
    if let Some(output) = &args.output {
        config.ecu.transfer.output_path = output.clone();
    }

    let image = FirmwareImage::load(&args.image)
        .with_context(|| format!("Cannot flash {}", args.image.display()))?;

    let report = run(config, image).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    match report.abort_reason() {
        None => Ok(()),
        Some(reason) => anyhow::bail!("Flash failed: {}", reason),
    }
}

fn init_tracing(args: &Args) {
    let default_filter = if args.verbose {
        "ecuflash=debug,ecuflash_client=debug,ecuflash_ecu=debug,ecuflash_proto=info"
    } else {
        "ecuflash=info,ecuflash_client=info,ecuflash_ecu=info,ecuflash_proto=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Drive ECU and tester until the job ends or Ctrl+C
async fn run(config: AppConfig, image: FirmwareImage) -> Result<JobReport> {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let (tester_end, ecu_end) = LoopbackLink::pair();

    let sinks = FileSinkProvider::new(config.ecu.transfer.output_path.clone());
    let mut ecu = EcuServer::new(config.ecu, clock.clone(), Box::new(sinks));
    let mut flasher = FlashOrchestrator::new(config.client, clock);
    flasher.start(image)?;

    let mut interval = tokio::time::interval(Duration::from_millis(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!(step = ?flasher.step(), "Interrupted");
                anyhow::bail!("Interrupted at {:?}", flasher.step());
            }
            _ = interval.tick() => {
                ecu.poll(&ecu_end);
                flasher.tick(&tester_end);
                if flasher.is_done() {
                    break;
                }
            }
        }
    }

    flasher
        .report()
        .cloned()
        .context("Job finished without a report")
}

fn print_summary(report: &JobReport) {
    let status = if report.is_completed() {
        "completed".to_string()
    } else {
        report
            .abort_reason()
            .map(|reason| format!("aborted: {}", reason))
            .unwrap_or_default()
    };
    println!("Flash {}", status);
    if let Some(version) = &report.software_version {
        println!("  ECU software version: {}", version);
    }
    println!(
        "  Image:  {} bytes, CRC 0x{:08X}",
        report.image_len, report.image_crc
    );
    println!(
        "  Sent:   {} bytes in {} blocks",
        report.bytes_sent, report.blocks_sent
    );
    println!("  Time:   {} ms", report.elapsed_ms);
}
