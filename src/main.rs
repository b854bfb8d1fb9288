// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the boot snapshot recorder.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the boot snapshot recorder.

use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgGroup, Parser};
use env_logger::Env;
use log::{info, LevelFilter};

use bootsnap::{
    analyze, load_config, AnalysisRequest, BootRecorder, ConfigOverrides, RecorderConfig,
    RecorderError, SessionId, SnapshotStore,
};

/// Boot snapshot recorder command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "Record and analyse FreeRTOS boot sequences through a QEMU GDB stub",
    long_about = None
)]
#[command(group(ArgGroup::new("mode").required(true).args(["init_db", "record_boot", "analyze"])))]
struct Cli {
    /// Create the snapshot database schema and exit.
    #[arg(long)]
    init_db: bool,

    /// Record a boot session from the GDB stub.
    #[arg(long)]
    record_boot: bool,

    /// Print an analysis of recorded sessions.
    #[arg(long)]
    analyze: bool,

    /// Snapshot database path.
    #[arg(long, value_name = "FILE")]
    db_path: Option<PathBuf>,

    /// Recorder configuration TOML.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// GDB stub host.
    #[arg(long)]
    gdb_host: Option<String>,

    /// GDB stub port.
    #[arg(long)]
    gdb_port: Option<u16>,

    /// Instruction budget for the recording.
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Receive deadline per stub request in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Reject stub replies with a bad checksum.
    #[arg(long)]
    verify_checksums: bool,

    /// Session description.
    #[arg(long)]
    description: Option<String>,

    /// Session to analyse; sessions are listed when omitted.
    #[arg(long, requires = "analyze")]
    session: Option<i64>,

    /// Compare captures of one region label across the session.
    #[arg(long, value_name = "REGION", requires = "analyze")]
    compare_region: Option<String>,

    /// Print pattern coverage per region over time.
    #[arg(long, requires = "analyze")]
    memory_evolution: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                trimmed
                    .parse::<T>()
                    .map(Some)
                    .map_err(|err| anyhow!("invalid {key} value '{trimmed}': {err}"))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed to read {key}: {err}")),
    }
}

fn env_override<T>(cli_value: Option<T>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if cli_value.is_some() {
        return Ok(cli_value);
    }
    parse_env(key)
}

fn resolve_config(cli: &Cli) -> Result<RecorderConfig> {
    let base = match &cli.config {
        Some(path) => load_config(path)?,
        None => RecorderConfig::default(),
    };
    let overrides = ConfigOverrides {
        gdb_host: env_override(cli.gdb_host.clone(), "BOOTSNAP_GDB_HOST")?,
        gdb_port: env_override(cli.gdb_port, "BOOTSNAP_GDB_PORT")?,
        timeout_ms: cli.timeout_ms,
        verify_checksums: cli.verify_checksums.then_some(true),
        db_path: env_override(cli.db_path.clone(), "BOOTSNAP_DB_PATH")?,
        max_instructions: cli.max_instructions,
        description: cli.description.clone(),
    };
    base.with_overrides(&overrides)
}

fn init_db(config: &RecorderConfig) -> Result<()> {
    let path = &config.store.path;
    let mut store = SnapshotStore::open(path, config.store_options())
        .with_context(|| format!("failed to initialise database {}", path.display()))?;
    store.close()?;
    println!("Initialised snapshot database {}", path.display());
    Ok(())
}

fn record_boot(config: RecorderConfig) -> Result<()> {
    let path = config.store.path.clone();
    let store = SnapshotStore::open(&path, config.store_options())
        .with_context(|| format!("failed to open database {}", path.display()))?;
    let stub = config.stub_client();
    let endpoint = stub.endpoint();
    let mut recorder = BootRecorder::new(stub, store, config);

    let cancel = recorder.cancel_flag();
    ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    info!("recording boot from GDB stub at {endpoint}");
    let summary = match recorder.run() {
        Ok(summary) => summary,
        Err(RecorderError::StubUnavailable) => {
            bail!("failed to connect to GDB stub at {endpoint}")
        }
        Err(err) => return Err(err).context("boot recording failed"),
    };

    let session = summary
        .session
        .map_or_else(|| "-".to_owned(), |id| id.to_string());
    println!("Recording complete for session {session}");
    println!("  Stop reason: {:?}", summary.stop);
    println!("  Instructions: {}", summary.instructions);
    println!("  Snapshots: {}", summary.snapshots);
    println!(
        "  Duration: {:.2}s ({:.1} instructions/s)",
        summary.elapsed.as_secs_f64(),
        summary.instructions_per_second()
    );
    println!("  Database: {}", path.display());
    Ok(())
}

fn run_analysis(cli: &Cli, config: &RecorderConfig) -> Result<()> {
    let path = &config.store.path;
    if !path.exists() {
        bail!("database not found: {}", path.display());
    }
    let store = SnapshotStore::open(path, config.store_options())
        .with_context(|| format!("failed to open database {}", path.display()))?;
    let request = AnalysisRequest {
        session: cli.session.map(SessionId),
        compare_region: cli.compare_region.clone(),
        memory_evolution: cli.memory_evolution,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    analyze(&store, &request, &mut out)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = resolve_config(&cli)?;

    if cli.init_db {
        init_db(&config)
    } else if cli.record_boot {
        record_boot(config)
    } else {
        run_analysis(&cli, &config)
    }
}
