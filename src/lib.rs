pub mod audio;
pub mod bridge;
pub mod cli;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod protocol;
pub mod settings;
pub mod store;
pub mod sync;
pub mod utils;

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use audio::{ClipLibrary, CuePlayerHandle};
use bridge::Bridge;
use cli::{Cli, Command};
use device::{list_candidates, select_port, SerialConnector};
use models::StatusRecord;
use settings::BridgeSettings;
use store::{FirebaseStore, MemoryStore, StatusStore};

const ENABLE_LOGS: bool = true;

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let level = if settings::debug_requested() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log_error!("Failed to start the async runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    match cli.command() {
        Command::Run => run_bridge(&cli).await,
        Command::ListPorts => list_ports(),
        Command::StartRun => start_run(&cli).await,
    }
}

fn load_settings(cli: &Cli) -> Result<BridgeSettings> {
    // A dry run never talks to the database, so the file is optional.
    let settings = if cli.dry_run {
        BridgeSettings::load_or_default(&cli.config)?
    } else {
        BridgeSettings::load(&cli.config)?
    };

    let mut settings = settings.with_env_overrides();
    if let Some(port) = &cli.port {
        settings.serial.port = Some(port.clone());
    }
    Ok(settings)
}

fn open_store(settings: &BridgeSettings, dry_run: bool) -> Result<Arc<dyn StatusStore>> {
    if dry_run {
        log_warn!("Dry run: the status record lives in memory and starts a run immediately");
        let record = StatusRecord::run_start(Utc::now().timestamp_millis());
        return Ok(Arc::new(MemoryStore::with_record(record)));
    }

    let credentials = settings.remote()?;
    let store = FirebaseStore::new(&credentials, settings.stream_retry_policy())
        .context("failed to set up the database client")?;
    log_info!("Status record at {}", store.node_url());
    Ok(Arc::new(store))
}

async fn run_bridge(cli: &Cli) -> Result<()> {
    log_info!("═══════════════════════════════════════════");
    log_info!("  Potion bridge starting up...");
    log_info!("═══════════════════════════════════════════");

    let settings = load_settings(cli)?;
    let store = open_store(&settings, cli.dry_run)?;

    let clips = ClipLibrary::from_settings(&settings.sounds);
    for missing in clips.missing() {
        log_warn!("Sound clip missing: {}", missing.display());
    }
    let cues = CuePlayerHandle::new(clips, settings.cue_gap());

    let connector = Box::new(SerialConnector::new(settings.serial.clone()));
    let mut bridge = Bridge::new(&settings, store, connector, cues);
    bridge
        .start()
        .context("could not open the controller's serial port")?;

    log_info!("Tap \"Start\" in the mobile app to begin a run");
    log_info!("Press Ctrl+C to exit");
    log_info!("───────────────────────────────────────────");

    bridge
        .run(shutdown_signal())
        .await
        .context("bridge stopped")?;

    log_info!("Bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log_error!("Could not listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
}

fn list_ports() -> Result<()> {
    let candidates = list_candidates()?;
    if candidates.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for candidate in &candidates {
        println!("{}", candidate.describe());
    }
    match select_port(&candidates) {
        Ok(found) => println!("\nWould use {} ({:?})", found.path, found.reason),
        Err(err) => println!("\n{}", err),
    }
    Ok(())
}

async fn start_run(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(&settings, cli.dry_run)?;

    let record = StatusRecord::run_start(Utc::now().timestamp_millis());
    store
        .set(&record)
        .await
        .context("failed to write the run-start record")?;

    log_info!("Run started");
    Ok(())
}
