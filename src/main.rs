//! bgg-config: drive a BumbleGum controller from the terminal.
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use bgg_config_lib::cancellation::CancelToken;
use bgg_config_lib::commands::{self, AppState};
use bgg_config_lib::device::{DeviceBackend, NativeBackend, SimulatedBackend, SimulatedFirmware};
use bgg_config_lib::events::UiEvent;
use bgg_config_lib::serial::SerialInterface;
use bgg_config_lib::update::UpdateCheck;
use bgg_config_lib::{init_logging, EngineSettings};

#[derive(Parser)]
#[command(name = "bgg-config")]
#[command(about = "Configure and update BumbleGum guitar controllers over USB serial")]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, default_value = "bgg-config.toml")]
    config: PathBuf,

    /// Talk to a simulated controller instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List matching serial ports
    List,
    /// Follow discovery and print every engine event as JSON
    Watch,
    /// Connect and print uid, firmware version and device name
    Info,
    /// Read one file from the controller
    Read { name: String },
    /// Run whammy calibration
    Calibrate {
        /// Write the new bounds to config.json
        #[arg(long)]
        save: bool,
    },
    /// Assign a GPIO pin to an input
    SetPin { key: String, pin: String },
    /// Check for a firmware update
    CheckUpdate {
        /// Install it if one is available
        #[arg(long)]
        install: bool,
    },
    /// Stop update prompts for the connected controller for a day
    Defer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LevelFilter::from_str(&cli.log_level).unwrap_or(LevelFilter::Info));

    let settings = EngineSettings::load(&cli.config)?;
    if let Command::List = cli.command {
        return list_ports(&settings);
    }

    let backend: Arc<dyn DeviceBackend> = if cli.simulate {
        info!("Using a simulated controller");
        Arc::new(SimulatedBackend::new(SimulatedFirmware::default))
    } else {
        Arc::new(NativeBackend)
    };
    let state = AppState::new(settings, backend);

    match cli.command {
        Command::List => Ok(()),
        Command::Watch => watch(&state).await,
        Command::Info => {
            let mut events = state.manager.subscribe_events();
            connect(&state).await?;
            let info = wait_for(&mut events, Duration::from_secs(30), |e| matches!(e, UiEvent::DeviceInfoRead { .. })).await?;
            print_json(&info)
        }
        Command::Read { name } => {
            connect(&state).await?;
            let value = commands::read_device_file(&state, name).await.map_err(|e| anyhow!(e))?;
            print_json(&value)
        }
        Command::Calibrate { save } => {
            let mut events = state.manager.subscribe_events();
            connect(&state).await?;
            wait_for(&mut events, Duration::from_secs(30), |e| matches!(e, UiEvent::AllFilesLoaded { .. })).await?;
            println!("Leave the whammy at rest, then push it all the way when prompted.");
            let printer = tokio::spawn(print_calibration(state.manager.subscribe_events()));
            let result = commands::start_calibration(&state, save).await.map_err(|e| anyhow!(e));
            printer.abort();
            print_json(&result?)
        }
        Command::SetPin { key, pin } => {
            connect(&state).await?;
            commands::apply_pin_config(&state, key, pin).await.map_err(|e| anyhow!(e))
        }
        Command::CheckUpdate { install } => {
            let mut events = state.manager.subscribe_events();
            connect(&state).await?;
            wait_for(&mut events, Duration::from_secs(30), |e| matches!(e, UiEvent::DeviceInfoRead { .. })).await?;
            let check = commands::check_for_update(&state, true).await.map_err(|e| anyhow!(e))?;
            match check {
                UpdateCheck::UpToDate { device_version, .. } => println!("Firmware {} is up to date", device_version),
                UpdateCheck::Suppressed { until } => println!("Update prompts deferred until {}", until),
                UpdateCheck::Available { device_version, manifest } => {
                    println!("Firmware {} available (device has {})", manifest.firmware_version, device_version);
                    if !manifest.release_notes.is_empty() {
                        println!("{}", manifest.release_notes);
                    }
                    if install {
                        run_install(&state).await?;
                    }
                }
            }
            Ok(())
        }
        Command::Defer => {
            connect(&state).await?;
            let until = commands::defer_update(&state).await.map_err(|e| anyhow!(e))?;
            println!("Update prompts suppressed until {}", until);
            Ok(())
        }
    }
}

fn list_ports(settings: &EngineSettings) -> Result<()> {
    let ports = SerialInterface::discover_devices(&settings.device_filter()).context("Failed to enumerate ports")?;
    if ports.is_empty() {
        println!("No controllers found");
    }
    for port in ports {
        println!(
            "{}\t{:04x}:{:04x}\t{}",
            port.port_name,
            port.vid,
            port.pid,
            port.product.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn connect(state: &AppState) -> Result<()> {
    let outcome = state.manager.tick().await?;
    if outcome.connected.is_none() && state.manager.active_session().await.is_none() {
        return Err(anyhow!("No controller found"));
    }
    Ok(())
}

async fn watch(state: &AppState) -> Result<()> {
    let shutdown = CancelToken::new();
    let discovery = {
        let manager = state.manager.clone();
        let shutdown = shutdown.clone();
        let interval = state.settings.discovery_interval();
        tokio::spawn(async move { manager.run_discovery(interval, shutdown).await })
    };

    let mut events = state.manager.subscribe_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            evt = events.recv() => match evt {
                Ok(evt) => print_json(&evt)?,
                Err(broadcast::error::RecvError::Lagged(n)) => log::warn!("Dropped {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    shutdown.cancel();
    discovery.await?;
    Ok(())
}

async fn run_install(state: &AppState) -> Result<()> {
    let shutdown = CancelToken::new();
    // Validation needs discovery to pick the controller up after it reboots.
    let discovery = {
        let manager = state.manager.clone();
        let shutdown = shutdown.clone();
        let interval = state.settings.discovery_interval();
        tokio::spawn(async move { manager.run_discovery(interval, shutdown).await })
    };
    let progress = tokio::spawn(print_update_states(state.manager.subscribe_events()));

    let outcome = commands::install_update(state).await;
    progress.abort();
    shutdown.cancel();
    discovery.await?;

    let version = outcome.map_err(|e| anyhow!(e))?;
    println!("Update complete: controller reports {}", version);
    Ok(())
}

async fn wait_for<F>(events: &mut broadcast::Receiver<UiEvent>, limit: Duration, mut pred: F) -> Result<UiEvent>
where
    F: FnMut(&UiEvent) -> bool,
{
    let waited = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(evt) if pred(&evt) => return Ok(evt),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(anyhow!("event channel closed")),
            }
        }
    })
    .await;
    waited.map_err(|_| anyhow!("Timed out waiting for the controller"))?
}

async fn print_calibration(mut events: broadcast::Receiver<UiEvent>) {
    while let Ok(evt) = events.recv().await {
        if let UiEvent::CalibrationProgress(p) = evt {
            println!("{:?}: {} samples ({}/{} ms)", p.phase, p.samples, p.elapsed_ms, p.window_ms);
        }
    }
}

async fn print_update_states(mut events: broadcast::Receiver<UiEvent>) {
    while let Ok(evt) = events.recv().await {
        if let UiEvent::UpdateStateChanged(status) = evt {
            match status.progress {
                Some(p) => println!("{:?} {:.0}%", status.phase, p),
                None => println!("{:?}", status.phase),
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
