use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};

use stroke_rs::ble_client::{BleClient, ClientConfig};
use stroke_rs::engine::{Engine, EngineConfig, EngineHandle};
use stroke_rs::protocol::{Command, Page, Parameter};
use stroke_rs::settings::{default_settings_path, JsonFileSettings, MemorySettings, SettingsStore};
use stroke_rs::transport::Transport;
use stroke_rs::types::ConnectionState;

/// Interactive BLE remote for the stroke engine controller.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Run without a device; commands are applied to a simulated state.
    #[arg(long)]
    simulate: bool,

    /// Connect to the first device whose advertised name starts with this.
    #[arg(long, default_value = "OSSM")]
    name_prefix: String,

    /// BLE scan timeout in seconds.
    #[arg(long, default_value_t = 10)]
    scan_timeout: u64,

    /// Settings file (learned homing durations, knob preference).
    /// Defaults to the per-user config directory.
    #[arg(long)]
    settings: Option<PathBuf>,
}

const HELP: &str = "\
Commands (type + Enter):
  go <menu|simplePenetration|strokeEngine|streaming>
  speed|stroke|depth|sensation|pattern <n>
  stream <position> <ms>
  stop                  – speed 0, back to menu
  patterns              – print the pattern catalog
  refresh               – re-fetch the pattern catalog
  knob <true|false>     – speed knob acts as a limit
  sim <on|off>          – toggle simulation mode
  log                   – print the command ledger
  dismiss               – clear the last error
  q                     – quit
  <any other string>    – sent as a raw command";

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=stroke_rs=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // ── Settings ──────────────────────────────────────────────────────────────
    let settings: Box<dyn SettingsStore> = match args.settings.or_else(default_settings_path) {
        Some(path) => {
            info!("Settings: {}", path.display());
            Box::new(JsonFileSettings::open(path))
        }
        None => {
            warn!("No config directory, settings will not persist");
            Box::new(MemorySettings::new())
        }
    };

    // ── Engine ────────────────────────────────────────────────────────────────
    let engine = Engine::spawn(
        EngineConfig {
            simulation: args.simulate,
            ..EngineConfig::default()
        },
        settings,
    );

    if args.simulate {
        info!("Simulation mode, no device will be contacted.");
        engine.refresh_patterns().await?;
    } else {
        let client = BleClient::new(ClientConfig {
            scan_timeout_secs: args.scan_timeout,
            name_prefix: args.name_prefix,
        });
        info!("Connecting …");
        let (events, transport) = client.connect().await?;
        engine
            .attach(transport as Arc<dyn Transport>, events)
            .await?;
    }

    spawn_printers(&engine);
    info!("{HELP}\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so no StdinLock is held across
    // an await point.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        if line.is_empty() {
            continue;
        }
        if line == "q" || line == "quit" {
            info!("Quit requested.");
            break;
        }
        if let Err(e) = run_line(&engine, &line).await {
            error!("{line}: {e}");
        }
    }

    engine.disconnect().await.ok();
    info!("Exiting.");
    Ok(())
}

/// Execute one command line.
async fn run_line(engine: &EngineHandle, line: &str) -> Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let number = |i: usize| -> Result<i64> {
        let word = words.get(i).ok_or_else(|| anyhow!("missing argument"))?;
        word.parse().map_err(|_| anyhow!("'{word}' is not a number"))
    };

    match words.as_slice() {
        ["go", page] => {
            let page: Page = page.parse()?;
            engine.navigate_to(page).await?;
        }
        [param @ ("speed" | "stroke" | "depth" | "sensation" | "pattern"), _] => {
            let param: Parameter = param.parse()?;
            engine.set_parameter(param, number(1)?).await?;
        }
        ["stream", _, _] => {
            engine.stream_position(number(1)?, number(2)?).await?;
        }
        ["stop"] => engine.emergency_stop().await?,
        ["patterns"] => {
            for p in engine.patterns().borrow().iter() {
                println!(
                    "[PATTERN] {:3}  {:20}  {}",
                    p.index,
                    p.name,
                    p.description.as_deref().unwrap_or("")
                );
            }
        }
        ["refresh"] => engine.refresh_patterns().await?,
        ["knob", value] => {
            let as_limit = value
                .parse::<bool>()
                .map_err(|_| anyhow!("expected true or false"))?;
            engine.set_speed_knob_limit(as_limit).await?;
        }
        ["sim", "on"] => engine.set_simulation(true).await?,
        ["sim", "off"] => engine.set_simulation(false).await?,
        ["log"] => {
            for ev in engine.ledger_snapshot().await? {
                println!(
                    "[LOG] {:>5}  {:24}  {:?}  {:?}  {}",
                    ev.id.to_string(),
                    ev.command,
                    ev.transport_result,
                    ev.outcome,
                    ev.firmware_response.as_deref().unwrap_or("")
                );
            }
        }
        ["dismiss"] => engine.dismiss_error().await?,
        ["help"] => println!("{HELP}"),
        _ => {
            let command = line
                .parse::<Command>()
                .unwrap_or_else(|_| Command::Raw(line.to_owned()));
            info!("Sending command: '{command}'");
            let response = engine.request(command).await?;
            println!("[RESPONSE] {response}");
        }
    }
    Ok(())
}

/// Print every published change until the engine stops.
fn spawn_printers(engine: &EngineHandle) {
    let mut connection = engine.connection();
    tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            let state = connection.borrow_and_update().clone();
            match state {
                ConnectionState::Connected(name) => info!("✅  Connected to: {name}"),
                ConnectionState::Connecting => info!("Connecting …"),
                ConnectionState::Disconnected => info!("❌  Disconnected from device."),
                ConnectionState::RadioUnavailable => warn!("Bluetooth is unavailable."),
            }
        }
    });

    let mut state = engine.device_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let s = *state.borrow_and_update();
            println!(
                "[STATE] {:28}  speed={:3}  stroke={:3}  depth={:3}  sensation={:3}  pattern={}",
                s.status.to_string(),
                s.speed,
                s.stroke,
                s.depth,
                s.sensation,
                s.pattern
            );
        }
    });

    let mut homing = engine.homing();
    tokio::spawn(async move {
        while homing.changed().await.is_ok() {
            let progress = *homing.borrow_and_update();
            if let Some(p) = progress {
                let secs = p.estimated_end.saturating_duration_since(p.started_at);
                println!("[HOMING] {:?}, about {:.1} s", p.direction, secs.as_secs_f64());
            }
        }
    });

    let mut knob = engine.speed_knob_limit();
    tokio::spawn(async move {
        while knob.changed().await.is_ok() {
            if let Some(as_limit) = *knob.borrow_and_update() {
                println!("[KNOB] speed knob as limit: {as_limit}");
            }
        }
    });

    let mut last_error = engine.last_error();
    tokio::spawn(async move {
        while last_error.changed().await.is_ok() {
            if let Some(message) = last_error.borrow_and_update().clone() {
                println!("[ERROR] {message}");
            }
        }
    });
}
