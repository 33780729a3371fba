mod console;
mod settings;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::{list_input_devices, VoiceEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::console::{spawn_console, ConsoleReceivers};
use crate::settings::{default_settings_path, load_settings, normalize_backend_url, save_settings};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Hands-free voice conversation with a speech backend")]
struct Cli {
    /// Backend WebSocket URL (overrides settings and PARLEY_BACKEND_URL).
    #[arg(long)]
    url: Option<String>,

    /// Settings file; created with defaults if missing.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Input device name.
    #[arg(long)]
    device: Option<String>,

    /// Print the available input devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Start idle; press Enter to begin the conversation.
    #[arg(long)]
    no_autostart: bool,

    /// Print a live level meter.
    #[arg(long)]
    levels: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info,parley_core=info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        for device in list_input_devices() {
            let mut flags = Vec::new();
            if device.is_default {
                flags.push("default");
            }
            if device.is_recommended {
                flags.push("recommended");
            }
            if device.is_loopback {
                flags.push("loopback");
            }
            if flags.is_empty() {
                println!("{}", device.name);
            } else {
                println!("{} ({})", device.name, flags.join(", "));
            }
        }
        return Ok(());
    }

    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &app_settings) {
            warn!("could not write default settings to {settings_path:?}: {e}");
        }
    }
    app_settings.apply_env_overrides();
    if let Some(url) = &cli.url {
        app_settings.backend_url = normalize_backend_url(url);
    }
    if let Some(device) = &cli.device {
        app_settings.preferred_input_device = Some(device.clone());
    }
    app_settings.normalize();
    info!(
        settings_path = ?settings_path,
        backend_url = %app_settings.backend_url,
        input_device = app_settings.preferred_input_device.as_deref().unwrap_or("default"),
        "settings loaded"
    );

    let engine = VoiceEngine::new(app_settings.into_engine_config());
    let console_tasks = spawn_console(ConsoleReceivers {
        status: engine.subscribe_status(),
        transcripts: engine.subscribe_transcripts(),
        notices: engine.subscribe_notices(),
        activity: (cli.levels || app_settings.show_levels).then(|| engine.subscribe_activity()),
    });

    engine
        .start(app_settings.backend_url.clone())
        .context("failed to start voice engine")?;
    if !cli.no_autostart {
        engine.activate().context("failed to activate voice session")?;
    }
    println!("Enter toggles the conversation, q quits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "q" | "quit" | "exit" => break,
                    _ => {
                        if let Err(e) = engine.toggle() {
                            warn!("toggle failed: {e}");
                        }
                    }
                },
                // stdin closed: keep running until ctrl-c.
                Ok(None) => {
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                break;
            }
        }
    }

    if let Err(e) = engine.deactivate() {
        warn!("deactivate on shutdown: {e}");
    }
    engine.stop().context("failed to stop voice engine")?;
    for task in console_tasks {
        task.abort();
    }

    let diagnostics = engine.diagnostics_snapshot();
    info!(
        frames = diagnostics.frames,
        speech_starts = diagnostics.speech_starts,
        captures_sent = diagnostics.captures_sent,
        replies_played = diagnostics.replies_played,
        barge_ins = diagnostics.barge_ins,
        reply_timeouts = diagnostics.reply_timeouts,
        "session diagnostics"
    );
    Ok(())
}
