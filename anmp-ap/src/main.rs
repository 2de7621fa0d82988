//! Audio Player (anmp-ap) - Main entry point
//!
//! Plays the files given on the command line through the configured output
//! backend and prints player events until the playlist ends or Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anmp_ap::config::BackendKind;
use anmp_ap::{Player, PlayerConfig};
use anmp_common::events::{EventBus, PlayerEvent};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for anmp-ap
#[derive(Parser, Debug)]
#[command(name = "anmp-ap")]
#[command(about = "Audio player with nested loop playback")]
#[command(version)]
struct Args {
    /// Configuration file (overrides ANMP_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output backend: null, wav, jack or cpal
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// File written by the wav backend
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Repeat count for every nested loop (0 = forever)
    #[arg(short, long)]
    loops: Option<u32>,

    /// Number of output channels to mix down to
    #[arg(long)]
    channels: Option<u16>,

    /// Print events as JSON lines
    #[arg(long)]
    json_events: bool,

    /// Audio files to play in order
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut PlayerConfig) {
        if let Some(backend) = self.backend {
            config.output.backend = backend;
        }
        if let Some(path) = &self.wav {
            config.output.wav_path = path.clone();
            if self.backend.is_none() {
                config.output.backend = BackendKind::Wav;
            }
        }
        if let Some(loops) = self.loops {
            config.playback.loop_count_override = Some(loops);
        }
        if let Some(channels) = self.channels {
            config.output.channels = Some(channels);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = PlayerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid command-line options")?;

    // Initialize tracing
    let default_filter = format!(
        "anmp_ap={level},anmp_common={level}",
        level = config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(
        "Starting anmp-ap: {} files, backend {}, channels {:?}",
        args.files.len(),
        config.output.backend,
        config.output.channels
    );

    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let player = Arc::new(Player::new(config, events));
    for file in &args.files {
        player.enqueue(file.clone());
    }
    player.play().context("Failed to start playback")?;

    let mut finished = tokio::task::spawn_blocking({
        let player = Arc::clone(&player);
        move || while !player.wait_until_stopped(Duration::from_millis(500)) {}
    });

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping playback");
                let player = Arc::clone(&player);
                tokio::task::spawn_blocking(move || player.stop())
                    .await
                    .context("Failed to stop playback")?;
            }
            event = receiver.recv() => match event {
                Ok(event) => print_event(&event, args.json_events)?,
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = &mut finished => break,
        }
    }

    while let Ok(event) = receiver.try_recv() {
        print_event(&event, args.json_events)?;
    }

    info!("Played {} frames", player.frames_played());
    Ok(())
}

fn print_event(event: &PlayerEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event).context("Failed to serialize event")?);
        return Ok(());
    }

    match event {
        PlayerEvent::PlayheadChanged { .. } => {}
        PlayerEvent::CurrentSongChanged {
            path,
            total_frames,
            sample_rate,
            ..
        } => {
            let name = path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string());
            let seconds = *total_frames as f64 / (*sample_rate).max(1) as f64;
            println!("Now playing: {} ({:.1}s @ {} Hz)", name, seconds, sample_rate);
        }
        PlayerEvent::IsPlayingChanged { playing, error, .. } => match error {
            Some(error) => warn!("Playback stopped: {}", error),
            None => println!("{}", if *playing { "Playing" } else { "Stopped" }),
        },
        PlayerEvent::SongUnplayable { path, reason, .. } => {
            let name = path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string());
            println!("Skipping {}: {}", name, reason);
        }
        PlayerEvent::Diagnostics { underruns, .. } => {
            if *underruns > 0 {
                println!("Output underruns: {}", underruns);
            }
        }
        PlayerEvent::VolumeChanged { volume, .. } => println!("Volume: {:.2}", volume),
    }
    Ok(())
}
