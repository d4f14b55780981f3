mod config;
mod control;
mod game;
mod packets;
mod peer;
mod signaling;
mod track;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

use game::{GameMode, GameServer, SessionConfig};
use signaling::SignalingClient;
use track::TrackLibrary;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let mut cfg = config::load(options.config.as_deref())?;
    if let Some(directory) = options.tracks {
        cfg.tracks.directory = directory;
    }
    if let Some(bind) = options.control {
        cfg.control.bind = bind;
    }

    info!("Game server starting...");

    let library = Arc::new(TrackLibrary::load(Path::new(&cfg.tracks.directory))?);
    if library.is_empty() {
        bail!("no tracks found in {}", cfg.tracks.directory);
    }
    let default_track = library.first().context("track library is empty")?;

    let game_mode = GameMode::from_name(&cfg.host.game_mode)
        .with_context(|| format!("unknown game mode {:?}", cfg.host.game_mode))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let signaling = SignalingClient::new(
        cfg.broker.clone(),
        cfg.host.mods.clone(),
        cfg.host.accept_vanilla_clients,
        events_tx,
    )
    .await?;
    signaling.connect().await?;

    let server = GameServer::new(
        Handle::current(),
        SessionConfig {
            game_mode,
            switching: false,
            track: default_track,
            max_players: cfg.host.max_players,
        },
    );
    server.start();
    {
        let server = server.clone();
        tokio::spawn(async move {
            server.run_events(events_rx).await;
        });
    }

    signaling
        .create_invite()
        .await
        .context("failed to create invite")?;

    control::spawn(
        cfg.control.bind.clone(),
        control::ControlContext {
            server: server.clone(),
            signaling: signaling.clone(),
            tracks: library.clone(),
            runtime: Handle::current(),
        },
    )?;

    info!("Host is up; waiting for players");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

struct Options {
    config: Option<PathBuf>,
    tracks: Option<String>,
    control: Option<String>,
}

/// Parse command line arguments; flags override the config file
fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        config: None,
        tracks: None,
        control: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let value = args.get(i + 1).context("--config requires a path")?;
                options.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--tracks" => {
                let value = args.get(i + 1).context("--tracks requires a directory")?;
                options.tracks = Some(value.clone());
                i += 2;
            }
            "--control" => {
                let value = args
                    .get(i + 1)
                    .context("--control requires a bind address")?;
                options.control = Some(value.clone());
                i += 2;
            }
            "--help" | "-h" => {
                print_usage(&args[0]);
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage(&args[0]);
                std::process::exit(1);
            }
        }
    }

    Ok(options)
}

fn print_usage(program: &str) {
    println!("polyhost - peer-to-peer multiplayer host for track racing");
    println!();
    println!("Usage:");
    println!("  {program} [--config <path>] [--tracks <dir>] [--control <addr>]");
    println!();
    println!("Options:");
    println!("  --config <path>   Configuration file (default: per-user config dir)");
    println!("  --tracks <dir>    Track directory (default: tracks/official)");
    println!("  --control <addr>  Control API bind address (default: 127.0.0.1:9090)");
}
