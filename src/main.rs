use crate::config::Config;
use crate::devices::Devices;
use crate::mesh::Mesh;
use crate::records::PeerRecords;
use crate::scheduler::Scheduler;
use crate::state::{NodeState, PendingRecord, SharedState};
use anyhow::Context;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod devices;
mod mesh;
mod protocol;
mod records;
mod scheduler;
mod state;
mod transport;

use clap::{Parser, Subcommand};

// TUI Imports
use crossterm::{
    ExecutableCommand,
    event::{self, KeyCode, KeyEventKind},
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, Row, Table, Wrap},
};

/// liesmesh: capture, caption, gossip to peers, fine-tune on what they sent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the capture/gossip/train daemon
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Broadcast a single envelope to the configured peers
    Send {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
        /// Caption to send
        #[arg(short, long)]
        description: String,
        /// Image file to attach (empty image if omitted)
        #[arg(short, long)]
        image: Option<String>,
    },
    /// Show current node state
    Show {
        /// Watch mode (interactive TUI)
        #[arg(short, long)]
        watch: bool,
        /// API URL (default: http://127.0.0.1:3000)
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        api: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default log level: INFO. Override with RUST_LOG=liesmesh=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        config: "config.toml".to_string(),
    }) {
        Commands::Run { config } => run_daemon(&config).await,
        Commands::Validate { config } => validate_config(&config),
        Commands::Send {
            config,
            description,
            image,
        } => send_once(&config, &description, image.as_deref()).await,
        Commands::Show { watch, api } => show_state(watch, &api).await,
    }
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!("Listen port: {}", cfg.node.listen_port);
            info!("Peers: {}", cfg.node.peers.len());
            info!(
                "Tick every {}s, flush every {}s, {} training steps per record",
                cfg.schedule.tick_delay_secs,
                cfg.schedule.flush_interval_secs,
                cfg.schedule.train_steps
            );
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

async fn run_daemon(config_path: &str) -> anyhow::Result<()> {
    // 1. Load Config
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path))?;

    // 2. Mesh + peer record store
    let records = Arc::new(PeerRecords::new());
    let mesh = Arc::new(Mesh::new(&config.node));
    info!(
        "Starting liesmesh on port {} with peers {:?}",
        mesh.port(),
        mesh.peers()
    );

    mesh.set_on_data(crate::records::sink(records.clone()));
    mesh.start_receiver()
        .with_context(|| format!("Failed to bind port {}", mesh.port()))?;

    // 3. Scheduler
    let devices = Devices::from_config(&config.devices);
    let mut scheduler = Scheduler::new(
        config.schedule.clone(),
        mesh.clone(),
        records.clone(),
        devices,
    );

    // State Tracking
    let state: SharedState = Arc::new(Mutex::new(NodeState::default()));
    let start_time = std::time::Instant::now();

    // Spawn API
    let api_state = state.clone();
    let api_listen = config.node.api_listen;
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/state", axum::routing::get(get_state))
            .with_state(api_state);
        match tokio::net::TcpListener::bind(api_listen).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    error!("API Server Error: {}", e);
                }
            }
            Err(e) => error!("Failed to bind API port: {}", e),
        }
    });
    info!("API Server running at http://{}", api_listen);

    // Stats Updater
    let stats_state = state.clone();
    let stats_mesh = mesh.clone();
    let stats_records = records.clone();
    let stats_schedule = scheduler.stats();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(1000)).await;
            let mut s = stats_state.lock().await;
            s.uptime_secs = start_time.elapsed().as_secs();
            s.peers = stats_mesh.peers().iter().map(|p| p.to_string()).collect();
            s.mesh = stats_mesh.stats().snapshot();
            s.schedule = stats_schedule.snapshot();
            s.pending = stats_records
                .pending()
                .into_iter()
                .map(|(peer, description, image_bytes)| PendingRecord {
                    peer: peer.to_string(),
                    description,
                    image_bytes,
                })
                .collect();
        }
    });

    // Signal handling
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        res = scheduler.run() => {
            if let Err(e) = res {
                error!("Scheduler stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    Ok(())
}

async fn send_once(
    config_path: &str,
    description: &str,
    image: Option<&str>,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path))?;

    let image = match image {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image '{}'", path))?,
        None => Vec::new(),
    };

    let mesh = Mesh::new(&config.node);
    if mesh.peers().is_empty() {
        warn!("No peers to send to");
        return Ok(());
    }

    let outcomes = mesh.broadcast(description, Bytes::from(image)).settled().await;
    let mut delivered = 0;
    for (peer, outcome) in &outcomes {
        match outcome {
            Ok(()) => {
                delivered += 1;
                info!("Delivered to {}", peer);
            }
            Err(e) => warn!("Failed to send to {}: {}", peer, e),
        }
    }
    info!("Delivered to {}/{} peers", delivered, outcomes.len());
    Ok(())
}

async fn show_state(watch: bool, api_url: &str) -> anyhow::Result<()> {
    if watch {
        run_tui(api_url).await
    } else {
        match reqwest::get(format!("{}/state", api_url)).await {
            Ok(resp) => {
                let state = resp.json::<NodeState>().await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            Err(e) => eprintln!("Failed to connect to API: {}", e),
        }
        Ok(())
    }
}

async fn run_tui(api_url: &str) -> anyhow::Result<()> {
    std::io::stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(std::io::stdout()))?;

    loop {
        let state_opt = match reqwest::get(format!("{}/state", api_url)).await {
            Ok(r) => r.json::<NodeState>().await.ok(),
            Err(_) => None,
        };

        terminal.draw(|frame| {
            let layout = Layout::default()
                .direction(Direction::Vertical)
                .constraints(vec![
                    Constraint::Length(3),
                    Constraint::Length(4),
                    Constraint::Min(0),
                ])
                .split(frame.area());

            if let Some(state) = &state_opt {
                let title = Paragraph::new(format!(
                    "liesmesh | Uptime: {}s | Peers: {} | Rx: {} | Tx: {} | Rejected: {} | Ticks: {} | Flushes: {}",
                    state.uptime_secs,
                    state.peers.len(),
                    state.mesh.rx_bytes,
                    state.mesh.tx_bytes,
                    state.mesh.frames_rejected,
                    state.schedule.ticks,
                    state.schedule.flushes,
                ))
                .block(Block::default().borders(Borders::ALL).title("Status"));
                frame.render_widget(title, layout[0]);

                let loss = state
                    .schedule
                    .last_loss
                    .map(|l| format!("{:.4}", l))
                    .unwrap_or_else(|| "-".to_string());
                let caption = Paragraph::new(format!(
                    "{} (last loss: {})",
                    state.schedule.last_caption.as_deref().unwrap_or("-"),
                    loss
                ))
                .wrap(Wrap { trim: true })
                .block(Block::default().borders(Borders::ALL).title("Last caption"));
                frame.render_widget(caption, layout[1]);

                let rows: Vec<Row> = state
                    .pending
                    .iter()
                    .map(|p| {
                        Row::new(vec![
                            p.peer.clone(),
                            p.description.clone(),
                            format!("{}", p.image_bytes),
                        ])
                    })
                    .collect();

                let table = Table::new(
                    rows,
                    [
                        Constraint::Percentage(20),
                        Constraint::Percentage(60),
                        Constraint::Percentage(20),
                    ],
                )
                .header(Row::new(vec!["Peer", "Description", "Image bytes"]))
                .block(Block::default().borders(Borders::ALL).title("Pending records"));

                frame.render_widget(table, layout[2]);
            } else {
                frame.render_widget(Paragraph::new("Connecting to Node API..."), layout[0]);
            }
        })?;

        if event::poll(std::time::Duration::from_millis(1000))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && key.code == KeyCode::Char('q') {
                    break;
                }
            }
        }
    }

    disable_raw_mode()?;
    std::io::stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

async fn get_state(
    axum::extract::State(state): axum::extract::State<SharedState>,
) -> axum::Json<NodeState> {
    let s = state.lock().await;
    axum::Json(s.clone())
}
