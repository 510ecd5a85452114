//! ptyhub - shared terminal sessions for coding agents
//!
//! `ptyhub serve` runs the HTTP/WebSocket server. Each session owns one
//! agent process on a PTY; any number of browser viewers (or `ptyhub
//! attach`) share it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use ptyhub::{api, client::Client, config::Config, process::NativeLauncher};

/// Shared PTY sessions for coding agents, viewable from the browser.
#[derive(Parser, Debug)]
#[command(name = "ptyhub", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server
    Serve {
        /// Address to bind the HTTP/WebSocket server (overrides the config file)
        #[arg(long, env = "PTYHUB_BIND")]
        bind: Option<SocketAddr>,

        /// Path to the TOML config file
        #[arg(long, env = "PTYHUB_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Attach this terminal to a session, creating it if needed
    Attach {
        /// Server address, e.g. 127.0.0.1:7681
        server: String,

        /// Session id. A new one is generated when omitted.
        session: Option<String>,

        /// Display name shown to other viewers
        #[arg(long)]
        name: Option<String>,
    },

    /// List sessions on a server
    List {
        /// Server address
        server: String,
    },

    /// Close a session and stop its agent
    Close {
        /// Server address
        server: String,

        /// Session id
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, config } => {
            init_tracing();
            run_serve(bind, config).await
        }
        Commands::Attach { server, session, name } => {
            init_tracing_stderr();
            run_attach(server, session, name).await
        }
        Commands::List { server } => {
            init_tracing_stderr();
            run_list(server).await
        }
        Commands::Close { server, session } => {
            init_tracing_stderr();
            run_close(server, session).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ptyhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Client commands own stdout (the attached terminal or command output),
/// so logs go to stderr and default to warnings only.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ptyhub=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_serve(bind: Option<SocketAddr>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.or_else(Config::default_path);
    let mut config = Config::load_or_default(path.as_deref())?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    config.validate()?;

    let bind = config.server.bind;
    let reap_interval = Duration::from_millis(config.sessions.reap_interval_ms);
    let grace = config.process.grace_period();
    tracing::info!(
        workspace = %config.sessions.workspace_root.display(),
        agents = config.agents.len(),
        "ptyhub server starting"
    );

    let state = api::AppState::new(Arc::new(config), Arc::new(NativeLauncher));
    let registry = state.registry.clone();
    let shutdown = state.shutdown.clone();

    let reaper_cancel = CancellationToken::new();
    let reaper = registry.spawn_reaper(reap_interval, reaper_cancel.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let app = api::router(state);
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    tracing::info!("received Ctrl+C");

    // Tell WebSocket handlers to send close frames, then stop accepting.
    shutdown.shutdown();
    if !shutdown.wait_for_idle(Duration::from_millis(500)).await {
        tracing::debug!(remaining = shutdown.active_connections(), "connections still open at shutdown");
    }
    let _ = server_shutdown_tx.send(());

    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
        Err(e) => tracing::warn!(error = %e, "HTTP server task panicked"),
    }

    reaper_cancel.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }

    // Agents get SIGHUP, then SIGKILL after the grace period.
    let drained = tokio::time::timeout(grace * 2 + Duration::from_secs(1), registry.drain()).await;
    if drained.is_err() {
        tracing::warn!("timed out draining sessions");
    }

    tracing::info!("ptyhub server exiting");
    Ok(())
}

// ── Client commands ────────────────────────────────────────────────

async fn run_attach(server: String, session: Option<String>, name: Option<String>) -> anyhow::Result<()> {
    let client = Client::new(&server)?;
    let session = session.unwrap_or_else(|| {
        let id = Uuid::new_v4().to_string();
        eprintln!("ptyhub: new session {id}");
        id
    });

    let code = client
        .attach(&session, name.as_deref(), CancellationToken::new())
        .await
        .with_context(|| format!("attach to {session} failed"))?;

    if let Some(code) = code {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_list(server: String) -> anyhow::Result<()> {
    let client = Client::new(&server)?;
    let sessions = client.list_sessions().await?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!(
        "{:<36} {:<16} {:<10} {:<10} {:<8} {}",
        "ID", "NAME", "AGENT", "STATE", "VIEWERS", "CWD"
    );
    for s in &sessions {
        let agent = if s.yolo { format!("{}*", s.agent) } else { s.agent.clone() };
        println!(
            "{:<36} {:<16} {:<10} {:<10} {:<8} {}",
            s.id, s.name, agent, s.state, s.viewers, s.cwd
        );
    }
    Ok(())
}

async fn run_close(server: String, session: String) -> anyhow::Result<()> {
    let client = Client::new(&server)?;
    client.close_session(&session).await?;
    println!("Closed {session}.");
    Ok(())
}
