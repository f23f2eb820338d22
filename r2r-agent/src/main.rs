// R2R agent: listen for peers or connect to one, exchange status and negotiate tasks.

mod config;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use r2r_core::Negotiator;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "r2r-agent", version)]
#[command(about = "R2R robot-to-robot protocol agent")]
struct Cli {
    /// Config file (default: ~/.config/r2r/config.toml, then /etc/r2r/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent ID used as `source_id` (overrides config and R2R_AGENT_ID).
    #[arg(long, global = true)]
    id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept peer connections and track their negotiations.
    Listen {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a peer, report status, optionally bid or propose, then heartbeat.
    Connect {
        addr: SocketAddr,
        /// Address messages to this agent instead of broadcasting.
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value = "idle")]
        status: String,
        /// Bid on a task (requires --cost).
        #[arg(long, requires = "cost")]
        bid: Option<String>,
        #[arg(long)]
        cost: Option<f64>,
        /// Propose a new task with a generated ID.
        #[arg(long)]
        propose: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,r2r_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(id) = cli.id {
        cfg.agent_id = id;
    }
    let command = cli.command;
    if let Command::Listen { port: Some(p) } = &command {
        cfg.listen_port = *p;
    }
    let cfg = Arc::new(cfg);
    let negotiator = Negotiator::shared(cfg.negotiation_timeout());
    let sessions: transport::Sessions = Arc::default();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let work = async {
            match command {
                Command::Listen { .. } => {
                    transport::run_listener(cfg.clone(), negotiator.clone(), sessions.clone())
                        .await
                        .context("listener failed")
                }
                Command::Connect {
                    addr,
                    target,
                    status,
                    bid,
                    cost,
                    propose,
                } => {
                    let opening = transport::Opening {
                        target,
                        status,
                        bid: bid.zip(cost),
                        propose: propose.then(|| uuid::Uuid::new_v4().to_string()),
                    };
                    transport::run_connect(
                        cfg.clone(),
                        addr,
                        negotiator.clone(),
                        sessions.clone(),
                        opening,
                    )
                    .await
                    .with_context(|| format!("session with {addr} failed"))
                }
            }
        };
        tokio::select! {
            r = work => r,
            r = shutdown_signal() => {
                tracing::info!("shutting down");
                transport::close_all(&sessions).await;
                r
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
