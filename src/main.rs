use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use scamperd::{agent, config};

/// Traceroute orchestration daemon.
#[derive(Parser)]
#[command(name = "scamperd", about)]
struct Cli {
    /// YAML configuration file to run with.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter directive (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show version and build details, then exit.
    Version,
}

/// Build-time version info, injected via the environment.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("scamperd {}", version::full());
        return Ok(());
    }

    init_logging(&cli.log_level)?;

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = config::Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "scamperd starting",
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cfg))
}

fn init_logging(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

/// Bring the agent up, hold it until a termination signal arrives, then
/// take it down in order.
async fn run(cfg: config::Config) -> Result<()> {
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    let signal = termination_signal().await?;
    tracing::info!(signal, "shutting down");

    agent.stop().await?;

    tracing::info!("scamperd exited cleanly");

    Ok(())
}

/// Resolve once either SIGINT or SIGTERM has been delivered.
async fn termination_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}
