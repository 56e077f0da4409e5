use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use carbond::App;
use carbond_config::{Config, LogFormat};
use clap::Parser;
use tracing::{error, info};

/// Graphite-compatible metrics cache and whisper persistence daemon
#[derive(Parser)]
#[command(name = "carbond")]
#[command(version)]
#[command(about = "Graphite-compatible metrics cache and whisper persistence daemon", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    config_print_default: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Fork into the background
    #[arg(long)]
    daemon: bool,

    /// Pidfile path
    #[arg(long, value_name = "FILE")]
    pidfile: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.config_print_default {
        print!("{}", Config::default().to_toml_string()?);
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    config.validate().context("configuration invalid")?;

    if cli.check_config {
        return Ok(());
    }

    // Fork before any runtime thread exists.
    if cli.daemon {
        daemonize(&config, cli.pidfile.as_deref())?;
    } else if let Some(pidfile) = &cli.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("can't write pidfile {}", pidfile.display()))?;
    }

    init_tracing(&config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.common.max_cpu > 0 {
        builder.worker_threads(config.common.max_cpu);
    }
    builder
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(cli.config, config))
}

async fn run(config_path: Option<PathBuf>, config: Config) -> Result<()> {
    let mut app = App::new();
    app.start();
    app.configure(config).await?;
    info!(version = env!("CARGO_PKG_VERSION"), "carbond started");

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("can't install SIGHUP handler")?;
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("can't install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = hangup.recv() => reload(&mut app, config_path.as_deref()).await,
        }
    }

    app.shutdown().await;
    Ok(())
}

/// Re-read, validate and apply the config file. Failure leaves the
/// previous configuration in force.
async fn reload(app: &mut App, config_path: Option<&Path>) {
    info!("received SIGHUP, reloading configuration");
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "reload failed, keeping previous configuration");
            return;
        }
    };
    if let Err(e) = app.configure(config).await {
        error!(error = %e, "reload rejected, keeping previous configuration");
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.common.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    // Without a logfile everything goes to stderr, which --daemon
    // redirects at fork time.
    if config.common.logfile.is_empty() {
        match config.common.log_format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Text => registry.with(fmt::layer()).init(),
        }
        return Ok(());
    }

    let logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.common.logfile)
        .with_context(|| format!("can't open logfile {}", config.common.logfile))?;
    let writer = std::sync::Mutex::new(logfile);
    match config.common.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(writer))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init(),
    }
    Ok(())
}

fn daemonize(config: &Config, pidfile: Option<&Path>) -> Result<()> {
    let mut daemon = daemonize::Daemonize::new().working_directory(".");

    if let Some(pidfile) = pidfile {
        daemon = daemon.pid_file(pidfile);
    }
    if !config.common.user.is_empty() {
        daemon = daemon.user(config.common.user.as_str());
    }
    if !config.common.logfile.is_empty() {
        let open = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.common.logfile)
        };
        daemon = daemon
            .stdout(open().with_context(|| "can't open logfile for daemon stdout")?)
            .stderr(open().with_context(|| "can't open logfile for daemon stderr")?);
    }

    daemon.start().context("daemonize failed")?;
    Ok(())
}
