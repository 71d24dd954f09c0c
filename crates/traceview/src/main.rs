//! traceview: TraceView agent tools
//!
//! Command-line companion to the tracing core: a local collector simulator,
//! an X-Trace header decoder and a demo trace emitter.

mod config;
mod emit;
mod listen;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use traceview_core::{MemoryTransport, Reporter, Sampler, TraceIdentifier, TraceMode, Tracer};

use config::{Config, Overrides, TRACEVIEW_DIR};

/// TraceView agent tools
#[derive(Parser)]
#[command(name = "traceview")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .traceview directory (default: search for .traceview/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sampling rate out of 1000000
    #[arg(long, global = true, env = "TRACEVIEW_SAMPLE_RATE")]
    sample_rate: Option<u32>,

    /// Trace mode: never, always, through, rate
    #[arg(long, global = true, env = "TRACEVIEW_TRACE_MODE")]
    trace_mode: Option<TraceMode>,

    /// Collector address (host or host:port)
    #[arg(long, global = true, env = "TRACEVIEW_COLLECTOR")]
    collector: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local collector that prints every received event
    Listen {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,

        /// Stop after this many events
        #[arg(long)]
        count: Option<u64>,

        /// Write logs to daily-rotated files in this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Decode an X-Trace header
    Decode {
        /// The header value
        header: String,
    },

    /// Emit a demo trace to the configured collector
    Emit {
        /// Name of the top layer
        #[arg(long, default_value = "koa-route")]
        layer: String,

        /// Number of nested middleware layers
        #[arg(long, default_value = "2")]
        depth: u32,

        /// Continue from this inbound X-Trace header
        #[arg(long)]
        xtrace: Option<String>,

        /// Print the messages instead of sending them
        #[arg(long)]
        dry_run: bool,
    },

    /// Initialize a new .traceview directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging to stderr for interactive use.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging for collector mode.
/// Logs to rotating files with daily rotation, keeping stdout for events.
fn init_file_logging(logs_dir: &std::path::Path, verbose: bool) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        init_logging(verbose);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "traceview.log");

    // Use non-blocking writer to avoid blocking on log writes
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard would stop logging
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

fn run_decode(header: &str) -> Result<()> {
    let id = TraceIdentifier::decode(header).context("Invalid X-Trace header")?;
    println!("version: {:#04X}", id.version());
    println!("task_id: {}", id.task_id());
    println!("op_id:   {}", id.op_id());
    println!("flags:   {:#04X}", id.flags());
    println!("sampled: {}", id.is_sampled());
    Ok(())
}

fn run_init(force: bool) -> Result<()> {
    let dir = std::env::current_dir()?.join(TRACEVIEW_DIR);
    let path = Config::config_path(&dir);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::write(&path, Config::default_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Listen {
            log_dir: Some(dir), ..
        } => init_file_logging(dir, cli.verbose),
        _ => init_logging(cli.verbose),
    }

    let (mut config, traceview_dir) = Config::load(cli.config.as_deref())?;
    config.apply(&Overrides {
        sample_rate: cli.sample_rate,
        trace_mode: cli.trace_mode,
        collector: cli.collector.clone(),
    });
    if let Some(dir) = &traceview_dir {
        tracing::debug!("Using {}", dir.display());
    }

    match cli.command {
        Commands::Listen {
            host, port, count, ..
        } => {
            let host = host.unwrap_or(config.listen.host);
            let port = port.unwrap_or(config.listen.port);
            let mut listener = listen::Listener::bind(&host, port).await?;
            let mut stdout = std::io::stdout().lock();
            tokio::select! {
                result = listener.run(count, &mut stdout) => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        Commands::Decode { header } => run_decode(&header)?,
        Commands::Emit {
            layer,
            depth,
            xtrace,
            dry_run,
        } => {
            for e in config.tracer.validate() {
                tracing::warn!("Config: {}", e);
            }
            let (tracer, memory) = if dry_run {
                let memory = Arc::new(MemoryTransport::new());
                let tracer = Tracer::new(
                    Sampler::new(config.tracer.trace_mode, config.tracer.sample_rate),
                    Reporter::new(Arc::clone(&memory)),
                );
                (tracer, Some(memory))
            } else {
                (Tracer::from_config(&config.tracer)?, None)
            };
            let emitted = emit::emit(&tracer, &layer, depth, xtrace.as_deref()).await;
            if let Some(memory) = memory {
                for payload in memory.take() {
                    println!("{}", String::from_utf8_lossy(&payload));
                }
            }
            let stats = tracer.reporter().stats();
            info!(
                sent = stats.sent,
                dropped = stats.dropped,
                destination = %tracer.reporter().destination(),
                "Demo trace emitted"
            );
            if let Some(header) = emitted.header {
                println!("{header}");
            }
            if !emitted.sampled {
                eprintln!(
                    "Trace was not sampled (mode {}, rate {})",
                    config.tracer.trace_mode, config.tracer.sample_rate
                );
            }
        }
        Commands::Init { force } => run_init(force)?,
    }

    Ok(())
}
