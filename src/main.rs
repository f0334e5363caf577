use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gdl_server::config::AppConfig;
use gdl_server::job::channel::FrameWriter;
use gdl_server::job::worker::{self, WorkerArgs};
use gdl_server::job::{JobRunner, Launcher, MarkerPredicate, Supervisor};
use gdl_server::logging::{self, FileSink, Level, LogConfig, LogWriter, Sinks};
use gdl_server::shutdown::{ArchiveLog, CloseLogWriter, DrainConnections};
use gdl_server::{context, web};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "gdl-server")]
#[command(about = "Web front-end for gallery-dl with a live log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web server.
    Serve(ServeArgs),
    /// Run one download and report over stdout (started by the server).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_level: Option<Level>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    downloader: Option<DownloaderArgs>,

    /// Config file (default: ./gdl-server.toml if present).
    #[serde(skip)]
    #[arg(long)]
    config: Option<PathBuf>,
}

/// `--downloader <program>` lands in the `[downloader]` section.
#[derive(Clone, Serialize)]
struct DownloaderArgs {
    program: String,
}

impl std::str::FromStr for DownloaderArgs {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            program: s.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = AppConfig::new(Some(&args), args.config.as_deref())
                .context("Failed to load configuration")?;
            run_server(config).await.context("Failed to run server")
        }
        Commands::Worker(args) => {
            let code = run_worker(args).await;
            std::process::exit(code);
        }
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    let log_file = config.log_file();
    let file_sink = FileSink::open(&log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;
    let log_writer = LogWriter::spawn(
        Sinks::new()
            .with_console(std::io::stdout())
            .with_file(file_sink),
    )
    .context("Failed to start log writer")?;

    logging::init(
        LogConfig {
            level: config.log_level,
        },
        log_writer.clone(),
    )
    .context("Failed to initialise logging")?;

    let launcher = Launcher::new(config.downloader.clone(), config.log_level)
        .context("Failed to prepare worker launcher")?;
    let supervisor = Supervisor::new(Arc::new(log_writer.clone()), config.log_level)
        .with_predicate(MarkerPredicate::new(config.downloader.fatal_markers.clone()));

    let bind_addr = config.bind_addr()?;
    let archive_dir = config.archive_dir.clone();
    let jobs = JobRunner::new(launcher, supervisor);
    let ctx = context::AppContext::new(config, log_writer.clone(), jobs);

    ctx.shutdown.add_hook(DrainConnections::new(ctx.registry.clone()));
    if let Some(archive_dir) = archive_dir {
        ctx.shutdown.add_hook(ArchiveLog::new(log_file, archive_dir, log_writer.clone()));
    }
    ctx.shutdown.add_hook(CloseLogWriter::new(log_writer));

    let signals = tokio::spawn(ctx.shutdown.clone().listen_for_signals());

    let server = web::WebServer::new(ctx.clone(), bind_addr);
    let served = server.start().await;

    // The server also stops on its own errors; make sure the hooks still run.
    ctx.shutdown.trigger("server stopped").await;
    ctx.shutdown.wait_drained().await;
    signals.abort();

    served
}

async fn run_worker(args: WorkerArgs) -> i32 {
    let frames = Arc::new(FrameWriter::stdout());

    if let Err(e) = logging::init(
        LogConfig {
            level: args.log_level,
        },
        frames.clone(),
    ) {
        eprintln!("Failed to initialise worker logging: {e}");
    }

    let code = worker::run(&args, frames.clone()).await;
    if let Err(e) = frames.send_status(code) {
        eprintln!("Failed to report worker status: {e}");
    }
    code
}
