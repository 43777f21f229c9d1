use std::{
    io,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chartographer", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve newline-delimited JSON requests from stdin, one JSON response per line on stdout.
    Serve(ServeArgs),
    /// Write a single blank canvas file.
    Blank(BlankArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Engine config JSON. Flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding canvas files.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Number of chunks each pixel copy is split into.
    #[arg(long)]
    workers: Option<usize>,

    /// Override rayon worker threads for pixel copies.
    #[arg(long)]
    threads: Option<usize>,

    /// Requests executed at once. Responses keep request order either way.
    #[arg(long)]
    jobs: Option<usize>,
}

#[derive(Parser, Debug)]
struct BlankArgs {
    #[arg(long)]
    width: i64,

    #[arg(long)]
    height: i64,

    /// Output bitmap path.
    #[arg(long)]
    out: PathBuf,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve(args) => cmd_serve(args),
        Command::Blank(args) => cmd_blank(args),
    }
}

// stdout carries protocol responses, so logs go to stderr.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => chartographer::StoreConfig::from_path(path)?,
        None => chartographer::StoreConfig::default(),
    };
    if let Some(root) = args.root {
        config.storage_root = root;
    }
    if let Some(workers) = args.workers {
        config.copy_workers = workers;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if let Some(jobs) = args.jobs {
        config.request_workers = jobs;
    }

    let registry = Arc::new(
        chartographer::Registry::open(config).context("open canvas registry")?,
    );
    let workers = registry.config().request_workers;
    tracing::info!(
        root = %registry.config().storage_root.display(),
        live = registry.live_ids().len(),
        workers,
        "serving canvas requests on stdin"
    );

    let service = chartographer::Service::with_request_workers(registry, workers)?;
    service.serve_lines(io::stdin().lock(), io::stdout())?;

    tracing::info!("input closed, exiting");
    Ok(())
}

fn cmd_blank(args: BlankArgs) -> anyhow::Result<()> {
    let size = chartographer::CanvasSize::new(args.width, args.height)?;

    if let Some(parent) = args.out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    chartographer::raster::codec::write_blank_canvas(&args.out, size)?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}
