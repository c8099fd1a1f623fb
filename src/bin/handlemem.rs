//! handlemem command-line tool
//!
//! Inspect handles, print the effective configuration and exercise the
//! allocator with a synthetic workload.
//!
//! # Examples
//!
//! ```bash
//! # Decode a handle
//! handlemem decode 0x8000000100000040
//!
//! # Allocate, verify and free 10000 chunks
//! handlemem stress --count 10000 --max-size 8192
//!
//! # Show effective configuration
//! handlemem config --file handlemem.toml
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use handlemem::{Handle, HandleAllocator, MemoryConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// handlemem - handle-addressed memory allocator
#[derive(Parser, Debug)]
#[command(name = "handlemem")]
#[command(version = handlemem::VERSION)]
#[command(about = "Handle-addressed memory allocator tools", long_about = None)]
#[command(author = "Anton Feldmann <anton.feldmann@gmail.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "HANDLEMEM_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "HANDLEMEM_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a raw handle into its regime and coordinates
    Decode {
        /// Handle value, decimal or 0x-prefixed hexadecimal
        handle: String,
    },

    /// Run an allocate/write/verify/free workload
    Stress(StressArgs),

    /// Print the effective configuration
    Config {
        /// Configuration file to load instead of the global one
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct StressArgs {
    /// Number of allocations
    #[arg(short, long, default_value = "10000")]
    count: usize,

    /// Largest allocation size in bytes
    #[arg(long, default_value = "4096")]
    max_size: usize,

    /// Free every n-th allocation before verifying the rest
    #[arg(long, default_value = "2")]
    free_every: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    match cli.command {
        Commands::Decode { ref handle } => decode_command(handle),
        Commands::Stress(ref args) => stress_command(cli.config.clone(), args),
        Commands::Config { ref file } => config_command(file.clone().or(cli.config.clone())),
        Commands::Version => {
            println!("handlemem {}", handlemem::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "handlemem.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn parse_handle(raw: &str) -> anyhow::Result<Handle> {
    let value = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    }
    .with_context(|| format!("'{}' is not a valid handle value", raw))?;

    Ok(Handle::from_raw(value))
}

fn decode_command(raw: &str) -> anyhow::Result<()> {
    let handle = parse_handle(raw)?;
    let location = handle.decode()?;

    println!("{}", handle);
    println!("  {}", location);
    if let Some(limit) = handle.limit() {
        println!("  addressable up to position {}", limit);
    }
    Ok(())
}

fn stress_command(config_path: Option<PathBuf>, args: &StressArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.max_size > 0, "--max-size must be positive");
    anyhow::ensure!(args.free_every > 0, "--free-every must be positive");

    let config = MemoryConfig::load(config_path.as_deref())?;
    let allocator = HandleAllocator::with_config(&config)?;

    info!(count = args.count, max_size = args.max_size, "Starting stress run");

    let mut live = Vec::with_capacity(args.count);
    for i in 0..args.count {
        // spread sizes over both small and big regimes
        let size = i.wrapping_mul(7919) % args.max_size + 1;
        let handle = allocator.allocate(size)?;
        allocator.fill(handle, size, (i % 251) as u8)?;
        live.push((i, size, handle));
    }

    let mut freed = 0;
    live.retain(|&(i, _, handle)| {
        if i % args.free_every != 0 {
            return true;
        }
        match allocator.free(handle) {
            Ok(()) => freed += 1,
            Err(e) => warn!(handle = %handle, "Free failed: {}", e),
        }
        false
    });

    let mut bytes = Vec::new();
    for &(i, size, handle) in &live {
        bytes.resize(size, 0);
        allocator.copy_to_external(handle, &mut bytes)?;
        let expected = (i % 251) as u8;
        anyhow::ensure!(
            bytes.iter().all(|&b| b == expected),
            "Allocation {} at {} lost its contents",
            i,
            handle
        );
    }

    info!(freed, verified = live.len(), "Stress run complete");
    println!("{}", serde_json::to_string_pretty(&allocator.stats())?);

    for &(_, _, handle) in &live {
        allocator.free(handle)?;
    }
    Ok(())
}

fn config_command(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = MemoryConfig::load(path.as_deref())?;
    print!("{}", config.to_toml()?);
    Ok(())
}
