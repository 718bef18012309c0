use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;
use tierlru::{CacheConfig, TieredCache};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "tierlru-cli")]
#[command(about = "tierlru CLI - inspect and edit a cache directory", long_about = None)]
struct Args {
    /// Cache directory (ignored when --config is given)
    #[arg(short = 'd', long, default_value = "./cache")]
    dir: PathBuf,

    /// YAML cache configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Memory tier item limit (0 = unlimited)
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Disk tier byte limit (0 = unlimited)
    #[arg(long)]
    disk_limit: Option<u64>,

    /// Trust the running size counter instead of scanning the directory
    #[arg(long)]
    exclusive: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a string value
    Set { key: String, value: String },
    /// Print a value
    Get { key: String },
    /// Remove a key from both tiers
    Del { key: String },
    /// Print entry count and disk usage
    Stats,
    /// Delete every cache file in the directory
    Clear,
}

impl Args {
    fn cache_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)
                .with_context(|| format!("loading config {:?}", path))?,
            None => CacheConfig::new(&self.dir),
        };
        if let Some(limit) = self.memory_limit {
            config.memory_count_limit = limit;
        }
        if let Some(limit) = self.disk_limit {
            config.disk_size_limit = limit;
        }
        if self.exclusive {
            config.exclusive_disk_owner = true;
        }
        Ok(config)
    }
}

fn run(cache: &TieredCache<String, String>, command: &Command) -> Result<String> {
    let output = match command {
        Command::Set { key, value } => {
            let report = cache.set(key.clone(), value.clone());
            debug!(
                "set {}: {} evicted from memory, {} from disk",
                key, report.evicted_from_memory, report.evicted_from_disk
            );
            match report.persisted {
                Ok(_) => "OK".green().to_string(),
                Err(e) => format!("{} ({})", "OK, memory only".yellow(), e),
            }
        }
        Command::Get { key } => match cache.get(key) {
            Some(value) => format!("\"{}\"", value),
            None => "(nil)".dimmed().to_string(),
        },
        Command::Del { key } => {
            let removed = cache.remove(key);
            format!("(integer) {}", u8::from(removed))
        }
        Command::Stats => {
            let disk_bytes = cache
                .total_disk_size()
                .context("measuring disk tier")?;
            serde_json::to_string_pretty(&json!({
                "directory": cache.storage_directory(),
                "entries": cache.len(),
                "on_disk": cache.count_on_disk(),
                "disk_bytes": disk_bytes,
                "disk_limit": cache.config().disk_size_limit,
            }))?
        }
        Command::Clear => {
            cache.clear_disk().context("clearing disk tier")?;
            "OK".green().to_string()
        }
    };
    Ok(output)
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.cache_config()?;
    info!("Opening cache at {:?}", config.storage_directory);

    let start = Instant::now();
    let cache: TieredCache<String, String> =
        TieredCache::open(config).context("opening cache")?;
    let output = run(&cache, &args.command)?;

    println!("{}", output);
    println!("{}", format!("({:.2?})", start.elapsed()).dimmed());
    Ok(())
}
