mod config;
mod extractor;
mod fetcher;
mod ledger;
mod parser;
mod proxy;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::warn;

use config::Config;

#[derive(Parser)]
#[command(name = "ia_scraper", about = "Bulk catalog page fetcher and section extractor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch details + download pages for identifiers not yet processed
    Fetch {
        /// Max identifiers to fetch (default: all remaining)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Extract structured sections from fetched pages into JSON records
    Extract {
        /// Max identifiers to extract (default: all remaining)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Fetch + extract in one pipeline
    Run {
        /// Max identifiers to fetch+extract
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show pipeline statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, draining in-flight batch before exit");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let result = match cli.command {
        Commands::Fetch { limit } => {
            let stats = fetcher::run(&cfg, limit, Arc::clone(&shutdown)).await?;
            print_fetch_stats(&stats);
            Ok(())
        }
        Commands::Extract { limit } => {
            let stats = extractor::run(&cfg, limit, Arc::clone(&shutdown))?;
            print_extract_stats(&stats);
            Ok(())
        }
        Commands::Run { limit } => {
            // Phase 1: fetch
            let t_fetch = Instant::now();
            let fetch_stats = fetcher::run(&cfg, limit, Arc::clone(&shutdown)).await?;
            println!(
                "Fetch phase finished in {:.1}s",
                t_fetch.elapsed().as_secs_f64()
            );
            print_fetch_stats(&fetch_stats);

            if shutdown.load(Ordering::SeqCst) {
                println!("Interrupted; skipping extraction phase.");
                return Ok(());
            }

            // Phase 2: extract
            let t_extract = Instant::now();
            let extract_stats = extractor::run(&cfg, limit, Arc::clone(&shutdown))?;
            println!(
                "Extraction phase finished in {:.1}s",
                t_extract.elapsed().as_secs_f64()
            );
            print_extract_stats(&extract_stats);
            Ok(())
        }
        Commands::Stats => {
            let total = if cfg.identifiers_file.exists() {
                ledger::read_identifiers(&cfg.identifiers_file)?.len()
            } else {
                0
            };
            let fetched = ledger::Ledger::load(&cfg.fetch_ledger)?.len();
            let extracted = ledger::Ledger::load(&cfg.extract_ledger())?.len();
            println!("Identifiers:    {}", total);
            println!("Fetched:        {}", fetched);
            println!("Details files:  {}", count_files(&cfg.details_dir));
            println!("Download files: {}", count_files(&cfg.download_dir));
            println!("Extracted:      {}", extracted);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn print_fetch_stats(stats: &fetcher::FetchStats) {
    println!(
        "Fetched: {} identifiers complete, {} partial ({} pages ok, {} failed) of {} total.",
        stats.complete, stats.partial, stats.ok_pages, stats.failed_pages, stats.total_identifiers
    );
}

fn print_extract_stats(stats: &extractor::ExtractStats) {
    println!(
        "Extracted: {} records, {} failed of {} total identifiers.",
        stats.processed, stats.failed, stats.total_identifiers
    );
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0)
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
