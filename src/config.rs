use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(50);
pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_BACKOFF_MS: u64 = 500;
pub const RETRY_STATUS: &[u16] = &[429, 500, 502, 503, 504];

/// Pause between fetch batches so the server gets a breather.
pub const BATCH_PAUSE: Duration = Duration::from_secs(15);

/// Log running success/fail counts every N completed tasks.
pub const PROGRESS_EVERY: usize = 100;
/// Refresh the mid-batch resume marker every N completed tasks.
pub const MARKER_EVERY: usize = 500;

/// Above this many input identifiers the extractor also emits per-batch JSON files.
pub const BATCHED_EXTRACT_THRESHOLD: usize = 200_000;

/// Runtime configuration, environment-overridable with fixed defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub identifiers_file: PathBuf,
    pub details_dir: PathBuf,
    pub download_dir: PathBuf,
    pub output_dir: PathBuf,
    pub base_url: String,
    pub proxy_file: PathBuf,
    pub fetch_workers: usize,
    pub extract_workers: usize,
    pub fetch_batch_size: usize,
    pub extract_batch_size: usize,
    pub fetch_ledger: PathBuf,
    pub batch_marker: PathBuf,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            identifiers_file: env_path("IDENTIFIERS_FILE", "identifiers.txt"),
            details_dir: env_path("DETAILS_DIR", "raw_html/details"),
            download_dir: env_path("DOWNLOAD_DIR", "raw_html/download"),
            output_dir: env_path("OUTPUT_DIR", "extracted_data"),
            base_url: env_or("BASE_URL", "https://archive.org"),
            proxy_file: env_path("PROXY_FILE", "proxies.txt"),
            fetch_workers: env_usize("FETCH_WORKERS", 40),
            extract_workers: env_usize("EXTRACT_WORKERS", 20),
            fetch_batch_size: env_usize("FETCH_BATCH_SIZE", 5000),
            extract_batch_size: env_usize("EXTRACT_BATCH_SIZE", 50_000),
            fetch_ledger: env_path("FETCH_LEDGER", "processed_identifiers.txt"),
            batch_marker: env_path("BATCH_MARKER", "batch_progress.txt"),
        }
    }

    pub fn extract_ledger(&self) -> PathBuf {
        self.output_dir.join("processed_extracted_identifiers.txt")
    }

    pub fn combined_file(&self) -> PathBuf {
        self.output_dir.join("all_data.json")
    }

    pub fn individual_dir(&self) -> PathBuf {
        self.output_dir.join("individual")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.output_dir.join("processing_summary.json")
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_or(key, default))
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
