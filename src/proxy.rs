use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use tracing::{info, warn};

/// Shared pool of proxy endpoints for outbound requests.
///
/// Removal is the only mutation and is monotonic for the lifetime of a run;
/// the pool is never persisted, so removed entries come back on restart.
pub struct ProxyPool {
    entries: Mutex<Vec<String>>,
}

impl ProxyPool {
    pub fn new(entries: Vec<String>) -> ProxyPool {
        ProxyPool {
            entries: Mutex::new(entries),
        }
    }

    /// Load a newline-delimited proxy list. Blank lines and `#` comments are
    /// skipped; a missing file means direct connections.
    pub fn load(path: &Path) -> ProxyPool {
        let entries: Vec<String> = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect(),
            Err(_) => Vec::new(),
        };
        if entries.is_empty() {
            info!("no proxies configured, using direct connections");
        } else {
            info!("loaded {} proxies from {}", entries.len(), path.display());
        }
        ProxyPool::new(entries)
    }

    /// Random entry, or `None` once the pool is empty.
    pub fn pick(&self) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.choose(&mut rand::thread_rng()).cloned()
    }

    /// Remove a confirmed-bad entry. Removing an already-removed entry is a
    /// no-op, so concurrent removal attempts are safe.
    pub fn remove(&self, proxy: &str) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|p| p != proxy);
        if entries.len() < before {
            warn!("removed failed proxy, {} remaining", entries.len());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ──
