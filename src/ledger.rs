use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Durable set of fully completed identifiers.
///
/// Persisted as a sorted, newline-delimited list, fully overwritten on each
/// persist. Callers persist only after a batch has completely drained, so a
/// crash mid-write loses at most that batch's additions.
pub struct Ledger {
    path: PathBuf,
    done: HashSet<String>,
}

impl Ledger {
    /// Load the ledger file. A missing file is an empty ledger, not an error.
    pub fn load(path: &Path) -> Result<Ledger> {
        let done = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e).context(format!("failed to read ledger {}", path.display()))
            }
        };
        Ok(Ledger {
            path: path.to_path_buf(),
            done,
        })
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.done.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    /// Union in newly completed identifiers. Duplicates are no-ops.
    pub fn merge<I>(&mut self, newly_done: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.done.extend(newly_done);
    }

    /// Write the full set, sorted, overwriting the previous file.
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut sorted: Vec<&str> = self.done.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        fs::write(&self.path, sorted.join("\n"))
            .context(format!("failed to persist ledger {}", self.path.display()))
    }
}

/// Identifiers not yet in the ledger, input order preserved.
pub fn remaining(all: &[String], ledger: &Ledger) -> Vec<String> {
    all.iter()
        .filter(|id| !ledger.contains(id))
        .cloned()
        .collect()
}

/// Read the newline-delimited identifier list. Blank lines are ignored.
pub fn read_identifiers(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .context(format!("failed to read identifier list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Mid-batch resume marker: `"<batch_index>,<offset_within_batch>"`.
///
/// Written before a batch starts and refreshed during it; deleted once the
/// batch's results are folded into the ledger. A restarted run skips the
/// already-dispatched prefix of a partially completed batch.
pub struct BatchMarker {
    path: PathBuf,
}

impl BatchMarker {
    pub fn new(path: &Path) -> BatchMarker {
        BatchMarker {
            path: path.to_path_buf(),
        }
    }

    pub fn load(&self) -> Option<(usize, usize)> {
        let text = fs::read_to_string(&self.path).ok()?;
        let (batch, offset) = text.trim().split_once(',')?;
        Some((batch.parse().ok()?, offset.parse().ok()?))
    }

    pub fn save(&self, batch_index: usize, offset: usize) -> Result<()> {
        fs::write(&self.path, format!("{},{}", batch_index, offset))
            .context(format!("failed to write batch marker {}", self.path.display()))
    }

    pub fn clear(&self) {
        if fs::remove_file(&self.path).is_ok() {
            info!("cleared batch marker {}", self.path.display());
        }
    }
}

/// Number of batches needed to cover `total` items in slices of `batch_size`.
pub fn batch_count(total: usize, batch_size: usize) -> usize {
    total.div_ceil(batch_size)
}

// ── Tests ──
