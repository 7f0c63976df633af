use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, BATCHED_EXTRACT_THRESHOLD, PROGRESS_EVERY};
use crate::ledger::{self, Ledger};
use crate::parser::{self, ExtractedRecord};

/// Extraction run totals.
#[derive(Debug, Default)]
pub struct ExtractStats {
    pub total_identifiers: usize,
    pub processed: usize,
    pub failed: usize,
}

#[derive(Serialize)]
struct Summary {
    total_identifiers: usize,
    successfully_processed: usize,
    failed_processing: usize,
    processing_date: String,
    output_files: SummaryFiles,
    parallel_workers: usize,
}

#[derive(Serialize)]
struct SummaryFiles {
    combined: PathBuf,
    individual_directory: PathBuf,
    processed_tracker: PathBuf,
}

/// Run the extraction pipeline: remaining identifiers in batches through a
/// bounded rayon pool, records written individually and into the combined
/// corpus, ledger persisted after each batch.
pub fn run(cfg: &Config, limit: Option<usize>, shutdown: Arc<AtomicBool>) -> Result<ExtractStats> {
    if !cfg.identifiers_file.exists() {
        bail!(
            "identifier file {} not found",
            cfg.identifiers_file.display()
        );
    }
    let all = ledger::read_identifiers(&cfg.identifiers_file)?;

    fs::create_dir_all(&cfg.output_dir)?;
    fs::create_dir_all(cfg.individual_dir())?;

    let ledger_path = cfg.extract_ledger();
    let mut ledger = Ledger::load(&ledger_path)?;
    if !ledger.is_empty() {
        info!(
            "resuming extraction, {} identifiers already extracted",
            ledger.len()
        );
    }

    let mut remaining = ledger::remaining(&all, &ledger);
    if let Some(n) = limit {
        remaining.truncate(n);
    }

    let mut stats = ExtractStats {
        total_identifiers: all.len(),
        ..ExtractStats::default()
    };
    if remaining.is_empty() {
        println!("All identifiers have already been extracted.");
        return Ok(stats);
    }

    // Very large catalogs also get per-batch JSON snapshots.
    let batched = all.len() > BATCHED_EXTRACT_THRESHOLD;
    if batched {
        info!(
            "{} identifiers exceeds {}, emitting per-batch files",
            all.len(),
            BATCHED_EXTRACT_THRESHOLD
        );
    }

    let extract_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.extract_workers)
        .build()
        .context("failed to build extraction pool")?;
    let save_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.extract_workers.min(10))
        .build()
        .context("failed to build save pool")?;

    let total_batches = ledger::batch_count(remaining.len(), cfg.extract_batch_size);
    info!(
        "{} identifiers to extract in {} batches with {} workers",
        remaining.len(),
        total_batches,
        cfg.extract_workers
    );

    for (batch_index, chunk) in remaining.chunks(cfg.extract_batch_size).enumerate() {
        if shutdown.load(Ordering::SeqCst) {
            warn!(
                "shutdown requested, stopping before batch {}/{}",
                batch_index + 1,
                total_batches
            );
            break;
        }

        let t_batch = Instant::now();
        info!(
            "extraction batch {}/{}: {} identifiers",
            batch_index + 1,
            total_batches,
            chunk.len()
        );

        let records = extract_batch(cfg, &extract_pool, chunk)?;
        let failed = chunk.len() - records.len();

        let saved = save_individual(&save_pool, &cfg.individual_dir(), &records);
        if saved < records.len() {
            warn!("saved only {}/{} individual files", saved, records.len());
        }

        if batched {
            let batch_file = cfg.output_dir.join(format!("batch_{}.json", batch_index + 1));
            fs::write(&batch_file, serde_json::to_string_pretty(&records)?)
                .context(format!("failed to write {}", batch_file.display()))?;
            info!(
                "saved batch file {} with {} records",
                batch_file.display(),
                records.len()
            );
        }

        merge_combined(&cfg.combined_file(), &records)?;

        // Only identifiers with a parseable record enter the ledger; failures
        // are retried in full on the next run.
        ledger.merge(records.iter().map(|r| r.identifier.clone()));
        ledger.persist()?;

        stats.processed += records.len();
        stats.failed += failed;

        info!(
            "extraction batch {}/{} done in {:.1}s: {} extracted, {} failed",
            batch_index + 1,
            total_batches,
            t_batch.elapsed().as_secs_f64(),
            records.len(),
            failed
        );
    }

    let summary = Summary {
        total_identifiers: all.len(),
        successfully_processed: ledger.len(),
        failed_processing: stats.failed,
        processing_date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        output_files: SummaryFiles {
            combined: cfg.combined_file(),
            individual_directory: cfg.individual_dir(),
            processed_tracker: ledger_path,
        },
        parallel_workers: cfg.extract_workers,
    };
    fs::write(cfg.summary_file(), serde_json::to_string_pretty(&summary)?)?;

    Ok(stats)
}

/// Parse one batch's stored pages in parallel. Failures come back as gaps,
/// never as errors that stop the batch.
fn extract_batch(
    cfg: &Config,
    pool: &rayon::ThreadPool,
    chunk: &[String],
) -> Result<Vec<ExtractedRecord>> {
    let pb = ProgressBar::new(chunk.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    let completed = AtomicUsize::new(0);
    let succeeded = AtomicUsize::new(0);

    let records: Vec<ExtractedRecord> = pool.install(|| {
        chunk
            .par_iter()
            .filter_map(|identifier| {
                let record =
                    parser::process_identifier(identifier, &cfg.details_dir, &cfg.download_dir);
                if record.is_some() {
                    succeeded.fetch_add(1, Ordering::Relaxed);
                }
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % PROGRESS_EVERY == 0 {
                    let ok = succeeded.load(Ordering::Relaxed);
                    info!(
                        "extraction progress: {}/{} ({} success, {} failed)",
                        done,
                        chunk.len(),
                        ok,
                        done - ok
                    );
                }
                pb.inc(1);
                record
            })
            .collect()
    });
    pb.finish_and_clear();

    Ok(records)
}

/// Write one JSON file per record, in parallel. Returns how many were saved.
fn save_individual(pool: &rayon::ThreadPool, dir: &Path, records: &[ExtractedRecord]) -> usize {
    let saved = AtomicUsize::new(0);
    pool.install(|| {
        records.par_iter().for_each(|record| {
            let path = dir.join(format!("{}.json", record.identifier));
            let json = match serde_json::to_string_pretty(record) {
                Ok(json) => json,
                Err(e) => {
                    warn!("error serializing {}: {}", record.identifier, e);
                    return;
                }
            };
            match fs::write(&path, json) {
                Ok(()) => {
                    saved.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("error saving {}: {}", record.identifier, e),
            }
        });
    });
    saved.load(Ordering::Relaxed)
}

/// Merge new records into the combined array, deduplicated by identifier.
/// A re-extracted identifier replaces its previous record in place.
fn merge_combined(path: &Path, new_records: &[ExtractedRecord]) -> Result<()> {
    let mut combined: Vec<ExtractedRecord> = match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .context(format!("corrupt combined file {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(e).context(format!("failed to read combined file {}", path.display()))
        }
    };

    let mut index: HashMap<String, usize> = combined
        .iter()
        .enumerate()
        .map(|(i, r)| (r.identifier.clone(), i))
        .collect();

    for record in new_records {
        match index.get(&record.identifier) {
            Some(&i) => combined[i] = record.clone(),
            None => {
                index.insert(record.identifier.clone(), combined.len());
                combined.push(record.clone());
            }
        }
    }

    fs::write(path, serde_json::to_string_pretty(&combined)?)
        .context(format!("failed to write combined file {}", path.display()))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const DETAILS: &str = r#"<html><body>
        <div class="row metadata-list" role="list">meta</div>
        <div id="descript" itemprop="description">dc.identifier.origpath: /5/items/foo/bar.pdf</div>
        <div class="metadata-expandable-list row" role="list">more</div>
        </body></html>"#;
    const DOWNLOAD: &str =
        r#"<html><body><table class="directory-listing-table"><tr><td>f</td></tr></table></body></html>"#;

    fn test_config(root: &Path) -> Config {
        Config {
            identifiers_file: root.join("identifiers.txt"),
            details_dir: root.join("raw_html/details"),
            download_dir: root.join("raw_html/download"),
            output_dir: root.join("extracted_data"),
            base_url: "https://archive.org".into(),
            proxy_file: root.join("proxies.txt"),
            fetch_workers: 4,
            extract_workers: 2,
            fetch_batch_size: 100,
            extract_batch_size: 100,
            fetch_ledger: root.join("processed_identifiers.txt"),
            batch_marker: root.join("batch_progress.txt"),
        }
    }

    fn write_pages(cfg: &Config, identifier: &str) {
        fs::create_dir_all(&cfg.details_dir).unwrap();
        fs::create_dir_all(&cfg.download_dir).unwrap();
        fs::write(
            cfg.details_dir.join(format!("{identifier}.html")),
            DETAILS,
        )
        .unwrap();
        fs::write(
            cfg.download_dir.join(format!("{identifier}.html")),
            DOWNLOAD,
        )
        .unwrap();
    }

    fn no_shutdown() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn extracts_and_tracks_only_successes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fs::write(&cfg.identifiers_file, "item-a\nitem-b\n").unwrap();
        write_pages(&cfg, "item-a");
        // item-b has a details page but no download page.
        fs::write(cfg.details_dir.join("item-b.html"), DETAILS).unwrap();

        let stats = run(&cfg, None, no_shutdown()).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);

        let tracked = fs::read_to_string(cfg.extract_ledger()).unwrap();
        assert_eq!(tracked.trim(), "item-a");

        assert!(cfg.individual_dir().join("item-a.json").exists());
        assert!(!cfg.individual_dir().join("item-b.json").exists());

        let combined: Vec<ExtractedRecord> =
            serde_json::from_str(&fs::read_to_string(cfg.combined_file()).unwrap()).unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].identifier, "item-a");
        assert_eq!(
            combined[0].origpath.as_deref(),
            Some("/5/items/foo/bar.pdf")
        );

        assert!(cfg.summary_file().exists());
    }

    #[test]
    fn second_run_skips_extracted_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fs::write(&cfg.identifiers_file, "item-a\n").unwrap();
        write_pages(&cfg, "item-a");

        let first = run(&cfg, None, no_shutdown()).unwrap();
        assert_eq!(first.processed, 1);
        let combined_before = fs::read_to_string(cfg.combined_file()).unwrap();

        let second = run(&cfg, None, no_shutdown()).unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.failed, 0);
        assert_eq!(
            fs::read_to_string(cfg.combined_file()).unwrap(),
            combined_before
        );
    }

    #[test]
    fn failed_identifier_retries_after_files_appear() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fs::write(&cfg.identifiers_file, "item-a\n").unwrap();

        let first = run(&cfg, None, no_shutdown()).unwrap();
        assert_eq!(first.processed, 0);
        assert_eq!(first.failed, 1);

        write_pages(&cfg, "item-a");
        let second = run(&cfg, None, no_shutdown()).unwrap();
        assert_eq!(second.processed, 1);
    }

    #[test]
    fn merge_replaces_by_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all_data.json");

        let mut record = ExtractedRecord {
            identifier: "item-a".into(),
            origpath: None,
            section1: "old".into(),
            section2: String::new(),
            section3: String::new(),
            section4: String::new(),
        };
        merge_combined(&path, std::slice::from_ref(&record)).unwrap();

        record.section1 = "new".into();
        let other = ExtractedRecord {
            identifier: "item-b".into(),
            ..record.clone()
        };
        merge_combined(&path, &[record, other]).unwrap();

        let combined: Vec<ExtractedRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].identifier, "item-a");
        assert_eq!(combined[0].section1, "new");
        assert_eq!(combined[1].identifier, "item-b");
    }
}
