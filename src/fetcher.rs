use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::config::{
    Config, BASE_BACKOFF_MS, BATCH_PAUSE, HTTP_TIMEOUT, MARKER_EVERY, MAX_ATTEMPTS,
    PROGRESS_EVERY, RETRY_STATUS, USER_AGENT,
};
use crate::ledger::{self, BatchMarker, Ledger};
use crate::proxy::ProxyPool;

/// The two pages fetched per identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Details,
    Download,
}

impl PageKind {
    fn segment(self) -> &'static str {
        match self {
            PageKind::Details => "details",
            PageKind::Download => "download",
        }
    }

    fn output_dir(self, cfg: &Config) -> &Path {
        match self {
            PageKind::Details => &cfg.details_dir,
            PageKind::Download => &cfg.download_dir,
        }
    }
}

fn page_url(base_url: &str, kind: PageKind, identifier: &str) -> String {
    format!("{}/{}/{}", base_url, kind.segment(), identifier)
}

struct PageResult {
    identifier: String,
    kind: PageKind,
    ok: bool,
}

/// Per-identifier success flags for the two page fetches.
#[derive(Debug, Default, Clone, Copy)]
struct UnitProgress {
    details: bool,
    download: bool,
}

impl UnitProgress {
    fn complete(self) -> bool {
        self.details && self.download
    }

    fn partial(self) -> bool {
        self.details != self.download
    }
}

/// Per-batch aggregation of task results. Completion order is arbitrary;
/// every result carries its identifier and page kind, so units are never
/// confused under concurrency.
#[derive(Default)]
struct BatchOutcome {
    units: HashMap<String, UnitProgress>,
    ok_pages: usize,
    failed_pages: usize,
}

impl BatchOutcome {
    fn record(&mut self, identifier: &str, kind: PageKind, ok: bool) {
        if ok {
            self.ok_pages += 1;
            let unit = self.units.entry(identifier.to_string()).or_default();
            match kind {
                PageKind::Details => unit.details = true,
                PageKind::Download => unit.download = true,
            }
        } else {
            self.failed_pages += 1;
        }
    }

    fn unit(&self, identifier: &str) -> UnitProgress {
        self.units.get(identifier).copied().unwrap_or_default()
    }
}

/// Fetch run totals across all batches.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub total_identifiers: usize,
    pub complete: usize,
    pub partial: usize,
    pub ok_pages: usize,
    pub failed_pages: usize,
}

/// Run the fetch pipeline: remaining identifiers in batches, two pages per
/// identifier under a bounded worker pool, ledger persisted after each batch.
pub async fn run(
    cfg: &Config,
    limit: Option<usize>,
    shutdown: Arc<AtomicBool>,
) -> Result<FetchStats> {
    if !cfg.identifiers_file.exists() {
        bail!(
            "identifier file {} not found",
            cfg.identifiers_file.display()
        );
    }
    let all = ledger::read_identifiers(&cfg.identifiers_file)?;
    let mut ledger = Ledger::load(&cfg.fetch_ledger)?;
    if !ledger.is_empty() {
        info!(
            "resuming from previous run, {} identifiers already fetched",
            ledger.len()
        );
    }

    let mut remaining = ledger::remaining(&all, &ledger);
    if let Some(n) = limit {
        remaining.truncate(n);
    }

    let mut stats = FetchStats {
        total_identifiers: all.len(),
        ..FetchStats::default()
    };
    if remaining.is_empty() {
        println!("All identifiers have already been fetched.");
        return Ok(stats);
    }

    tokio::fs::create_dir_all(&cfg.details_dir).await?;
    tokio::fs::create_dir_all(&cfg.download_dir).await?;

    let proxies = Arc::new(ProxyPool::load(&cfg.proxy_file));
    let client = Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;

    let batch_size = cfg.fetch_batch_size;
    let total_batches = ledger::batch_count(remaining.len(), batch_size);
    let marker = BatchMarker::new(&cfg.batch_marker);
    let (first_batch, mut resume_offset) = marker.load().unwrap_or((0, 0));
    if first_batch > 0 || resume_offset > 0 {
        info!(
            "resuming from batch {} at in-batch offset {}",
            first_batch + 1,
            resume_offset
        );
    }

    info!(
        "{} identifiers to fetch ({} pages) in {} batches of up to {}",
        remaining.len(),
        remaining.len() * 2,
        total_batches,
        batch_size
    );

    for batch_index in first_batch..total_batches {
        if shutdown.load(Ordering::SeqCst) {
            warn!(
                "shutdown requested, stopping before batch {}/{}",
                batch_index + 1,
                total_batches
            );
            break;
        }

        let base_offset = resume_offset;
        resume_offset = 0;
        let start = batch_index * batch_size + base_offset;
        let end = ((batch_index + 1) * batch_size).min(remaining.len());
        if start >= end {
            marker.clear();
            continue;
        }
        let batch = &remaining[start..end];

        info!(
            "batch {}/{}: {} identifiers ({} pages), {} proxies available",
            batch_index + 1,
            total_batches,
            batch.len(),
            batch.len() * 2,
            proxies.len()
        );
        marker.save(batch_index, base_offset)?;

        let t_batch = Instant::now();
        let outcome = run_batch(
            cfg,
            &client,
            &proxies,
            batch,
            batch_index,
            base_offset,
            &marker,
        )
        .await?;

        let mut complete = Vec::new();
        let mut partial = 0usize;
        for identifier in batch {
            let unit = outcome.unit(identifier);
            if unit.complete() {
                complete.push(identifier.clone());
            } else if unit.partial() {
                partial += 1;
                info!("identifier {} partially processed: 1/2 files", identifier);
            }
        }

        stats.ok_pages += outcome.ok_pages;
        stats.failed_pages += outcome.failed_pages;
        stats.complete += complete.len();
        stats.partial += partial;

        // Partial units stay out of the ledger so the next run redoes both pages.
        ledger.merge(complete.iter().cloned());
        ledger.persist()?;
        marker.clear();

        info!(
            "batch {}/{} done in {:.1}s: {} pages ok, {} failed, {} identifiers complete, {} partial",
            batch_index + 1,
            total_batches,
            t_batch.elapsed().as_secs_f64(),
            outcome.ok_pages,
            outcome.failed_pages,
            complete.len(),
            partial
        );

        if batch_index + 1 < total_batches && !shutdown.load(Ordering::SeqCst) {
            info!("pausing {}s before next batch", BATCH_PAUSE.as_secs());
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }

    Ok(stats)
}

/// Execute one batch's page fetches under the semaphore, streaming results
/// back over a channel and folding them as they arrive.
async fn run_batch(
    cfg: &Config,
    client: &Client,
    proxies: &Arc<ProxyPool>,
    batch: &[String],
    batch_index: usize,
    base_offset: usize,
    marker: &BatchMarker,
) -> Result<BatchOutcome> {
    let semaphore = Arc::new(Semaphore::new(cfg.fetch_workers));
    let (tx, mut rx) = mpsc::channel::<PageResult>(cfg.fetch_workers * 2);
    let total_pages = batch.len() * 2;

    let pb = ProgressBar::new(total_pages as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    for identifier in batch {
        for kind in [PageKind::Details, PageKind::Download] {
            let url = page_url(&cfg.base_url, kind, identifier);
            let path = kind.output_dir(cfg).join(format!("{identifier}.html"));
            let client = client.clone();
            let proxies = Arc::clone(proxies);
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            let identifier = identifier.clone();

            tokio::spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                let ok = fetch_page(&client, &proxies, &url, &path).await;
                let _ = tx.send(PageResult { identifier, kind, ok }).await;
            });
        }
    }
    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut outcome = BatchOutcome::default();
    let mut completed = 0usize;
    let t0 = Instant::now();

    while let Some(result) = rx.recv().await {
        completed += 1;
        outcome.record(&result.identifier, result.kind, result.ok);
        pb.inc(1);

        if completed % PROGRESS_EVERY == 0 {
            let rate = completed as f64 / t0.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                "batch {}: {}/{} pages ({} ok, {} failed, {:.1} pages/sec, {} proxies left)",
                batch_index + 1,
                completed,
                total_pages,
                outcome.ok_pages,
                outcome.failed_pages,
                rate,
                proxies.len()
            );
        }
        if completed % MARKER_EVERY == 0 {
            // Estimated identifier offset; dispatched-but-unfinished work past
            // it is refetched on resume.
            marker.save(batch_index, base_offset + completed / 2)?;
        }
    }
    pb.finish_and_clear();

    Ok(outcome)
}

/// Fetch one page and write the body verbatim to `path`.
/// All failures are reported as `false`; nothing escapes this boundary.
async fn fetch_page(client: &Client, proxies: &ProxyPool, url: &str, path: &Path) -> bool {
    let body = match fetch_with_retry(client, proxies, url).await {
        Ok(body) => body,
        Err(e) => {
            warn!("failed to retrieve {}: {}", url, e);
            return false;
        }
    };
    if let Err(e) = write_page(path, &body).await {
        warn!("file system error for {}: {}", path.display(), e);
        return false;
    }
    true
}

async fn write_page(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    Ok(())
}

async fn fetch_with_retry(client: &Client, proxies: &ProxyPool, url: &str) -> Result<String> {
    let mut last_err = anyhow!("no attempts made for {}", url);
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let proxy = proxies.pick();
        match fetch_once(client, proxy.as_deref(), url).await {
            Ok((status, body)) if status.is_success() => return Ok(body),
            Ok((status, _)) if is_retryable(status.as_u16()) => {
                warn!(
                    "HTTP {} for {} (attempt {}/{})",
                    status,
                    url,
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                last_err = anyhow!("HTTP {} for {}", status, url);
            }
            Ok((status, _)) => bail!("HTTP {} for {}", status, url),
            Err(e) => {
                // The failure is charged to the proxy actually used for this
                // request, not whatever the pool holds by now.
                if let Some(p) = &proxy {
                    proxies.remove(p);
                }
                last_err = e.into();
            }
        }
    }
    Err(last_err)
}

async fn fetch_once(
    client: &Client,
    proxy: Option<&str>,
    url: &str,
) -> reqwest::Result<(StatusCode, String)> {
    let response = match proxy {
        Some(p) => proxied_client(p)?.get(url).send().await?,
        None => client.get(url).send().await?,
    };
    let status = response.status();
    let body = response.text().await?;
    Ok((status, body))
}

/// reqwest pins the proxy at client construction, so rotation builds a
/// short-lived client around the chosen entry.
fn proxied_client(proxy: &str) -> reqwest::Result<Client> {
    Client::builder()
        .proxy(reqwest::Proxy::all(proxy)?)
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

fn is_retryable(status: u16) -> bool {
    RETRY_STATUS.contains(&status)
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_urls() {
        assert_eq!(
            page_url("https://archive.org", PageKind::Details, "item-a"),
            "https://archive.org/details/item-a"
        );
        assert_eq!(
            page_url("https://archive.org", PageKind::Download, "item-a"),
            "https://archive.org/download/item-a"
        );
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable(status));
        }
        for status in [200, 301, 403, 404] {
            assert!(!is_retryable(status));
        }
    }

    #[test]
    fn backoff_doubles_from_half_second() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn unit_complete_requires_both_pages() {
        let mut outcome = BatchOutcome::default();
        outcome.record("a", PageKind::Details, true);
        outcome.record("a", PageKind::Download, true);
        outcome.record("b", PageKind::Details, true);
        outcome.record("b", PageKind::Download, false);

        assert!(outcome.unit("a").complete());
        assert!(!outcome.unit("b").complete());
        assert!(outcome.unit("b").partial());
        assert_eq!(outcome.ok_pages, 3);
        assert_eq!(outcome.failed_pages, 1);
    }

    #[test]
    fn fully_failed_unit_is_not_partial() {
        let mut outcome = BatchOutcome::default();
        outcome.record("c", PageKind::Details, false);
        outcome.record("c", PageKind::Download, false);

        let unit = outcome.unit("c");
        assert!(!unit.complete());
        assert!(!unit.partial());
    }

    #[test]
    fn completion_order_does_not_confuse_units() {
        let mut outcome = BatchOutcome::default();
        // Interleaved completions from different identifiers.
        outcome.record("b", PageKind::Download, true);
        outcome.record("a", PageKind::Details, true);
        outcome.record("b", PageKind::Details, true);
        outcome.record("a", PageKind::Download, true);

        assert!(outcome.unit("a").complete());
        assert!(outcome.unit("b").complete());
    }
}
