//! Coordinates many fetch+extract pipelines over a work list.
//!
//! Each item runs fetch -> classify -> extract -> merge -> validate -> commit
//! strictly in order, but items themselves run concurrently up to the
//! configured limit and commit in completion order. Every outcome hits the
//! store immediately, so an interrupt loses at most the in-flight items.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;

use crate::classifier::ContentClassifier;
use crate::controls::HarvestControls;
use crate::extractor::FieldExtractor;
use crate::fetch::{FetchError, FetchExecutor};
use crate::page::parse_document;
use crate::record::{Incident, ScrapeFailure};
use crate::store::{RecordStore, StoreError};

/// What to process this run.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Skip identifiers already complete in the store.
    Incremental,
    /// Re-process everything on the roster.
    Force,
    /// Only identifiers currently present in the failure log.
    RetryFailed,
    /// An explicit identifier subset.
    Targeted(HashSet<String>),
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub no_address: usize,
    pub descriptions_found: usize,
    pub references_found: usize,
    pub related_found: usize,
    pub peak_in_flight: usize,
}

impl RunSummary {
    /// Prints the run report.
    pub fn report(&self) {
        println!("--- harvest summary ---");
        println!("selected: {}", self.total);
        println!("succeeded: {}", self.succeeded);
        println!("failed: {}", self.failed);
        println!("skipped (already complete): {}", self.skipped);
        println!("no detail address: {}", self.no_address);
        println!("descriptions found: {}", self.descriptions_found);
        println!("source references found: {}", self.references_found);
        println!("related records found: {}", self.related_found);
        println!("peak concurrent pipelines: {}", self.peak_in_flight);
    }
}

#[derive(Default)]
struct RunStats {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    no_address: AtomicUsize,
    descriptions: AtomicUsize,
    references: AtomicUsize,
    related: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RunStats {
    fn snapshot(&self, total: usize, skipped: usize) -> RunSummary {
        RunSummary {
            total,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped,
            no_address: self.no_address.load(Ordering::Relaxed),
            descriptions_found: self.descriptions.load(Ordering::Relaxed),
            references_found: self.references.load(Ordering::Relaxed),
            related_found: self.related.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// RAII marker for one running pipeline; tracks the concurrency high-water
/// mark so the bound is observable from outside.
struct InFlightGuard<'a> {
    stats: &'a RunStats,
}

impl<'a> InFlightGuard<'a> {
    fn new(stats: &'a RunStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        Self { stats }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Shared {
    store: Arc<RecordStore>,
    fetcher: FetchExecutor,
    classifier: ContentClassifier,
    extractor: FieldExtractor,
    controls: HarvestControls,
    stats: RunStats,
    stop: Arc<AtomicBool>,
    succeeded_ids: Mutex<Vec<String>>,
}

/// Drives a whole harvest run against the shared record store.
pub struct AcquisitionScheduler {
    store: Arc<RecordStore>,
    fetcher: FetchExecutor,
    controls: HarvestControls,
    stop: Arc<AtomicBool>,
}

impl AcquisitionScheduler {
    pub fn new(store: Arc<RecordStore>, fetcher: FetchExecutor, controls: HarvestControls) -> Self {
        Self {
            store,
            fetcher,
            controls,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative stop switch: flips checked at item boundaries, so
    /// in-flight pipelines finish normally and no write is torn.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the roster through the pipeline under the configured mode.
    ///
    /// Per-item failures are isolated into the failure log; only store-level
    /// write failures abort the run.
    pub async fn run(&self, roster: Vec<Incident>, mode: RunMode) -> Result<RunSummary, StoreError> {
        let (selected, skipped) = self.select(roster, &mode);
        let total = selected.len();
        info!(total, skipped, ?mode, "starting harvest run");

        // All structural removals happen before any pipeline launches, so
        // rewrites never race appends for the same identifiers.
        let reprocess_ids: HashSet<String> = selected
            .iter()
            .map(|item| item.aiaaic_id.clone())
            .filter(|id| self.store.exists(id))
            .collect();
        let removed = self.store.remove_ids(&reprocess_ids)?;
        if removed > 0 {
            info!(removed, "removed prior records before reprocessing");
        }
        if matches!(mode, RunMode::RetryFailed | RunMode::Targeted(_)) {
            let batch: HashSet<String> =
                selected.iter().map(|item| item.aiaaic_id.clone()).collect();
            self.store.remove_failures(&batch)?;
        }

        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            fetcher: self.fetcher.clone(),
            classifier: ContentClassifier::default(),
            extractor: FieldExtractor::default(),
            controls: self.controls.clone(),
            stats: RunStats::default(),
            stop: Arc::clone(&self.stop),
            succeeded_ids: Mutex::new(Vec::new()),
        });

        let semaphore = Arc::new(Semaphore::new(self.controls.concurrency()));
        let mut handles = Vec::with_capacity(selected.len());
        for item in selected {
            let shared = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                if shared.stop.load(Ordering::Acquire) {
                    return Ok(());
                }
                let _in_flight = InFlightGuard::new(&shared.stats);
                process_item(&shared, item).await
            }));
        }

        let mut first_error: Option<StoreError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // Store write failure is process-fatal: stop admitting
                    // work and surface it after the in-flight items settle.
                    self.stop.store(true, Ordering::Release);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => warn!(%join_err, "pipeline task panicked"),
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        // Failure entries are superseded once their identifier succeeds.
        let succeeded: HashSet<String> = shared
            .succeeded_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        let stale: HashSet<String> = self
            .store
            .failure_ids()
            .intersection(&succeeded)
            .cloned()
            .collect();
        self.store.remove_failures(&stale)?;

        Ok(shared.stats.snapshot(total, skipped))
    }

    /// Applies the mode filter and deduplicates the work list by identifier,
    /// so no two pipelines ever share one.
    fn select(&self, roster: Vec<Incident>, mode: &RunMode) -> (Vec<Incident>, usize) {
        let failure_ids = self.store.failure_ids();
        let mut seen: HashSet<String> = HashSet::new();
        let mut skipped = 0usize;
        let mut selected = Vec::new();

        for item in roster {
            if !seen.insert(item.aiaaic_id.clone()) {
                continue;
            }
            let take = match mode {
                RunMode::Incremental => {
                    if self.store.is_complete(&item.aiaaic_id) {
                        skipped += 1;
                        false
                    } else {
                        true
                    }
                }
                RunMode::Force => true,
                RunMode::RetryFailed => failure_ids.contains(&item.aiaaic_id),
                RunMode::Targeted(ids) => ids.contains(&item.aiaaic_id),
            };
            if take {
                selected.push(item);
            }
        }

        if let Some(sample) = self.controls.sample() {
            selected.truncate(sample);
        }
        (selected, skipped)
    }
}

/// One item, start to commit. Returns Err only for store write failures.
async fn process_item(shared: &Shared, item: Incident) -> Result<(), StoreError> {
    let id = item.aiaaic_id.clone();
    let Some(address) = item.detail_page_url.clone() else {
        // Nothing to fetch; the tabular record is all there is.
        shared.store.append(&item.without_page_fields(Utc::now()))?;
        shared.stats.no_address.fetch_add(1, Ordering::Relaxed);
        mark_succeeded(shared, &id, "no detail address");
        return Ok(());
    };

    if !shared.controls.politeness_delay().is_zero() {
        sleep(shared.controls.politeness_delay()).await;
    }

    let policy = shared.fetcher.policy();
    let mut attempt = 0u32;
    let html = loop {
        match shared.fetcher.fetch(&address).await {
            Ok(html) => break html,
            Err(FetchError::NotFound) => {
                // The page is gone; record what we have and move on.
                shared.store.append(&item.without_page_fields(Utc::now()))?;
                mark_succeeded(shared, &id, "page not found");
                return Ok(());
            }
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                warn!(id = %id, %err, attempt, "transient fetch failure, retrying");
                sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                record_failure(shared, &id, Some(&address), err.kind(), err.to_string(), attempt + 1)?;
                return Ok(());
            }
        }
    };

    let page_url = match Url::parse(&address) {
        Ok(url) => url,
        Err(err) => {
            record_failure(shared, &id, Some(&address), "invalid_address", err.to_string(), 1)?;
            return Ok(());
        }
    };

    let doc = parse_document(&html, page_url);
    let blocks = shared.classifier.classify(&doc);
    let fields = shared.extractor.extract(&blocks, doc.meta_description.as_deref());

    if fields.description.is_some() {
        shared.stats.descriptions.fetch_add(1, Ordering::Relaxed);
    }
    if !fields.references.is_empty() {
        shared.stats.references.fetch_add(1, Ordering::Relaxed);
    }
    if !fields.related.is_empty() {
        shared.stats.related.fetch_add(1, Ordering::Relaxed);
    }

    let merged = item.with_page_fields(fields, Utc::now());
    if let Err(err) = merged.validate() {
        record_failure(shared, &id, Some(&address), "validation_error", err.to_string(), 1)?;
        return Ok(());
    }

    shared.store.append(&merged)?;
    mark_succeeded(shared, &id, "committed");
    Ok(())
}

fn mark_succeeded(shared: &Shared, id: &str, detail: &str) {
    shared.stats.succeeded.fetch_add(1, Ordering::Relaxed);
    shared
        .succeeded_ids
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(id.to_string());
    if shared.controls.verbose() {
        println!("{id}: {detail}");
    }
}

fn record_failure(
    shared: &Shared,
    id: &str,
    address: Option<&str>,
    kind: &str,
    message: String,
    attempts: u32,
) -> Result<(), StoreError> {
    warn!(id = %id, kind, %message, "item failed");
    shared.stats.failed.fetch_add(1, Ordering::Relaxed);
    shared.store.append_failure(&ScrapeFailure::new(
        id.to_string(),
        address.map(str::to_string),
        kind,
        message,
        attempts,
    ))?;
    if shared.controls.verbose() {
        println!("{id}: failed ({kind})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RetryPolicy;
    use std::path::Path;
    use std::time::Duration;

    fn scheduler(dir: &Path, controls: HarvestControls) -> AcquisitionScheduler {
        let store = Arc::new(RecordStore::open(dir).unwrap());
        let fetcher = FetchExecutor::new(
            Duration::from_secs(2),
            RetryPolicy::new(2, Duration::from_millis(1), 2),
        )
        .unwrap();
        AcquisitionScheduler::new(store, fetcher, controls)
    }

    fn roster_item(id: &str) -> Incident {
        Incident::from_tabular(id.to_string(), "Headline".to_string(), "2023".to_string())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn items_without_address_commit_directly() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), HarvestControls::default());

        let summary = sched
            .run(vec![roster_item("AIAAIC0001")], RunMode::Incremental)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.no_address, 1);
        assert_eq!(summary.failed, 0);
        assert!(sched.store.exists("AIAAIC0001"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn incremental_skips_complete_records() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), HarvestControls::default());

        sched
            .run(vec![roster_item("AIAAIC0001")], RunMode::Incremental)
            .await
            .unwrap();
        let second = sched
            .run(vec![roster_item("AIAAIC0001")], RunMode::Incremental)
            .await
            .unwrap();
        assert_eq!(second.total, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(sched.store.record_count(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn duplicate_roster_ids_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), HarvestControls::default());

        let summary = sched
            .run(
                vec![roster_item("AIAAIC0001"), roster_item("AIAAIC0001")],
                RunMode::Incremental,
            )
            .await
            .unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(sched.store.record_count(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn targeted_mode_ignores_other_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), HarvestControls::default());

        let targets = HashSet::from(["AIAAIC0002".to_string()]);
        let summary = sched
            .run(
                vec![roster_item("AIAAIC0001"), roster_item("AIAAIC0002")],
                RunMode::Targeted(targets),
            )
            .await
            .unwrap();
        assert_eq!(summary.total, 1);
        assert!(sched.store.exists("AIAAIC0002"));
        assert!(!sched.store.exists("AIAAIC0001"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_flag_skips_unstarted_items() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), HarvestControls::default());
        sched.stop_flag().store(true, Ordering::Release);

        let summary = sched
            .run(vec![roster_item("AIAAIC0001")], RunMode::Incremental)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 0);
        assert!(!sched.store.exists("AIAAIC0001"));
    }
}
