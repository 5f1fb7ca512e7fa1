//! Append-only record persistence: one JSONL log for merged incidents, one
//! for scrape failures.
//!
//! The log layout buys three properties cheaply: resumability (identifiers
//! are re-read at open), incremental append without rewriting, and crash
//! tolerance (a torn final line fails to parse and is skipped on reload).
//! The only structural mutation is [`RecordStore::remove_ids`], which
//! rewrites through a temp file and atomically replaces the log.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::record::{Incident, ScrapeFailure};

const RECORDS_FILE: &str = "incidents.jsonl";
const FAILURES_FILE: &str = "failures.jsonl";

/// Store-level failures. Corrupt individual lines are NOT errors; they are
/// skipped with a warning on read and preserved verbatim on rewrite.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Serialize(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "store i/o error: {err}"),
            Self::Serialize(err) => write!(f, "record serialization error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialize(err) => Some(err),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err)
    }
}

/// Ranking used by [`RecordStore::deduplicate`] to pick the version to keep.
///
/// Completeness wins outright; among equally complete versions the most
/// recently scraped wins; the quality score breaks remaining ties.
#[derive(Debug, Clone, Copy)]
pub struct DedupRanking {
    /// Quality points per extracted source link.
    pub source_link_weight: u64,
    /// Quality points for having scraped the page at all.
    pub scraped_weight: u64,
}

impl Default for DedupRanking {
    fn default() -> Self {
        Self {
            source_link_weight: 100,
            scraped_weight: 1000,
        }
    }
}

impl DedupRanking {
    /// Orderable rank; higher is better.
    pub fn rank(&self, record: &Incident) -> (bool, i64, u64) {
        let mut quality = record
            .description
            .as_deref()
            .map(|d| d.len() as u64)
            .unwrap_or(0);
        quality += record.source_links.len() as u64 * self.source_link_weight;
        if record.page_scraped {
            quality += self.scraped_weight;
        }
        let recency = record
            .scraped_at
            .map(|at| at.timestamp())
            .unwrap_or(i64::MIN);
        (record.is_complete(), recency, quality)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct IdState {
    occurrences: u32,
    any_complete: bool,
}

/// Just enough of a line to route it during rewrites.
#[derive(Deserialize)]
struct IdOnly {
    aiaaic_id: String,
}

struct StoreInner {
    records_file: File,
    failures_file: File,
    index: HashMap<String, IdState>,
    failure_ids: HashSet<String>,
}

/// The durable store. All components receive a shared reference; there is no
/// process-wide instance.
pub struct RecordStore {
    records_path: PathBuf,
    failures_path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl RecordStore {
    /// Opens (or creates) the store under `dir`, re-reading both logs to
    /// rebuild the identifier index.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let records_path = dir.join(RECORDS_FILE);
        let failures_path = dir.join(FAILURES_FILE);

        let mut index: HashMap<String, IdState> = HashMap::new();
        for record in read_jsonl::<Incident>(&records_path)? {
            let state = index.entry(record.aiaaic_id.clone()).or_default();
            state.occurrences += 1;
            state.any_complete |= record.is_complete();
        }

        let mut failure_ids = HashSet::new();
        for failure in read_jsonl::<ScrapeFailure>(&failures_path)? {
            failure_ids.insert(failure.aiaaic_id);
        }

        let inner = StoreInner {
            records_file: open_append(&records_path)?,
            failures_file: open_append(&failures_path)?,
            index,
            failure_ids,
        };
        Ok(Self {
            records_path,
            failures_path,
            inner: Mutex::new(inner),
        })
    }

    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    /// True when at least one record exists for the identifier.
    pub fn exists(&self, id: &str) -> bool {
        self.lock().index.contains_key(id)
    }

    /// True when some stored version of the identifier is complete.
    pub fn is_complete(&self, id: &str) -> bool {
        self.lock()
            .index
            .get(id)
            .map(|state| state.any_complete)
            .unwrap_or(false)
    }

    /// Number of stored record lines (duplicates included).
    pub fn record_count(&self) -> usize {
        self.lock()
            .index
            .values()
            .map(|state| state.occurrences as usize)
            .sum()
    }

    /// Durably appends one record. Never overwrites in place.
    pub fn append(&self, record: &Incident) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut inner = self.lock();
        writeln!(inner.records_file, "{line}")?;
        inner.records_file.flush()?;
        let state = inner.index.entry(record.aiaaic_id.clone()).or_default();
        state.occurrences += 1;
        state.any_complete |= record.is_complete();
        Ok(())
    }

    /// Appends one failure entry.
    pub fn append_failure(&self, failure: &ScrapeFailure) -> Result<(), StoreError> {
        let line = serde_json::to_string(failure)?;
        let mut inner = self.lock();
        writeln!(inner.failures_file, "{line}")?;
        inner.failures_file.flush()?;
        inner.failure_ids.insert(failure.aiaaic_id.clone());
        Ok(())
    }

    /// Identifiers currently present in the failure log.
    pub fn failure_ids(&self) -> HashSet<String> {
        self.lock().failure_ids.clone()
    }

    /// All parseable records, in file order.
    pub fn load_records(&self) -> Result<Vec<Incident>, StoreError> {
        let _guard = self.lock();
        read_jsonl(&self.records_path)
    }

    /// All parseable failure entries, in file order.
    pub fn load_failures(&self) -> Result<Vec<ScrapeFailure>, StoreError> {
        let _guard = self.lock();
        read_jsonl(&self.failures_path)
    }

    /// Rewrites the record log excluding the given identifiers. Returns how
    /// many record lines were dropped. Atomic with respect to crash: the new
    /// log is written beside the old one and renamed over it.
    pub fn remove_ids(&self, ids: &HashSet<String>) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        let removed = rewrite_excluding(&self.records_path, ids)?;
        inner.records_file = open_append(&self.records_path)?;
        inner.index = HashMap::new();
        for record in read_jsonl::<Incident>(&self.records_path)? {
            let state = inner.index.entry(record.aiaaic_id.clone()).or_default();
            state.occurrences += 1;
            state.any_complete |= record.is_complete();
        }
        Ok(removed)
    }

    /// Rewrites the failure log excluding the given identifiers.
    pub fn remove_failures(&self, ids: &HashSet<String>) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        let removed = rewrite_excluding(&self.failures_path, ids)?;
        inner.failures_file = open_append(&self.failures_path)?;
        for id in ids {
            inner.failure_ids.remove(id);
        }
        Ok(removed)
    }

    /// Drops every failure entry.
    pub fn clear_failures(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        File::create(&self.failures_path)?;
        inner.failures_file = open_append(&self.failures_path)?;
        inner.failure_ids.clear();
        Ok(())
    }

    /// Records that still need (re)processing: a detail address exists but
    /// the page data never fully arrived.
    pub fn list_incomplete(&self) -> Result<Vec<Incident>, StoreError> {
        Ok(self
            .load_records()?
            .into_iter()
            .filter(|record| !record.is_complete())
            .collect())
    }

    /// Records with no detail address at all.
    pub fn list_without_address(&self) -> Result<Vec<Incident>, StoreError> {
        Ok(self
            .load_records()?
            .into_iter()
            .filter(|record| record.detail_page_url.is_none())
            .collect())
    }

    /// Identifiers stored more than once, with their line counts.
    pub fn list_duplicates(&self) -> Result<Vec<(String, usize)>, StoreError> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for record in self.load_records()? {
            let count = counts.entry(record.aiaaic_id.clone()).or_insert(0);
            if *count == 0 {
                order.push(record.aiaaic_id.clone());
            }
            *count += 1;
        }
        Ok(order
            .into_iter()
            .filter_map(|id| {
                let count = counts[&id];
                (count > 1).then_some((id, count))
            })
            .collect())
    }

    /// Keeps the single best version per identifier and removes the rest.
    /// Returns `(kept, removed)` line counts.
    pub fn deduplicate(&self, ranking: &DedupRanking) -> Result<(usize, usize), StoreError> {
        let records = self.load_records()?;
        let mut by_id: HashMap<String, Vec<Incident>> = HashMap::new();
        for record in records {
            by_id.entry(record.aiaaic_id.clone()).or_default().push(record);
        }

        let duplicated: HashSet<String> = by_id
            .iter()
            .filter(|(_, versions)| versions.len() > 1)
            .map(|(id, _)| id.clone())
            .collect();
        if duplicated.is_empty() {
            return Ok((by_id.len(), 0));
        }

        let mut removed = 0usize;
        let mut winners: Vec<Incident> = Vec::new();
        for id in &duplicated {
            let versions = by_id.remove(id).expect("grouped above");
            removed += versions.len() - 1;
            let best = versions
                .into_iter()
                .max_by_key(|record| ranking.rank(record))
                .expect("non-empty group");
            winners.push(best);
        }

        self.remove_ids(&duplicated)?;
        for winner in &winners {
            self.append(winner)?;
        }
        Ok((by_id.len() + winners.len(), removed))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Reads every parseable line; unparseable lines (including a torn final
/// line after a crash) are skipped with a warning, never fatal.
fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => out.push(value),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped unparseable log lines");
    }
    Ok(out)
}

/// Writes all lines except those whose identifier is in `ids` to a temp file
/// in the same directory, then renames it over the log. Lines that do not
/// parse are kept verbatim.
fn rewrite_excluding(path: &Path, ids: &HashSet<String>) -> Result<usize, StoreError> {
    if !path.exists() {
        return Ok(0);
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    let reader = BufReader::new(File::open(path)?);
    let mut removed = 0usize;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<IdOnly>(trimmed) {
            Ok(parsed) if ids.contains(&parsed.aiaaic_id) => removed += 1,
            _ => writeln!(tmp, "{trimmed}")?,
        }
    }
    tmp.flush()?;
    tmp.persist(path).map_err(|err| StoreError::Io(err.error))?;
    Ok(removed)
}
