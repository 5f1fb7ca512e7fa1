//! Core library for harvesting the AIAAIC incident database.
//!
//! Two inputs feed the pipeline: the database's tabular CSV export and the
//! per-incident detail pages, whose markup carries no stable class names.
//! Extraction is therefore heuristic, built on ordered classification rules
//! over text blocks. Acquisition is a bounded concurrent pipeline over an
//! append-only, crash-tolerant record store that can be resumed, repaired,
//! and enriched across many runs.

pub mod classifier;
pub mod controls;
pub mod export;
pub mod extractor;
pub mod fetch;
pub mod page;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod tabular;

pub use classifier::{BlockRole, ClassifiedBlock, ContentClassifier, ExtractionRules};
pub use controls::{Cli, HarvestControls, DEFAULT_ROSTER_URL};
pub use extractor::{FieldExtractor, PageFields};
pub use fetch::{FetchError, FetchExecutor, RetryPolicy};
pub use page::{PageBlock, PageDocument};
pub use record::{Incident, RelatedRef, ScrapeFailure, SourceRef, ValidationError};
pub use scheduler::{AcquisitionScheduler, RunMode, RunSummary};
pub use store::{DedupRanking, RecordStore, StoreError};
pub use tabular::{fetch_roster, parse_roster, TabularError};
