//! Harvest throttle and pacing controls shared across components.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::RetryPolicy;

/// Published CSV export of the incident database.
pub const DEFAULT_ROSTER_URL: &str = "https://docs.google.com/spreadsheets/d/1Bn55B4xz21-_Rgdr8BBb2lt0n_4rzLGxFADMlVW0PYI/export?format=csv&gid=888071280";

/// Tunable knobs that bound a harvest run.
#[derive(Clone, Debug)]
pub struct HarvestControls {
    concurrency: usize,
    request_timeout: Duration,
    politeness_delay: Duration,
    retry: RetryPolicy,
    data_dir: PathBuf,
    roster_url: String,
    sample: Option<usize>,
    verbose: bool,
}

impl HarvestControls {
    /// Constructs a new set of harvest controls.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        concurrency: usize,
        request_timeout: Duration,
        politeness_delay: Duration,
        retry: RetryPolicy,
        data_dir: PathBuf,
        roster_url: String,
        sample: Option<usize>,
        verbose: bool,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            request_timeout,
            politeness_delay,
            retry,
            data_dir,
            roster_url,
            sample,
            verbose,
        }
    }

    /// Maximum number of concurrent fetch+extract pipelines.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Pause before each fetch, easing load on the remote.
    pub fn politeness_delay(&self) -> Duration {
        self.politeness_delay
    }

    /// Backoff ladder shared by fetch- and scheduler-level retries.
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Directory holding the record and failure logs.
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Address of the tabular roster export.
    pub fn roster_url(&self) -> &str {
        &self.roster_url
    }

    /// Optional cap on how many selected items to process.
    pub fn sample(&self) -> Option<usize> {
        self.sample
    }

    /// Whether to print a status line per item.
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

impl Default for HarvestControls {
    fn default() -> Self {
        Self {
            concurrency: 20,
            request_timeout: Duration::from_secs(30),
            politeness_delay: Duration::ZERO,
            retry: RetryPolicy::default(),
            data_dir: PathBuf::from("data"),
            roster_url: DEFAULT_ROSTER_URL.to_string(),
            sample: None,
            verbose: false,
        }
    }
}

/// Command-line knobs shared by binaries that drive harvests.
#[derive(Parser, Debug, Clone)]
pub struct Cli {
    /// Number of concurrent page requests
    #[arg(long, env = "HARVEST_CONCURRENCY", default_value_t = 20)]
    pub concurrency: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "HARVEST_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Milliseconds to pause before each fetch
    #[arg(long, env = "HARVEST_POLITENESS_MS", default_value_t = 0)]
    pub politeness_ms: u64,

    /// Retry attempts for throttled or transient failures
    #[arg(long, env = "HARVEST_RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Directory for the record and failure logs
    #[arg(long, short = 'o', env = "HARVEST_DATA_DIR", default_value = "data")]
    pub output: PathBuf,

    /// Roster CSV export address
    #[arg(long, env = "HARVEST_ROSTER_URL", default_value = DEFAULT_ROSTER_URL)]
    pub roster_url: String,

    /// Only process the first N selected incidents
    #[arg(long, value_name = "N")]
    pub sample: Option<usize>,

    /// Print a status line for every incident
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl Cli {
    /// Converts the parsed CLI into `HarvestControls`.
    pub fn build_controls(&self) -> HarvestControls {
        HarvestControls::new(
            self.concurrency,
            Duration::from_secs(self.timeout_secs),
            Duration::from_millis(self.politeness_ms),
            RetryPolicy::new(self.retries, Duration::from_secs(1), 2),
            self.output.clone(),
            self.roster_url.clone(),
            self.sample,
            self.verbose,
        )
    }
}
