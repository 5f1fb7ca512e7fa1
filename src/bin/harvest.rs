//! Harvest CLI: scrape runs, repair modes, reports, and exports.

use std::collections::HashSet;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use aiaaic_harvest::{
    export, fetch_roster, AcquisitionScheduler, DedupRanking, FetchExecutor, HarvestControls,
    Incident, RecordStore, RunMode,
};

#[derive(Parser, Debug)]
#[command(
    name = "harvest",
    about = "Harvest the AIAAIC incident database into a local record store",
    version
)]
#[command(group(
    ArgGroup::new("mode").args([
        "force",
        "retry_failed",
        "rescrape_incomplete",
        "single",
        "export",
        "errors",
        "incomplete",
        "no_url",
        "dedupe",
    ])
))]
struct HarvestCli {
    #[command(flatten)]
    controls: aiaaic_harvest::Cli,

    /// Re-scrape every incident, ignoring previous progress
    #[arg(long)]
    force: bool,

    /// Retry only incidents currently in the failure log
    #[arg(long)]
    retry_failed: bool,

    /// Find incidents with missing page data and re-scrape them
    #[arg(long)]
    rescrape_incomplete: bool,

    /// Scrape a single incident by identifier and display it
    #[arg(long, value_name = "ID")]
    single: Option<String>,

    /// Export the record log to a flat format
    #[arg(long, value_enum, value_name = "FORMAT")]
    export: Option<ExportFormat>,

    /// List failed scrapes
    #[arg(long)]
    errors: bool,

    /// List scraped incidents with missing page data
    #[arg(long)]
    incomplete: bool,

    /// List incidents without a detail page address
    #[arg(long)]
    no_url: bool,

    /// Remove duplicate records, keeping the best version per identifier
    #[arg(long)]
    dedupe: bool,

    /// With --dedupe, report without modifying the log
    #[arg(long, requires = "dedupe")]
    dry_run: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ExportFormat {
    Json,
    Csv,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = HarvestCli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("harvest: {err:#}");
            1
        }
    };
    process::exit(code);
}

fn run(cli: HarvestCli) -> Result<i32> {
    let controls = cli.controls.build_controls();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(dispatch(cli, controls))
}

async fn dispatch(cli: HarvestCli, controls: HarvestControls) -> Result<i32> {
    let store =
        Arc::new(RecordStore::open(controls.data_dir()).context("failed to open record store")?);

    if cli.errors {
        return list_errors(&store);
    }
    if cli.incomplete {
        return list_incomplete(&store);
    }
    if let Some(format) = cli.export {
        return run_export(&store, format, &controls);
    }
    if cli.dedupe {
        return run_dedupe(&store, cli.dry_run);
    }
    if cli.no_url {
        return list_without_address(&controls).await;
    }
    if let Some(id) = cli.single.as_deref() {
        return scrape_single(&controls, id).await;
    }

    let mode = if cli.force {
        RunMode::Force
    } else if cli.retry_failed {
        RunMode::RetryFailed
    } else if cli.rescrape_incomplete {
        let ids: HashSet<String> = store
            .list_incomplete()
            .context("failed to scan record store")?
            .into_iter()
            .map(|record| record.aiaaic_id)
            .collect();
        if ids.is_empty() {
            println!("All stored incidents have complete page data.");
            return Ok(0);
        }
        println!("Re-scraping {} incomplete incidents", ids.len());
        RunMode::Targeted(ids)
    } else {
        RunMode::Incremental
    };

    println!("Fetching incident roster...");
    let roster = fetch_roster(controls.roster_url())
        .await
        .context("failed to fetch the incident roster")?;
    println!("Roster has {} incidents", roster.len());

    let fetcher = FetchExecutor::new(controls.request_timeout(), controls.retry())
        .context("failed to build http client")?;
    let scheduler = AcquisitionScheduler::new(Arc::clone(&store), fetcher, controls);

    let stop = scheduler.stop_flag();
    let interrupt_flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; letting in-flight items finish");
            interrupt_flag.store(true, Ordering::Release);
        }
    });

    let summary = scheduler.run(roster, mode).await.context("harvest run failed")?;
    summary.report();

    if stop.load(Ordering::Acquire) {
        println!("Interrupted; progress has been saved.");
        return Ok(130);
    }
    Ok(if summary.failed > 0 { 1 } else { 0 })
}

fn list_errors(store: &RecordStore) -> Result<i32> {
    let failures = store.load_failures().context("failed to read failure log")?;
    if failures.is_empty() {
        println!("No failures recorded.");
        return Ok(0);
    }
    println!("{} failed scrapes:", failures.len());
    for failure in &failures {
        println!(
            "  {}  {}  {}  ({} attempts)  {}",
            failure.aiaaic_id,
            failure.kind,
            failure.timestamp.format("%Y-%m-%d %H:%M"),
            failure.attempts,
            truncate(&failure.message, 60),
        );
    }
    println!("Use --retry-failed to retry these incidents.");
    Ok(0)
}

fn list_incomplete(store: &RecordStore) -> Result<i32> {
    let incomplete = store.list_incomplete().context("failed to scan record store")?;
    if incomplete.is_empty() {
        println!("All stored incidents have complete page data.");
        return Ok(0);
    }
    println!("{} incomplete incidents:", incomplete.len());
    for record in &incomplete {
        let mut missing = Vec::new();
        if record.description.is_none() {
            missing.push("description");
        }
        if record.source_links.is_empty() {
            missing.push("sources");
        }
        println!(
            "  {}  missing: {}  {}",
            record.aiaaic_id,
            missing.join(", "),
            truncate(&record.headline, 60),
        );
    }
    Ok(0)
}

fn run_export(store: &RecordStore, format: ExportFormat, controls: &HarvestControls) -> Result<i32> {
    let records = store.load_records().context("failed to read record store")?;
    let path = match format {
        ExportFormat::Json => controls.data_dir().join("incidents.json"),
        ExportFormat::Csv => controls.data_dir().join("incidents.csv"),
    };
    let count = match format {
        ExportFormat::Json => export::export_json(&records, &path),
        ExportFormat::Csv => export::export_csv(&records, &path),
    }
    .context("export failed")?;
    println!("Exported {count} incidents to {}", path.display());
    Ok(0)
}

fn run_dedupe(store: &RecordStore, dry_run: bool) -> Result<i32> {
    let duplicates = store.list_duplicates().context("failed to scan record store")?;
    if duplicates.is_empty() {
        println!("No duplicate identifiers found.");
        return Ok(0);
    }
    for (id, count) in &duplicates {
        println!("  {id}: {count} copies");
    }
    if dry_run {
        println!("{} duplicated identifiers (dry run, nothing removed)", duplicates.len());
        return Ok(0);
    }
    let (kept, removed) = store
        .deduplicate(&DedupRanking::default())
        .context("deduplication failed")?;
    println!("Kept {kept} records, removed {removed} duplicates");
    Ok(0)
}

async fn list_without_address(controls: &HarvestControls) -> Result<i32> {
    println!("Fetching incident roster...");
    let roster = fetch_roster(controls.roster_url())
        .await
        .context("failed to fetch the incident roster")?;
    let missing: Vec<&Incident> = roster
        .iter()
        .filter(|incident| incident.detail_page_url.is_none())
        .collect();
    println!(
        "{} of {} incidents have no detail page address:",
        missing.len(),
        roster.len()
    );
    for incident in &missing {
        println!(
            "  {}  {}  {}",
            incident.aiaaic_id,
            incident.occurred,
            truncate(&incident.headline, 70),
        );
    }
    Ok(0)
}

async fn scrape_single(controls: &HarvestControls, raw_id: &str) -> Result<i32> {
    let mut id = raw_id.to_uppercase();
    if !id.starts_with("AIAAIC") {
        id = format!("AIAAIC{id}");
    }

    println!("Fetching incident roster to find {id}...");
    let roster = fetch_roster(controls.roster_url())
        .await
        .context("failed to fetch the incident roster")?;
    let Some(incident) = roster.into_iter().find(|i| i.aiaaic_id == id) else {
        eprintln!("Incident {id} not found in the roster");
        return Ok(1);
    };

    let incident = match incident.detail_page_url.clone() {
        Some(address) => {
            println!("Scraping detail page...");
            let fetcher = FetchExecutor::new(controls.request_timeout(), controls.retry())
                .context("failed to build http client")?;
            match fetcher.fetch(&address).await {
                Ok(html) => {
                    let page_url = url::Url::parse(&address)
                        .context("detail page address is not a valid url")?;
                    let doc = aiaaic_harvest::page::parse_document(&html, page_url);
                    let classifier = aiaaic_harvest::ContentClassifier::default();
                    let extractor = aiaaic_harvest::FieldExtractor::default();
                    let blocks = classifier.classify(&doc);
                    let fields = extractor.extract(&blocks, doc.meta_description.as_deref());
                    incident.with_page_fields(fields, chrono::Utc::now())
                }
                Err(err) => {
                    eprintln!("Failed to scrape detail page: {err}");
                    incident
                }
            }
        }
        None => incident,
    };

    print_incident(&incident);
    Ok(0)
}

fn print_incident(incident: &Incident) {
    println!();
    println!("=== {} ({}) ===", incident.aiaaic_id, incident.occurred);
    println!("{}", incident.headline);
    if let Some(description) = &incident.description {
        println!();
        println!("{description}");
    }
    println!();
    print_list("Countries", &incident.countries);
    print_list("Sectors", &incident.sectors);
    print_list("Deployers", &incident.deployers);
    print_list("Developers", &incident.developers);
    print_list("Systems", &incident.system_names);
    print_list("Technologies", &incident.technologies);
    print_list("Issues", &incident.issues);
    if !incident.source_links.is_empty() {
        println!("Source links ({}):", incident.source_links.len());
        for link in &incident.source_links {
            match &link.title {
                Some(title) => println!("  {title} <{}>", link.url),
                None => println!("  {}", link.url),
            }
        }
    }
    if !incident.related_incidents.is_empty() {
        println!("Related incidents ({}):", incident.related_incidents.len());
        for related in &incident.related_incidents {
            println!("  {} <{}>", related.title, related.url);
        }
    }
    if let Some(address) = &incident.detail_page_url {
        println!("Detail page: {address}");
    }
}

fn print_list(label: &str, values: &[String]) {
    if !values.is_empty() {
        println!("{label}: {}", values.join(", "));
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}...")
}
