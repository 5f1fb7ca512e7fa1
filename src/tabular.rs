//! Loads the tabular roster: the database's published CSV export.
//!
//! The export has a fixed positional layout: a title row, a header row, and
//! a sub-header row for the harm/impact groups, then one row per incident.
//! Multi-value cells are semicolon separated.

use std::fmt;

use tracing::warn;

use crate::record::{ExternalHarms, Incident, InternalImpacts};

const COL_ID: usize = 0;
const COL_HEADLINE: usize = 1;
const COL_OCCURRED: usize = 2;
const COL_COUNTRIES: usize = 3;
const COL_SECTORS: usize = 4;
const COL_DEPLOYERS: usize = 5;
const COL_DEVELOPERS: usize = 6;
const COL_SYSTEM_NAMES: usize = 7;
const COL_TECHNOLOGIES: usize = 8;
const COL_PURPOSES: usize = 9;
const COL_NEWS_TRIGGERS: usize = 10;
const COL_ISSUES: usize = 11;
const COL_HARMS_INDIVIDUAL: usize = 12;
const COL_HARMS_SOCIETAL: usize = 13;
const COL_HARMS_ENVIRONMENTAL: usize = 14;
const COL_IMPACTS_STRATEGIC: usize = 15;
const COL_IMPACTS_OPERATIONAL: usize = 16;
const COL_IMPACTS_FINANCIAL: usize = 17;
const COL_IMPACTS_LEGAL: usize = 18;
const COL_DETAIL_URL: usize = 19;

/// Leading rows before the data starts: title, header, sub-header.
const SKIP_ROWS: usize = 3;

/// The export is served from a sheet host that rejects unknown agents.
const ROSTER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)";

/// Roster loading failures. These are process-fatal: without the roster
/// there is no work list.
#[derive(Debug)]
pub enum TabularError {
    Http(reqwest::Error),
    Csv(csv::Error),
}

impl fmt::Display for TabularError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "roster download failed: {err}"),
            Self::Csv(err) => write!(f, "roster parse failed: {err}"),
        }
    }
}

impl std::error::Error for TabularError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            Self::Csv(err) => Some(err),
        }
    }
}

/// Downloads and parses the roster.
pub async fn fetch_roster(url: &str) -> Result<Vec<Incident>, TabularError> {
    let client = reqwest::Client::builder()
        .user_agent(ROSTER_USER_AGENT)
        .build()
        .map_err(TabularError::Http)?;
    let body = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(TabularError::Http)?
        .text()
        .await
        .map_err(TabularError::Http)?;
    parse_roster(&body)
}

/// Parses CSV export text into partial incident records. Rows without an
/// identifier are skipped; unreadable rows are skipped with a warning.
pub fn parse_roster(csv_text: &str) -> Result<Vec<Incident>, TabularError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let mut incidents = Vec::new();
    for (row_index, result) in reader.records().enumerate() {
        if row_index < SKIP_ROWS {
            continue;
        }
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                warn!(row_index, %err, "skipped unreadable roster row");
                continue;
            }
        };
        if let Some(incident) = parse_row(&row) {
            incidents.push(incident);
        }
    }
    Ok(incidents)
}

fn parse_row(row: &csv::StringRecord) -> Option<Incident> {
    let id = cell(row, COL_ID);
    if id.is_empty() {
        return None;
    }

    let mut incident = Incident::from_tabular(
        id.to_string(),
        cell(row, COL_HEADLINE).to_string(),
        cell(row, COL_OCCURRED).to_string(),
    );
    incident.countries = split_multi(cell(row, COL_COUNTRIES));
    incident.sectors = split_multi(cell(row, COL_SECTORS));
    incident.deployers = split_multi(cell(row, COL_DEPLOYERS));
    incident.developers = split_multi(cell(row, COL_DEVELOPERS));
    incident.system_names = split_multi(cell(row, COL_SYSTEM_NAMES));
    incident.technologies = split_multi(cell(row, COL_TECHNOLOGIES));
    incident.purposes = split_multi(cell(row, COL_PURPOSES));
    incident.news_triggers = split_multi(cell(row, COL_NEWS_TRIGGERS));
    incident.issues = split_multi(cell(row, COL_ISSUES));
    incident.external_harms = ExternalHarms {
        individual: split_multi(cell(row, COL_HARMS_INDIVIDUAL)),
        societal: split_multi(cell(row, COL_HARMS_SOCIETAL)),
        environmental: split_multi(cell(row, COL_HARMS_ENVIRONMENTAL)),
    };
    incident.internal_impacts = InternalImpacts {
        strategic_reputational: split_multi(cell(row, COL_IMPACTS_STRATEGIC)),
        operational: split_multi(cell(row, COL_IMPACTS_OPERATIONAL)),
        financial: split_multi(cell(row, COL_IMPACTS_FINANCIAL)),
        legal_regulatory: split_multi(cell(row, COL_IMPACTS_LEGAL)),
    };

    let detail = cell(row, COL_DETAIL_URL);
    incident.detail_page_url =
        (!detail.is_empty() && detail.contains("aiaaic.org")).then(|| detail.to_string());

    Some(incident)
}

fn cell<'r>(row: &'r csv::StringRecord, index: usize) -> &'r str {
    row.get(index).unwrap_or("").trim()
}

/// Splits a semicolon-separated cell into trimmed, non-empty values.
fn split_multi(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
