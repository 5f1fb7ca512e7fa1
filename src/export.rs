//! Read-only exports of the record log to flat formats.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::record::Incident;
use crate::store::StoreError;

/// Writes all records as one pretty-printed JSON array. Returns the count.
pub fn export_json(records: &[Incident], path: &Path) -> Result<usize, StoreError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;
    Ok(records.len())
}

/// Writes all records as a flattened CSV. List fields are joined with "; ";
/// link lists are reduced to counts. Returns the count.
pub fn export_csv(records: &[Incident], path: &Path) -> Result<usize, StoreError> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    writer
        .write_record([
            "aiaaic_id",
            "headline",
            "occurred",
            "countries",
            "sectors",
            "deployers",
            "developers",
            "system_names",
            "technologies",
            "purposes",
            "news_triggers",
            "issues",
            "external_harms_individual",
            "external_harms_societal",
            "external_harms_environmental",
            "internal_impacts_strategic_reputational",
            "internal_impacts_operational",
            "internal_impacts_financial",
            "internal_impacts_legal_regulatory",
            "detail_page_url",
            "description",
            "source_links_count",
            "related_incidents_count",
            "occurred_on_page",
            "page_published",
            "page_scraped",
            "scraped_at",
        ])
        .map_err(csv_error)?;

    for record in records {
        let row: Vec<String> = vec![
            record.aiaaic_id.clone(),
            record.headline.clone(),
            record.occurred.clone(),
            joined(&record.countries),
            joined(&record.sectors),
            joined(&record.deployers),
            joined(&record.developers),
            joined(&record.system_names),
            joined(&record.technologies),
            joined(&record.purposes),
            joined(&record.news_triggers),
            joined(&record.issues),
            joined(&record.external_harms.individual),
            joined(&record.external_harms.societal),
            joined(&record.external_harms.environmental),
            joined(&record.internal_impacts.strategic_reputational),
            joined(&record.internal_impacts.operational),
            joined(&record.internal_impacts.financial),
            joined(&record.internal_impacts.legal_regulatory),
            record.detail_page_url.clone().unwrap_or_default(),
            record.description.clone().unwrap_or_default(),
            record.source_links.len().to_string(),
            record.related_incidents.len().to_string(),
            record.occurred_on_page.clone().unwrap_or_default(),
            record.page_published.clone().unwrap_or_default(),
            record.page_scraped.to_string(),
            record
                .scraped_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ];
        writer.write_record(&row).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(records.len())
}

fn joined(values: &[String]) -> String {
    values.join("; ")
}

fn csv_error(err: csv::Error) -> StoreError {
    StoreError::Io(std::io::Error::other(err))
}
