//! Durable record types for the incident log and the failure log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::extractor::PageFields;

/// External harm categories reported for an incident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalHarms {
    #[serde(default)]
    pub individual: Vec<String>,
    #[serde(default)]
    pub societal: Vec<String>,
    #[serde(default)]
    pub environmental: Vec<String>,
}

/// Internal impact categories reported for an incident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalImpacts {
    #[serde(default)]
    pub strategic_reputational: Vec<String>,
    #[serde(default)]
    pub operational: Vec<String>,
    #[serde(default)]
    pub financial: Vec<String>,
    #[serde(default)]
    pub legal_regulatory: Vec<String>,
}

/// An external URL cited as evidence or reporting for an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// A link to another incident record in the same database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedRef {
    pub title: String,
    pub url: String,
}

/// One merged incident record: tabular fields plus page-derived fields.
///
/// The identifier is immutable and globally unique across the store. Records
/// are only ever replaced wholesale, never patched field by field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub aiaaic_id: String,

    // Tabular fields.
    pub headline: String,
    pub occurred: String,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub deployers: Vec<String>,
    #[serde(default)]
    pub developers: Vec<String>,
    #[serde(default)]
    pub system_names: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub purposes: Vec<String>,
    #[serde(default)]
    pub news_triggers: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub external_harms: ExternalHarms,
    #[serde(default)]
    pub internal_impacts: InternalImpacts,
    #[serde(default)]
    pub detail_page_url: Option<String>,

    // Page-derived fields.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_links: Vec<SourceRef>,
    #[serde(default)]
    pub related_incidents: Vec<RelatedRef>,
    #[serde(default)]
    pub occurred_on_page: Option<String>,
    #[serde(default)]
    pub page_published: Option<String>,

    // Provenance.
    #[serde(default)]
    pub page_scraped: bool,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Builds a bare tabular record with no page-derived data yet.
    pub fn from_tabular(aiaaic_id: String, headline: String, occurred: String) -> Self {
        Self {
            aiaaic_id,
            headline,
            occurred,
            countries: Vec::new(),
            sectors: Vec::new(),
            deployers: Vec::new(),
            developers: Vec::new(),
            system_names: Vec::new(),
            technologies: Vec::new(),
            purposes: Vec::new(),
            news_triggers: Vec::new(),
            issues: Vec::new(),
            external_harms: ExternalHarms::default(),
            internal_impacts: InternalImpacts::default(),
            detail_page_url: None,
            description: None,
            source_links: Vec::new(),
            related_incidents: Vec::new(),
            occurred_on_page: None,
            page_published: None,
            page_scraped: false,
            scraped_at: None,
        }
    }

    /// Full-replacement merge of extracted page fields into this record.
    pub fn with_page_fields(mut self, fields: PageFields, scraped_at: DateTime<Utc>) -> Self {
        self.description = fields.description;
        self.source_links = fields.references;
        self.related_incidents = fields.related;
        self.occurred_on_page = fields.occurred;
        self.page_published = fields.published;
        self.page_scraped = true;
        self.scraped_at = Some(scraped_at);
        self
    }

    /// Marks the record as visited without page data (no page, or nothing there).
    pub fn without_page_fields(mut self, scraped_at: DateTime<Utc>) -> Self {
        self.page_scraped = false;
        self.scraped_at = Some(scraped_at);
        self
    }

    /// A record is complete when its page yielded a description and at least
    /// one source link, or when there is no detail page to fetch at all.
    pub fn is_complete(&self) -> bool {
        if self.detail_page_url.is_none() {
            return true;
        }
        self.description.as_deref().is_some_and(|d| !d.is_empty())
            && !self.source_links.is_empty()
    }

    /// Schema constraints checked before a merged record is committed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.aiaaic_id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        for link in &self.source_links {
            let parsed = url::Url::parse(&link.url)
                .map_err(|_| ValidationError::BadSourceUrl(link.url.clone()))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ValidationError::BadSourceUrl(link.url.clone()));
            }
        }
        for rel in &self.related_incidents {
            if url::Url::parse(&rel.url).is_err() {
                return Err(ValidationError::BadSourceUrl(rel.url.clone()));
            }
        }
        Ok(())
    }
}

/// A merged record failed its schema constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The identifier is empty.
    MissingId,
    /// An extracted link is not an absolute http(s) URL.
    BadSourceUrl(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId => write!(f, "record has no identifier"),
            Self::BadSourceUrl(url) => write!(f, "extracted link is not a valid url: {url}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// One terminal scrape failure, persisted for later retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeFailure {
    pub aiaaic_id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl ScrapeFailure {
    /// Creates a failure entry stamped with the current time.
    pub fn new(
        aiaaic_id: String,
        url: Option<String>,
        kind: &str,
        message: String,
        attempts: u32,
    ) -> Self {
        Self {
            aiaaic_id,
            url,
            kind: kind.to_string(),
            message,
            timestamp: Utc::now(),
            attempts,
        }
    }
}
