//! Heuristic block classification for detail pages.
//!
//! The source site renders incident pages through a site builder with
//! auto-generated class names, so classification works purely on text shape
//! and link targets. Rules run in a fixed precedence order per block, then a
//! second pass resolves narrative runs between section headings.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::page::{PageBlock, PageDocument};

/// Plain text that is just a URL, no surrounding prose.
static TEXT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^https?://[^\s<>"']+$"#).expect("url regex"));

/// Site-specific heuristics: fixed label sets, thresholds, and domains.
///
/// Everything the rules key on lives here so individual rules stay testable
/// and nothing is hard-coded inside the classification loop.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    /// Host of the incident site itself; links there are never references.
    pub base_host: String,
    /// Path prefix of incident pages, used to spot related-record links.
    pub repository_path: String,
    /// Known narrative section headings, lowercase.
    pub narrative_headings: Vec<String>,
    /// Heading that opens the related-records section, lowercase.
    pub related_heading: String,
    /// Labels that start metadata lines; the colon is mandatory.
    pub metadata_labels: Vec<String>,
    /// Substrings of share/tracker/form URLs that are never source references.
    pub excluded_url_patterns: Vec<String>,
    /// Navigation and chrome phrases that mark a block as noise.
    pub boilerplate_patterns: Vec<String>,
    /// Blocks shorter than this are noise unless an earlier rule claimed them.
    pub min_block_len: usize,
    /// A paragraph at least this long counts as substantial.
    pub substantial_paragraph_len: usize,
    /// A run of short paragraphs is still narrative past this combined length.
    pub min_run_len: usize,
    /// Headings longer than this are not headings.
    pub max_heading_len: usize,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            base_host: "aiaaic.org".to_string(),
            repository_path: "/aiaaic-repository/ai-algorithmic-and-automation-incidents/"
                .to_string(),
            narrative_headings: vec![
                "what happened".to_string(),
                "why it happened".to_string(),
                "what it means".to_string(),
            ],
            related_heading: "related".to_string(),
            metadata_labels: vec![
                "Occurred".to_string(),
                "Released".to_string(),
                "Page published".to_string(),
                "Page updated".to_string(),
                "AIAAIC Repository ID".to_string(),
                "Developer".to_string(),
                "Operator".to_string(),
                "Purpose".to_string(),
                "Type".to_string(),
            ],
            excluded_url_patterns: vec![
                "facebook.com/sharer".to_string(),
                "twitter.com/intent".to_string(),
                "linkedin.com/share".to_string(),
                "linktree".to_string(),
                "gstatic.com".to_string(),
                "google.com/url".to_string(),
                "docs.google.com/forms".to_string(),
                "docs.google.com/spreadsheets".to_string(),
                "wikipedia.org".to_string(),
                "doubao.com".to_string(),
            ],
            boilerplate_patterns: vec![
                "Report incident".to_string(),
                "Improve page".to_string(),
                "Access database".to_string(),
                "Page updated".to_string(),
                "Google Sites".to_string(),
                "Skip to main".to_string(),
                "Skip to navigation".to_string(),
                "Copy heading link".to_string(),
                "Back to site".to_string(),
                "Search this site".to_string(),
            ],
            min_block_len: 30,
            substantial_paragraph_len: 80,
            min_run_len: 200,
            max_heading_len: 48,
        }
    }
}

impl ExtractionRules {
    /// True when the text is chrome: a known phrase, or too short to carry
    /// content. Headings and metadata are checked before this ever runs.
    pub fn is_boilerplate(&self, text: &str) -> bool {
        if text.len() < self.min_block_len {
            return true;
        }
        let lower = text.to_lowercase();
        self.boilerplate_patterns
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    /// True when the URL points at the incident site itself.
    pub fn is_self_host(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| host == self.base_host || host.ends_with(&format!(".{}", self.base_host)))
            .unwrap_or(false)
    }

    /// True when the URL matches the share/tracker/form exclusion list.
    pub fn is_excluded_url(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        self.excluded_url_patterns
            .iter()
            .any(|pattern| lower.contains(pattern))
    }
}

/// Role assigned to one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    /// A recognized section boundary ("What happened", "Related", ...).
    SectionHeading,
    /// Descriptive prose belonging to the incident narrative.
    Narrative,
    /// A `Label: value` line from the metadata panel.
    Metadata,
    /// An external source citation, hyperlink or bare URL text.
    Reference,
    /// A link to another incident record on the same site.
    Related,
    /// Everything else.
    Noise,
}

/// One classified block, consumed by the field extractor and never persisted.
#[derive(Debug, Clone)]
pub struct ClassifiedBlock {
    /// Ordinal position within the parsed page.
    pub position: usize,
    pub role: BlockRole,
    pub text: String,
    /// Resolved absolute link target for Reference/Related blocks.
    pub link: Option<String>,
    /// Owning narrative heading, when the block sits under one.
    pub section: Option<String>,
}

/// First-pass tag, before narrative runs are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    NarrativeHeading,
    RelatedHeading,
    Metadata,
    Reference,
    RelatedCandidate,
    Prose,
    Noise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Other,
    Narrative,
    Related,
}

/// Classifies parsed page blocks by role. Never fails: pages where nothing
/// matches come back all-noise, not as an error.
pub struct ContentClassifier {
    rules: ExtractionRules,
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new(ExtractionRules::default())
    }
}

impl ContentClassifier {
    pub fn new(rules: ExtractionRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    /// Runs the rule chain over every block, then resolves narrative runs.
    pub fn classify(&self, doc: &PageDocument) -> Vec<ClassifiedBlock> {
        let tagged: Vec<(Tag, Option<String>)> = doc
            .blocks
            .iter()
            .map(|block| self.primary_tag(block, doc))
            .collect();

        self.resolve(doc, tagged)
    }

    /// The ordered rule chain. Precedence matters: a short heading must be
    /// recognized before the minimum-length rule can discard it.
    fn primary_tag(&self, block: &PageBlock, doc: &PageDocument) -> (Tag, Option<String>) {
        let text = block.text.trim();

        if let Some(tag) = self.heading_tag(text) {
            return (tag, None);
        }
        if self.is_metadata_line(text) {
            return (Tag::Metadata, None);
        }
        if let Some(href) = &block.link {
            return self.link_tag(href, doc);
        }
        if TEXT_URL_RE.is_match(text) {
            return if self.rules.is_excluded_url(text) || text.contains(&self.rules.base_host) {
                (Tag::Noise, None)
            } else {
                (Tag::Reference, Some(text.to_string()))
            };
        }
        if self.rules.is_boilerplate(text) {
            return (Tag::Noise, None);
        }
        (Tag::Prose, None)
    }

    fn heading_tag(&self, text: &str) -> Option<Tag> {
        if text.is_empty() || text.len() > self.rules.max_heading_len {
            return None;
        }
        let lower = text.to_lowercase();
        for heading in &self.rules.narrative_headings {
            if lower == *heading || lower.starts_with(heading.as_str()) {
                return Some(Tag::NarrativeHeading);
            }
        }
        if lower.starts_with(&self.rules.related_heading) {
            return Some(Tag::RelatedHeading);
        }
        None
    }

    /// `Label:` with the colon required, so narrative sentences that merely
    /// begin with a label word never match.
    fn is_metadata_line(&self, text: &str) -> bool {
        let Some((head, _)) = text.split_once(':') else {
            return false;
        };
        let head = head.trim();
        self.rules
            .metadata_labels
            .iter()
            .any(|label| head.eq_ignore_ascii_case(label))
    }

    fn link_tag(&self, href: &str, doc: &PageDocument) -> (Tag, Option<String>) {
        let Ok(resolved) = doc.url.join(href) else {
            return (Tag::Noise, None);
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            return (Tag::Noise, None);
        }

        if self.rules.is_self_host(&resolved) {
            let own_path = doc.url.path().trim_end_matches('/');
            let link_path = resolved.path().trim_end_matches('/');
            if resolved.path().starts_with(&self.rules.repository_path) && link_path != own_path {
                return (Tag::RelatedCandidate, Some(resolved.to_string()));
            }
            return (Tag::Noise, None);
        }

        if self.rules.is_excluded_url(resolved.as_str()) {
            return (Tag::Noise, None);
        }
        (Tag::Reference, Some(resolved.to_string()))
    }

    /// Second pass: walk in document order, tracking the current region and
    /// buffering prose runs until a boundary decides their fate.
    fn resolve(&self, doc: &PageDocument, tagged: Vec<(Tag, Option<String>)>) -> Vec<ClassifiedBlock> {
        let mut out: Vec<ClassifiedBlock> = Vec::with_capacity(tagged.len());
        let mut region = Region::Other;
        let mut current_section: Option<String> = None;
        let mut run: Vec<usize> = Vec::new();

        for (position, (tag, link)) in tagged.into_iter().enumerate() {
            let text = doc.blocks[position].text.trim().to_string();
            // Everything starts as noise; the match below upgrades it.
            out.push(ClassifiedBlock {
                position,
                role: BlockRole::Noise,
                text,
                link,
                section: None,
            });

            match tag {
                Tag::Prose => {
                    run.push(position);
                    continue;
                }
                _ => self.flush_run(doc, &mut out, &mut run, region, current_section.as_deref()),
            }

            let entry = out
                .last_mut()
                .expect("block pushed above");
            match tag {
                Tag::NarrativeHeading => {
                    entry.role = BlockRole::SectionHeading;
                    region = Region::Narrative;
                    current_section = Some(entry.text.clone());
                }
                Tag::RelatedHeading => {
                    entry.role = BlockRole::SectionHeading;
                    region = Region::Related;
                    current_section = None;
                }
                Tag::Metadata => entry.role = BlockRole::Metadata,
                Tag::Reference => entry.role = BlockRole::Reference,
                Tag::RelatedCandidate => {
                    // Related-record links count only outside narrative prose.
                    if region != Region::Narrative {
                        entry.role = BlockRole::Related;
                    }
                }
                Tag::Noise | Tag::Prose => {}
            }
        }
        self.flush_run(doc, &mut out, &mut run, region, current_section.as_deref());

        out
    }

    /// Upgrades a buffered prose run to narrative when it passes the content
    /// test. Runs inside the related section never qualify.
    fn flush_run(
        &self,
        doc: &PageDocument,
        out: &mut [ClassifiedBlock],
        run: &mut Vec<usize>,
        region: Region,
        section: Option<&str>,
    ) {
        if run.is_empty() {
            return;
        }
        let accepted = region != Region::Related && self.run_is_narrative(doc, run);
        if accepted {
            for &idx in run.iter() {
                let entry = &mut out[idx];
                entry.role = BlockRole::Narrative;
                entry.section = if region == Region::Narrative {
                    section.map(str::to_string)
                } else {
                    None
                };
            }
        }
        run.clear();
    }

    /// The relaxed either/or narrative test: one substantial paragraph, or
    /// enough combined length. Many genuine narratives are a single long
    /// paragraph, so a two-paragraph minimum would lose them.
    fn run_is_narrative(&self, doc: &PageDocument, run: &[usize]) -> bool {
        let mut total = 0usize;
        for &idx in run {
            let len = doc.blocks[idx].text.trim().len();
            if len >= self.rules.substantial_paragraph_len {
                return true;
            }
            total += len;
        }
        total > self.rules.min_run_len
    }
}
