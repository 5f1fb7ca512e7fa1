//! Assembles structured page fields from classified blocks.
//!
//! Absence of data is empty values, never an error: a page that yields
//! nothing extracts to an empty [`PageFields`].

use std::collections::HashSet;

use url::Url;

use crate::classifier::{BlockRole, ClassifiedBlock, ExtractionRules};
use crate::record::{RelatedRef, SourceRef};

/// Fields recovered from one detail page.
#[derive(Debug, Clone, Default)]
pub struct PageFields {
    pub description: Option<String>,
    pub references: Vec<SourceRef>,
    pub related: Vec<RelatedRef>,
    pub occurred: Option<String>,
    pub published: Option<String>,
}

impl PageFields {
    /// True when nothing at all was recovered.
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.references.is_empty()
            && self.related.is_empty()
            && self.occurred.is_none()
            && self.published.is_none()
    }
}

/// Builds [`PageFields`] out of classified blocks.
pub struct FieldExtractor {
    rules: ExtractionRules,
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new(ExtractionRules::default())
    }
}

impl FieldExtractor {
    pub fn new(rules: ExtractionRules) -> Self {
        Self { rules }
    }

    /// Never fails. `meta_description` is the page-level fallback from the
    /// document head, used only when no narrative survives classification.
    pub fn extract(
        &self,
        blocks: &[ClassifiedBlock],
        meta_description: Option<&str>,
    ) -> PageFields {
        PageFields {
            description: self.description(blocks, meta_description),
            references: self.references(blocks),
            related: self.related(blocks),
            occurred: metadata_value(blocks, "Occurred"),
            published: metadata_value(blocks, "Page published"),
        }
    }

    /// Ordered strategies, first non-empty result wins.
    fn description(
        &self,
        blocks: &[ClassifiedBlock],
        meta_description: Option<&str>,
    ) -> Option<String> {
        let strategies: [&dyn Fn() -> Option<String>; 3] = [
            &|| sectioned_narrative(blocks),
            &|| largest_free_run(blocks),
            &|| {
                meta_description
                    .map(str::trim)
                    .filter(|text| text.len() >= 20)
                    .map(str::to_string)
            },
        ];
        strategies.iter().find_map(|strategy| strategy())
    }

    fn references(&self, blocks: &[ClassifiedBlock]) -> Vec<SourceRef> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut refs = Vec::new();
        for block in blocks {
            if block.role != BlockRole::Reference {
                continue;
            }
            let address = match &block.link {
                Some(link) => link.clone(),
                None => trim_text_url(&block.text),
            };
            let key = normalize_url(&address);
            if !seen.insert(key) {
                continue;
            }
            refs.push(SourceRef {
                url: address,
                title: self.reference_title(block),
            });
        }
        refs
    }

    /// Anchor text makes a usable title only when it is real prose: bare
    /// URL spans and chrome phrases are dropped.
    fn reference_title(&self, block: &ClassifiedBlock) -> Option<String> {
        if block.link.is_none() {
            return None;
        }
        let title = block.text.trim();
        if title.is_empty() || title.starts_with("http") || self.rules.is_boilerplate(title) {
            return None;
        }
        Some(title.to_string())
    }

    fn related(&self, blocks: &[ClassifiedBlock]) -> Vec<RelatedRef> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut related = Vec::new();
        for block in blocks {
            if block.role != BlockRole::Related {
                continue;
            }
            let Some(address) = &block.link else {
                continue;
            };
            let title = block.text.trim();
            if title.is_empty() || self.rules.is_boilerplate(title) {
                continue;
            }
            if !seen.insert(normalize_url(address)) {
                continue;
            }
            related.push(RelatedRef {
                title: title.to_string(),
                url: address.clone(),
            });
        }
        related
    }
}

/// All narrative blocks that sit under a recognized heading, across every
/// section in document order. Stopping at the first section would truncate
/// multi-part narratives, which are the common case.
fn sectioned_narrative(blocks: &[ClassifiedBlock]) -> Option<String> {
    let parts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.role == BlockRole::Narrative && b.section.is_some())
        .map(|b| b.text.as_str())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n\n"))
}

/// Fallback: the single largest contiguous run of free-standing narrative
/// (no heading context). Runs were already length-validated during
/// classification; position adjacency reconstructs them.
fn largest_free_run(blocks: &[ClassifiedBlock]) -> Option<String> {
    let free: Vec<&ClassifiedBlock> = blocks
        .iter()
        .filter(|b| b.role == BlockRole::Narrative && b.section.is_none())
        .collect();
    if free.is_empty() {
        return None;
    }

    let mut best: Option<(usize, String)> = None;
    let mut start = 0;
    while start < free.len() {
        let mut end = start + 1;
        while end < free.len() && free[end].position == free[end - 1].position + 1 {
            end += 1;
        }
        let text: Vec<&str> = free[start..end].iter().map(|b| b.text.as_str()).collect();
        let joined = text.join("\n\n");
        if best.as_ref().map(|(len, _)| joined.len() > *len).unwrap_or(true) {
            best = Some((joined.len(), joined));
        }
        start = end;
    }
    best.map(|(_, text)| text)
}

/// Value after the label's colon, trimmed, for the first matching metadata
/// block.
fn metadata_value(blocks: &[ClassifiedBlock], label: &str) -> Option<String> {
    blocks
        .iter()
        .filter(|b| b.role == BlockRole::Metadata)
        .find_map(|b| {
            let (head, tail) = b.text.split_once(':')?;
            if head.trim().eq_ignore_ascii_case(label) {
                let value = tail.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
}

/// Dedup key: lowercased scheme and host, trailing slash stripped.
fn normalize_url(address: &str) -> String {
    match Url::parse(address.trim()) {
        Ok(url) => {
            let mut normalized = url.to_string();
            if url.path() != "/" {
                normalized = normalized.trim_end_matches('/').to_string();
            }
            normalized
        }
        Err(_) => address.trim().trim_end_matches('/').to_lowercase(),
    }
}

/// Bare-text URLs often carry sentence punctuation picked up from the span.
fn trim_text_url(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ContentClassifier;
    use crate::page::parse_document;

    const PAGE_URL: &str =
        "https://www.aiaaic.org/aiaaic-repository/ai-algorithmic-and-automation-incidents/acme-bias";

    fn extract(html: &str) -> PageFields {
        let doc = parse_document(html, Url::parse(PAGE_URL).unwrap());
        let blocks = ContentClassifier::new(ExtractionRules::default()).classify(&doc);
        FieldExtractor::new(ExtractionRules::default())
            .extract(&blocks, doc.meta_description.as_deref())
    }

    fn long_para(seed: &str) -> String {
        format!("{seed} {}", "filler words to cross the substantial threshold easily.".repeat(2))
    }

    #[test]
    fn description_spans_all_sections_in_order() {
        let para_a = long_para("Paragraph A about the failure.");
        let para_b = long_para("Paragraph B about the causes.");
        let html = format!(
            "<body><h2>What happened</h2><p>{para_a}</p>\
             <h2>Why it happened</h2><p>{para_b}</p></body>"
        );
        let fields = extract(&html);
        let description = fields.description.expect("description");
        let pos_a = description.find("Paragraph A").expect("has A");
        let pos_b = description.find("Paragraph B").expect("has B");
        assert!(pos_a < pos_b);
    }

    #[test]
    fn falls_back_to_largest_free_run() {
        let big = long_para("The big unheaded narrative block.");
        let html = format!(
            "<body><p>{big}</p><p>{big}</p>\
             <p>Occurred: June 2023</p>\
             <p>{}</p></body>",
            long_para("A smaller run.")
        );
        let fields = extract(&html);
        let description = fields.description.expect("description");
        assert!(description.contains("The big unheaded narrative block."));
        assert!(!description.contains("A smaller run."));
    }

    #[test]
    fn falls_back_to_meta_description_last() {
        let html = r#"<html><head>
            <meta property="og:description" content="Meta summary of the incident in question.">
            </head><body><p>short</p></body></html>"#;
        let fields = extract(html);
        assert_eq!(
            fields.description.as_deref(),
            Some("Meta summary of the incident in question.")
        );
    }

    #[test]
    fn references_preserve_order_and_dedupe_normalized() {
        let html = r#"<body>
            <a href="https://news.example.com/story/">First take on the incident story</a>
            <li>https://other.example.org/analysis</li>
            <a href="https://news.example.com/story">First take on the incident story</a>
        </body>"#;
        let fields = extract(html);
        let urls: Vec<&str> = fields.references.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://news.example.com/story/",
                "https://other.example.org/analysis",
            ]
        );
    }

    #[test]
    fn bare_url_references_have_no_title() {
        let html = "<body><li>https://journal.example.net/piece</li></body>";
        let fields = extract(html);
        assert_eq!(fields.references.len(), 1);
        assert!(fields.references[0].title.is_none());
    }

    #[test]
    fn metadata_values_are_taken_after_the_colon() {
        let html = r#"<body>
            <p>Occurred: June 2023</p>
            <p>Page published: 14 July 2023</p>
        </body>"#;
        let fields = extract(html);
        assert_eq!(fields.occurred.as_deref(), Some("June 2023"));
        assert_eq!(fields.published.as_deref(), Some("14 July 2023"));
    }

    #[test]
    fn empty_page_extracts_to_empty_fields() {
        let fields = extract("<body></body>");
        assert!(fields.is_empty());
    }

    #[test]
    fn normalize_url_lowercases_and_strips_slash() {
        assert_eq!(
            normalize_url("HTTPS://News.Example.COM/Story/"),
            "https://news.example.com/Story"
        );
    }
}
