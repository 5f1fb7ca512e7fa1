//! Turns raw detail-page HTML into an ordered list of text blocks.
//!
//! Class names and DOM layout on the source site are auto-generated and
//! unstable, so nothing here keys off CSS classes: the walk picks a content
//! root, then records visible text spans and link targets in document order.
//! Role assignment happens later in [`crate::classifier`].

use scraper::{ElementRef, Html, Selector};
use url::Url;

/// One visible text span, with its link target when it was a hyperlink.
#[derive(Debug, Clone)]
pub struct PageBlock {
    /// Collapsed visible text.
    pub text: String,
    /// `href` target when the block is an anchor.
    pub link: Option<String>,
}

/// A parsed detail page: ordered blocks plus out-of-band metadata.
#[derive(Debug, Clone)]
pub struct PageDocument {
    /// Address the page was fetched from, used to drop self-references.
    pub url: Url,
    /// Blocks in document order.
    pub blocks: Vec<PageBlock>,
    /// `og:description` content, kept as a last-resort description source.
    pub meta_description: Option<String>,
}

struct RootSelectors {
    role_main: Selector,
    main: Selector,
    body: Selector,
}

impl RootSelectors {
    fn new() -> Self {
        Self {
            role_main: Selector::parse("[role=\"main\"]").expect("role selector"),
            main: Selector::parse("main").expect("main selector"),
            body: Selector::parse("body").expect("body selector"),
        }
    }

    fn pick_root<'a>(&self, document: &'a Html) -> ElementRef<'a> {
        document
            .select(&self.role_main)
            .next()
            .or_else(|| document.select(&self.main).next())
            .or_else(|| document.select(&self.body).next())
            .unwrap_or_else(|| document.root_element())
    }
}

/// Parses page HTML into ordered blocks. Malformed markup never fails; at
/// worst the result is empty.
pub fn parse_document(html: &str, url: Url) -> PageDocument {
    let document = Html::parse_document(html);
    let selectors = RootSelectors::new();
    let root = selectors.pick_root(&document);

    let mut blocks = Vec::new();
    for element in root.descendent_elements() {
        maybe_record(element, &mut blocks);
    }

    PageDocument {
        url,
        blocks,
        meta_description: meta_description(&document),
    }
}

fn maybe_record(element: ElementRef<'_>, blocks: &mut Vec<PageBlock>) {
    let tag = element.value().name();
    if matches!(
        tag,
        "script" | "style" | "template" | "noscript" | "svg" | "iframe"
    ) {
        return;
    }

    match tag {
        "a" => {
            let Some(href) = element.value().attr("href") else {
                return;
            };
            let href = href.trim();
            if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
                return;
            }
            blocks.push(PageBlock {
                text: collapse_whitespace(&element_text(&element)),
                link: Some(href.to_string()),
            });
        }
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "p" | "li" => {
            let text = collapse_whitespace(&element_text(&element));
            if text.is_empty() {
                return;
            }
            blocks.push(PageBlock { text, link: None });
        }
        // Source citations are often underlined spans rather than anchors;
        // only URL-shaped ones are worth a block of their own.
        "span" => {
            let Some(style) = element.value().attr("style") else {
                return;
            };
            if !style.contains("underline") {
                return;
            }
            let text = collapse_whitespace(&element_text(&element));
            if !text.starts_with("http") {
                return;
            }
            blocks.push(PageBlock { text, link: None });
        }
        _ => {}
    }
}

fn element_text(element: &ElementRef<'_>) -> String {
    let mut raw = String::new();
    for piece in element.text() {
        raw.push_str(piece);
    }
    raw
}

fn meta_description(document: &Html) -> Option<String> {
    let selector =
        Selector::parse("meta[property=\"og:description\"], meta[itemprop=\"description\"]")
            .expect("meta selector");
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|content| content.trim().to_string())
        .find(|content| !content.is_empty())
}

/// Collapses all whitespace runs to single spaces and trims the ends.
pub fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim().to_string()
}
