//! Link, media, and readable-text extraction from rendered HTML.
//!
//! Everything here is synchronous and returns owned data, so parsed
//! documents never live across an `.await`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use refeed_shared::{DiscoveredLink, MediaKind, MediaRef, ReadableText, RefeedError, Result};

/// Content containers tried in order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    "#content",
    ".content",
    ".post",
];

/// Block elements whose text becomes one line of readable text.
const BLOCK_SELECTOR: &str = "h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td, th, figcaption";

/// Tags dropped before converting to Markdown.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "iframe", "noscript", "svg", "form", "header", "footer", "aside",
];

fn selector(s: &str) -> Selector {
    Selector::parse(s).expect("valid selector")
}

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));
static IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("img[src]"));
static VIDEO: LazyLock<Selector> = LazyLock::new(|| selector("video[src], video source[src]"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("title"));
static H1: LazyLock<Selector> = LazyLock::new(|| selector("h1"));
static BODY: LazyLock<Selector> = LazyLock::new(|| selector("body"));
static BLOCKS: LazyLock<Selector> = LazyLock::new(|| selector(BLOCK_SELECTOR));

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("data:")
    {
        return None;
    }
    let mut url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    url.set_fragment(None);
    Some(url.to_string())
}

/// Every outgoing link, grouped by resolved href in first-seen order, with
/// each distinct non-empty anchor text.
pub fn extract_links(html: &str, base_url: &str) -> Vec<DiscoveredLink> {
    let doc = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let mut order: Vec<DiscoveredLink> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for el in doc.select(&ANCHOR) {
        let Some(href) = el.value().attr("href").and_then(|h| resolve(base.as_ref(), h)) else {
            continue;
        };
        let text = collapse_ws(&el.text().collect::<String>());
        let slot = *index.entry(href.clone()).or_insert_with(|| {
            order.push(DiscoveredLink {
                href,
                texts: Vec::new(),
            });
            order.len() - 1
        });
        let texts = &mut order[slot].texts;
        if !text.is_empty() && !texts.contains(&text) {
            texts.push(text);
        }
    }
    order
}

/// Images with their alt text, then videos.
pub fn extract_media(html: &str, base_url: &str) -> Vec<MediaRef> {
    let doc = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut media = Vec::new();

    for el in doc.select(&IMAGE) {
        if let Some(url) = el.value().attr("src").and_then(|s| resolve(base.as_ref(), s)) {
            let alt = el
                .value()
                .attr("alt")
                .map(collapse_ws)
                .filter(|a| !a.is_empty());
            media.push(MediaRef {
                kind: MediaKind::Image,
                url,
                alt,
            });
        }
    }
    for el in doc.select(&VIDEO) {
        if let Some(url) = el.value().attr("src").and_then(|s| resolve(base.as_ref(), s)) {
            if !media.iter().any(|m| m.url == url) {
                media.push(MediaRef {
                    kind: MediaKind::Video,
                    url,
                    alt: None,
                });
            }
        }
    }
    media
}

fn content_root(doc: &Html) -> Option<ElementRef<'_>> {
    CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next())
        .or_else(|| doc.select(&BODY).next())
}

/// Readable title, plain text, and Markdown for the main content.
pub fn extract_readable(html: &str) -> Result<ReadableText> {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&TITLE)
        .next()
        .or_else(|| doc.select(&H1).next())
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .unwrap_or_default();

    let Some(root) = content_root(&doc) else {
        return Ok(ReadableText {
            title,
            ..ReadableText::default()
        });
    };

    let mut lines: Vec<String> = root
        .select(&BLOCKS)
        // Nested blocks (p inside li) would repeat their text.
        .filter(|el| {
            !el.ancestors()
                .filter_map(ElementRef::wrap)
                .take_while(|a| a.id() != root.id())
                .any(|a| BLOCKS.matches(&a))
        })
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        let all = collapse_ws(&root.text().collect::<String>());
        if !all.is_empty() {
            lines.push(all);
        }
    }

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();
    let markdown = converter
        .convert(&root.html())
        .map_err(|e| RefeedError::Conversion(format!("htmd conversion failed: {e}")))?;

    Ok(ReadableText {
        title,
        text: lines.join("\n"),
        markdown: clean_markdown(&markdown),
    })
}

/// Collapse runs of blank lines and trim.
fn clean_markdown(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    let trimmed: String = md
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    MULTI_BLANK_RE.replace_all(trimmed.trim(), "\n\n").into_owned()
}
