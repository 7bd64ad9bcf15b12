//! Auxiliary data hidden in item descriptions.
//!
//! Aggregator feeds put a comments link and vote/comment counts in the
//! description HTML. Those links become extra fetch targets; the counts are
//! kept on the summary.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use refeed_shared::{DiscoveredLink, ExtraData};

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

/// `Points: 12` style, tried before the `12 points` style.
static VOTES_RE: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)\b(?:points?|votes?|score)\s*:?\s*(\d[\d,]*)").expect("valid regex"),
        Regex::new(r"(?i)\b(\d[\d,]*)\s*(?:points?|votes?)\b").expect("valid regex"),
    ]
});

static COMMENTS_RE: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)\bcomments?\s*:?\s*(\d[\d,]*)").expect("valid regex"),
        Regex::new(r"(?i)\b(\d[\d,]*)\s*comments?\b").expect("valid regex"),
    ]
});

fn first_number(patterns: &[Regex], text: &str) -> Option<u64> {
    patterns.iter().find_map(|re| {
        let raw = re.captures(text)?.get(1)?.as_str().replace(',', "");
        raw.parse().ok()
    })
}

/// Links (with anchor texts) plus vote and comment counts from an item
/// description. `base` resolves relative hrefs.
pub fn extract_extra(description: &str, base: Option<&str>) -> ExtraData {
    if description.trim().is_empty() {
        return ExtraData::default();
    }
    let doc = Html::parse_fragment(description);
    let base = base.and_then(|b| Url::parse(b).ok());

    let mut links: Vec<DiscoveredLink> = Vec::new();
    for el in doc.select(&ANCHOR) {
        let Some(href) = el.value().attr("href").map(str::trim) else {
            continue;
        };
        let resolved = match &base {
            Some(base) => base.join(href).ok(),
            None => Url::parse(href).ok(),
        };
        let Some(url) = resolved.filter(|u| matches!(u.scheme(), "http" | "https")) else {
            continue;
        };
        let href = url.to_string();
        let text = el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ");
        match links.iter_mut().find(|l| l.href == href) {
            Some(existing) => {
                if !text.is_empty() && !existing.texts.contains(&text) {
                    existing.texts.push(text);
                }
            }
            None => links.push(DiscoveredLink {
                href,
                texts: if text.is_empty() { vec![] } else { vec![text] },
            }),
        }
    }

    let plain = doc.root_element().text().collect::<Vec<_>>().join(" ");
    ExtraData {
        links,
        votes: first_number(&*VOTES_RE, &plain),
        comments: first_number(&*COMMENTS_RE, &plain),
    }
}
