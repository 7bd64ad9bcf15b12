//! Atom 1.0 output.

use chrono::{SecondsFormat, Utc};

use refeed_shared::FeedSnapshot;

use crate::FeedItem;

/// Escape text for use in XML element content and attribute values.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters other than tab/newline are not legal XML.
            c if c.is_control() && c != '\t' && c != '\n' && c != '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Summary block shown above the original description.
fn entry_content(item: &FeedItem) -> String {
    let mut html = String::from("<hr/><h3>AI Summary</h3>");
    for para in item.summary.summary.split("\n\n").filter(|p| !p.trim().is_empty()) {
        html.push_str("<p>");
        html.push_str(&escape_xml(para.trim()));
        html.push_str("</p>");
    }
    let mut counts = Vec::new();
    if let Some(votes) = item.summary.extra.votes {
        counts.push(format!("{votes} votes"));
    }
    if let Some(comments) = item.summary.extra.comments {
        counts.push(format!("{comments} comments"));
    }
    if !counts.is_empty() {
        html.push_str(&format!("<p><small>{}</small></p>", counts.join(" | ")));
    }
    html.push_str("<hr/><br/><br/>");
    html.push_str(&item.article.description);
    html
}

/// Render a complete Atom document.
///
/// Source feeds are titled `[Refeed] <title>`; generated feeds (no source
/// address) keep their own title.
pub fn render_atom(snapshot: &FeedSnapshot, items: &[FeedItem], self_link: &str) -> String {
    let title = if snapshot.url.is_empty() {
        snapshot.title.clone()
    } else {
        format!("[Refeed] {}", snapshot.title)
    };
    let subtitle = if snapshot.description.is_empty() {
        format!("Refeed for {}", snapshot.title)
    } else {
        snapshot.description.clone()
    };
    let updated = items
        .iter()
        .map(|i| i.summary.created_at)
        .max()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str("<feed xmlns=\"http://www.w3.org/2005/Atom\">\n");
    xml.push_str(&format!("  <id>{}</id>\n", escape_xml(self_link)));
    xml.push_str(&format!("  <title>{}</title>\n", escape_xml(&title)));
    xml.push_str(&format!("  <subtitle>{}</subtitle>\n", escape_xml(&subtitle)));
    xml.push_str(&format!("  <updated>{updated}</updated>\n"));
    xml.push_str(&format!(
        "  <link rel=\"self\" href=\"{}\"/>\n",
        escape_xml(self_link)
    ));
    if let Some(link) = &snapshot.link {
        xml.push_str(&format!("  <link rel=\"alternate\" href=\"{}\"/>\n", escape_xml(link)));
    }
    xml.push_str(concat!("  <generator>refeed ", env!("CARGO_PKG_VERSION"), "</generator>\n"));

    for item in items {
        let article = &item.article;
        xml.push_str("  <entry>\n");
        xml.push_str(&format!(
            "    <id>{}</id>\n",
            escape_xml(&format!("{}#refeed", article.guid))
        ));
        xml.push_str(&format!("    <title>{}</title>\n", escape_xml(&article.title)));
        xml.push_str(&format!(
            "    <link rel=\"alternate\" href=\"{}\"/>\n",
            escape_xml(&article.link)
        ));
        xml.push_str(&format!(
            "    <published>{}</published>\n",
            article.published.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        xml.push_str(&format!(
            "    <updated>{}</updated>\n",
            item.summary.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        for tag in &item.summary.tags {
            xml.push_str(&format!("    <category term=\"{}\"/>\n", escape_xml(&tag.tag)));
        }
        xml.push_str(&format!(
            "    <content type=\"html\">{}</content>\n",
            escape_xml(&entry_content(item))
        ));
        xml.push_str("  </entry>\n");
    }
    xml.push_str("</feed>\n");
    xml
}
