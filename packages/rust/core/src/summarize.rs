//! Prompts and response handling for article summaries and digests.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use refeed_shared::{RefeedError, Result, Tag};

use crate::llm::LanguageModel;

const SUMMARY_TEMPLATE: &str = r#"You are an expert post summariser. Below is the content of a page I am interested in.

```html
{description}
```

```md
{content}
```

Summarise the provided content. The page may be an article or a user submitted post. Summarise discussions and comments where there are any. Focus on the content itself and ignore sidebars, footers and navigation. Do not open with "The provided page" or similar; write the summary as an expert news reporter.

Split your output into four sections: "Article", "Comments", "Related" and "References". Use simple Markdown. Put links in the "References" section and related topics in the "Related" section.
"#;

const TAG_TEMPLATE: &str = r#"You are a bot that suggests appropriate wikipedia style news tags for a piece of content.

Reply with a JSON array only, one object per tag: [{"tag": "<tag>", "confidence": <0..1>}]

{content}
"#;

const DIGEST_TEMPLATE: &str = r#"Given the following article contents:

{posts}

Write a Wikipedia "In the news" section covering these articles, one short subsection per article.
Include references and links to the original content, formatted like:

### <headline>
<two to four sentences>. [source](<link>)

The theme is "{theme}".

Provide simple markdown:"#;

const TITLE_TEMPLATE: &str =
    "Provide a suitable title for this article that is written around a theme: {theme}\n\n{article}";

/// Summary text and the tags that passed the confidence filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutput {
    pub summary: String,
    pub tags: Vec<Tag>,
}

/// One summarized post going into a digest prompt.
#[derive(Debug, Clone, Copy)]
pub struct DigestPost<'a> {
    pub title: &'a str,
    pub link: &'a str,
    pub summary: &'a str,
}

/// Builds prompts and interprets completions.
#[derive(Clone)]
pub struct Summarizer {
    model: Arc<dyn LanguageModel>,
    digest_model: Option<String>,
    min_tag_confidence: f64,
}

impl Summarizer {
    pub fn new(model: Arc<dyn LanguageModel>, min_tag_confidence: f64) -> Self {
        Self {
            model,
            digest_model: None,
            min_tag_confidence,
        }
    }

    /// Use a different model for digest articles and titles.
    pub fn with_digest_model(mut self, model: impl Into<String>) -> Self {
        self.digest_model = Some(model.into());
        self
    }

    /// Summarize an article from its feed description and the assembled
    /// `### heading` sections of its fetched resources, then tag it.
    pub async fn summarize(&self, description: &str, content: &str) -> Result<SummaryOutput> {
        let prompt = SUMMARY_TEMPLATE
            .replace("{description}", description)
            .replace("{content}", content);
        let summary = self.model.chat(None, &prompt).await?;
        let tags = self.tags(content).await?;
        let tag_list: Vec<String> = tags
            .iter()
            .map(|t| format!("{}={}", t.tag, t.confidence))
            .collect();
        debug!(summary_chars = summary.len(), tags = %tag_list.join(", "), "summarized");
        Ok(SummaryOutput { summary, tags })
    }

    pub async fn tags(&self, content: &str) -> Result<Vec<Tag>> {
        let reply = self.model.chat(None, &TAG_TEMPLATE.replace("{content}", content)).await?;
        let mut tags = parse_tags(&reply)?;
        tags.retain(|t| t.confidence >= self.min_tag_confidence);
        Ok(tags)
    }

    /// Write the body of a digest article about `theme`.
    pub async fn digest_article(&self, theme: &str, posts: &[DigestPost<'_>]) -> Result<String> {
        let posts = posts
            .iter()
            .map(|p| format!("### {} [{}]\n\n{}\n\n\n", p.title, p.link, p.summary))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = DIGEST_TEMPLATE
            .replace("{posts}", &posts)
            .replace("{theme}", theme);
        self.model.chat(self.digest_model.as_deref(), &prompt).await
    }

    /// Ask for a title for a generated digest article.
    pub async fn digest_title(&self, theme: &str, article: &str) -> Result<String> {
        let prompt = TITLE_TEMPLATE
            .replace("{theme}", theme)
            .replace("{article}", article);
        let raw = self.model.chat(self.digest_model.as_deref(), &prompt).await?;
        Ok(clean_title(&raw))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagReply {
    List(Vec<Tag>),
    Wrapped { tags: Vec<Tag> },
}

/// Parse a tag reply, tolerating a fenced code block and a `{"tags": [...]}`
/// wrapper. Unparseable replies are retryable model errors.
pub fn parse_tags(reply: &str) -> Result<Vec<Tag>> {
    let body = strip_code_fence(reply);
    let parsed: TagReply = serde_json::from_str(body).map_err(|e| {
        warn!(error = %e, "unparseable tag reply");
        RefeedError::Llm(format!("tag reply is not JSON: {e}"))
    })?;
    let tags = match parsed {
        TagReply::List(tags) | TagReply::Wrapped { tags } => tags,
    };
    Ok(tags
        .into_iter()
        .filter(|t| !t.tag.trim().is_empty())
        .map(|t| Tag {
            tag: t.tag.trim().to_string(),
            confidence: t.confidence.clamp(0.0, 1.0),
        })
        .collect())
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline.
    let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Remove surrounding quotes and a leading `Title: ` from a model title.
pub fn clean_title(raw: &str) -> String {
    let mut title = raw.trim();
    title = title.strip_prefix('"').unwrap_or(title);
    title = title.strip_suffix('"').unwrap_or(title);
    title = title.strip_prefix("Title: ").unwrap_or(title);
    title = title.strip_prefix('"').unwrap_or(title);
    title.trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Replies from a script and records every prompt.
    struct Scripted {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<(Option<String>, String)>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn chat(&self, model: Option<&str>, prompt: &str) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push((model.map(str::to_string), prompt.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| RefeedError::Llm("script exhausted".into()))
        }
    }

    #[tokio::test]
    async fn summary_keeps_only_confident_tags() {
        let model = Scripted::new(&[
            "## Article\nA compiler got faster.",
            r#"```json
[{"tag": "Compilers", "confidence": 0.9}, {"tag": "Cooking", "confidence": 0.2}, {"tag": "Rust", "confidence": 0.7}]
```"#,
        ]);
        let summarizer = Summarizer::new(model.clone(), 0.7);
        let out = summarizer
            .summarize("<p>desc</p>", "### Article\nbody text\n\n\n")
            .await
            .unwrap();

        assert_eq!(out.summary, "## Article\nA compiler got faster.");
        let names: Vec<_> = out.tags.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["Compilers", "Rust"]);
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].1.contains("<p>desc</p>"));
        assert!(prompts[0].1.contains("### Article\nbody text"));
        assert!(prompts[1].1.contains("wikipedia style"));
    }

    #[tokio::test]
    async fn digest_uses_the_digest_model() {
        let model = Scripted::new(&[
            "### Story\nText. [source](https://a)",
            "\"Title: Weekly compilers\"",
        ]);
        let summarizer = Summarizer::new(model.clone(), 0.7).with_digest_model("big-model");
        let posts = [DigestPost {
            title: "Story",
            link: "https://a",
            summary: "A summary",
        }];
        let body = summarizer.digest_article("compilers", &posts).await.unwrap();
        let title = summarizer.digest_title("compilers", &body).await.unwrap();

        assert_eq!(title, "Weekly compilers");
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts[0].0.as_deref(), Some("big-model"));
        assert!(prompts[0].1.contains("### Story [https://a]\n\nA summary"));
        assert!(prompts[0].1.contains("The theme is \"compilers\""));
        assert!(prompts[1].1.ends_with(&body));
    }

    #[test]
    fn tag_reply_shapes() {
        let wrapped = parse_tags(r#"{"tags": [{"tag": " AI ", "confidence": 1.4}]}"#).unwrap();
        assert_eq!(wrapped[0].confidence, 1.0);
        assert_eq!(parse_tags(r#"[{"tag": "AI", "confidence": 0.8}]"#).unwrap()[0].tag, "AI");
        assert!(parse_tags("I think the tags are AI and ML").unwrap_err().is_retryable());
    }

    #[test]
    fn title_cleanup() {
        assert_eq!(clean_title("  \"Title: \"Rust in 2024\"\n"), "Rust in 2024");
        assert_eq!(clean_title("Plain title"), "Plain title");
    }
}
