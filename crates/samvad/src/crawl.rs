//! Crawl Strategy.
//!
//! Fetches a single page with a bounded timeout, extracts the readable
//! content (title/description priority chains, likely-content selectors with
//! a block-element fallback), normalizes whitespace, and hard-truncates to a
//! fixed ceiling. Any failure here triggers the orchestrator's web-search
//! fallback.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::abort::{abortable, AbortSignal};
use crate::config::CrawlConfig;
use crate::error::ChatError;

const TRUNCATION_MARKER: &str = "...\n\n[Content truncated for length]";
/// A content container qualifies only above this text length.
const CONTENT_MIN_CHARS: usize = 100;
/// Fallback block elements qualify above this text length.
const BLOCK_MIN_CHARS: usize = 20;

static WHITESPACE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\s+").expect("whitespace regex is valid"));

static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("title selector is valid"));
static OG_TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:title"]"#).expect("og:title selector is valid")
});
static H1_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("h1 selector is valid"));
static META_DESC_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[name="description"]"#).expect("description selector is valid")
});
static OG_DESC_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:description"]"#).expect("og:description selector is valid")
});
static CONTENT_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "main",
        "article",
        ".content",
        ".main-content",
        ".post-content",
        ".entry-content",
        "#content",
        "#main",
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("content selector is valid"))
    .collect()
});
static BLOCK_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("p, h1, h2, h3, h4, h5, h6, div, section").expect("block selector is valid")
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlMetadata {
    pub crawled_at: DateTime<Utc>,
    pub word_count: usize,
    pub status: CrawlStatus,
}

impl CrawlMetadata {
    /// Metadata stub attached to error payloads on the HTTP boundary.
    pub fn failed() -> Self {
        Self {
            crawled_at: Utc::now(),
            word_count: 0,
            status: CrawlStatus::Error,
        }
    }
}

/// Ephemeral crawl output; only the prompt built from it survives the send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: CrawlMetadata,
}

pub struct WebsiteCrawler {
    config: CrawlConfig,
    client: reqwest::Client,
}

impl WebsiteCrawler {
    pub fn new(config: CrawlConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ChatError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self { config, client })
    }

    pub async fn crawl(&self, url: &str, signal: &AbortSignal) -> Result<CrawlResult, ChatError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| ChatError::Validation("Invalid URL format".to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ChatError::Validation("Invalid URL format".to_string()));
        }

        tracing::info!(url = %parsed, "[Crawler] Fetching page");

        let html = abortable(signal, async {
            let response = self.client.get(parsed.clone()).send().await.map_err(|e| {
                if e.is_timeout() {
                    ChatError::Upstream {
                        status: 504,
                        message: format!(
                            "crawl timed out after {}s",
                            self.config.timeout_secs
                        ),
                    }
                } else {
                    ChatError::from(e)
                }
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(ChatError::Upstream {
                    status: status.as_u16(),
                    message: format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("request failed")
                    ),
                });
            }
            response.text().await.map_err(ChatError::from)
        })
        .await?;

        let page = extract_page(&html, self.config.max_content_chars);
        let result = CrawlResult {
            url: parsed.to_string(),
            title: page.title,
            content: page.content,
            description: page.description,
            metadata: CrawlMetadata {
                crawled_at: Utc::now(),
                word_count: page.word_count,
                status: CrawlStatus::Success,
            },
        };

        tracing::info!(
            title = %result.title,
            words = result.metadata.word_count,
            "[Crawler] Extraction complete"
        );
        Ok(result)
    }
}

/// Strategy seam consumed by the orchestrator; `WebsiteCrawler` is the
/// production implementation.
#[async_trait::async_trait]
pub trait CrawlStrategy: Send + Sync {
    async fn crawl(&self, url: &str, signal: &AbortSignal) -> Result<CrawlResult, ChatError>;
}

#[async_trait::async_trait]
impl CrawlStrategy for WebsiteCrawler {
    async fn crawl(&self, url: &str, signal: &AbortSignal) -> Result<CrawlResult, ChatError> {
        WebsiteCrawler::crawl(self, url, signal).await
    }
}

struct ExtractedPage {
    title: String,
    description: Option<String>,
    content: String,
    word_count: usize,
}

/// Parse markup and pull out readable content. Pure and synchronous; the
/// parsed DOM never crosses an await point.
fn extract_page(html: &str, max_content_chars: usize) -> ExtractedPage {
    let doc = Html::parse_document(html);

    let title = extract_title(&doc);
    let description = extract_description(&doc);

    let raw_content = extract_content(&doc);
    let normalized = WHITESPACE_RE.replace_all(&raw_content, " ").trim().to_string();
    let content = truncate_content(normalized, max_content_chars);
    let word_count = content.split_whitespace().count();

    ExtractedPage {
        title,
        description,
        content,
        word_count,
    }
}

/// Title priority: `<title>` → og:title → first `<h1>` → literal fallback.
fn extract_title(doc: &Html) -> String {
    if let Some(el) = doc.select(&TITLE_SEL).next() {
        let text = el.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return text;
        }
    }
    if let Some(content) = doc
        .select(&OG_TITLE_SEL)
        .next()
        .and_then(|el| el.value().attr("content"))
    {
        if !content.trim().is_empty() {
            return content.trim().to_string();
        }
    }
    if let Some(el) = doc.select(&H1_SEL).next() {
        let text = el.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return text;
        }
    }
    "Untitled Page".to_string()
}

/// Description priority: meta description → og:description → none.
fn extract_description(doc: &Html) -> Option<String> {
    for selector in [&*META_DESC_SEL, &*OG_DESC_SEL] {
        if let Some(content) = doc
            .select(selector)
            .next()
            .and_then(|el| el.value().attr("content"))
        {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Body content: first likely content container whose visible text passes
/// the length gate, else concatenated block-level elements.
fn extract_content(doc: &Html) -> String {
    for selector in CONTENT_SELECTORS.iter() {
        if let Some(el) = doc.select(selector).next() {
            let text = visible_text(el);
            if text.trim().len() > CONTENT_MIN_CHARS {
                return text.trim().to_string();
            }
        }
    }

    let mut content = String::new();
    for el in doc.select(&BLOCK_SEL) {
        let text = visible_text(el);
        let trimmed = text.trim();
        if trimmed.len() > BLOCK_MIN_CHARS {
            content.push_str(trimmed);
            content.push_str("\n\n");
        }
    }
    content
}

/// Collect descendant text, skipping non-content elements (scripts, nav,
/// chrome) wherever they appear in the ancestry.
fn visible_text(root: ElementRef) -> String {
    let mut out = String::new();
    for node in root.descendants() {
        if let scraper::Node::Text(text) = node.value() {
            let excluded = node
                .ancestors()
                .any(|a| a.value().as_element().map(element_excluded).unwrap_or(false));
            if !excluded {
                out.push_str(&text.text);
                out.push(' ');
            }
        }
    }
    out
}

fn element_excluded(element: &scraper::node::Element) -> bool {
    if matches!(
        element.name(),
        "script" | "style" | "nav" | "header" | "footer" | "aside"
    ) {
        return true;
    }
    if let Some(class) = element.attr("class") {
        let class = class.to_lowercase();
        if class.contains("sidebar") || class.contains("menu") || class.contains("navigation") {
            return true;
        }
    }
    false
}

/// Hard ceiling: content over the limit is cut to exactly `limit` characters
/// plus the truncation marker; shorter content is returned unmodified.
pub fn truncate_content(content: String, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((byte_index, _)) => format!("{}{}", &content[..byte_index], TRUNCATION_MARKER),
        None => content,
    }
}

/// Content-grounded prompt for the normal completion path (not the search
/// path): page metadata, extracted content, and the URL-stripped question.
pub fn build_crawl_prompt(result: &CrawlResult, cleaned_query: &str) -> String {
    format!(
        "I crawled the website \"{title}\" from {url} and extracted the following content:\n\n\
         **Website Title:** {title}\n\
         **URL:** {url}\n\
         **Description:** {description}\n\
         **Content Length:** {word_count} words\n\
         **Crawled At:** {crawled_at}\n\n\
         **Website Content:**\n{content}\n\n\
         **User's Question/Request:**\n{cleaned_query}\n\n\
         Please analyze the website content and respond to the user's question or request about this website.",
        title = result.title,
        url = result.url,
        description = result
            .description
            .as_deref()
            .unwrap_or("No description available"),
        word_count = result.metadata.word_count,
        crawled_at = result.metadata.crawled_at.format("%Y-%m-%d %H:%M:%S UTC"),
        content = result.content,
    )
}
