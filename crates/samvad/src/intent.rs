//! Outgoing-message intent classification.
//!
//! Two independent checks, evaluated in fixed priority order by the
//! orchestrator: URL/crawl intent first (pure, local), then web-search need
//! (a completion call with a strict two-token contract). Both are
//! best-effort; a failed classification means "no special intent".

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::abort::AbortSignal;
use crate::error::ChatError;
use crate::llm::{ChatResponse, CompletionProvider, CompletionRequest, ProviderMessage};
use crate::types::ConversationTurn;

static URL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"https?://(www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b[-a-zA-Z0-9()@:%_+.~#?&/=]*",
    )
    .expect("url regex is valid")
});

/// Phrases that signal crawl intent even without keyword-adjacent URLs.
/// Crawling still requires a resolvable URL; keywords alone never crawl.
const CRAWL_KEYWORDS: [&str; 10] = [
    "analyze this website",
    "crawl this site",
    "what's on this page",
    "summarize this website",
    "extract content from",
    "get content from",
    "read this page",
    "analyze this page",
    "what does this website say",
    "content of this site",
];

/// Substituted when removing the URL leaves an empty query.
pub const DEFAULT_CRAWL_QUERY: &str = "Please analyze this website";

/// Turns of context fed to the web-search-need classifier.
const CLASSIFIER_CONTEXT_TURNS: usize = 4;
/// Per-turn character cap for classifier context.
const CLASSIFIER_CONTEXT_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlDetection {
    pub has_url: bool,
    pub urls: Vec<String>,
    pub cleaned_query: String,
    pub main_url: Option<String>,
    #[serde(skip)]
    pub has_crawl_keywords: bool,
}

impl UrlDetection {
    /// Crawl intent per the fixed priority rules. The orchestrator still
    /// requires `main_url` before actually crawling.
    pub fn should_crawl(&self) -> bool {
        self.has_url || self.has_crawl_keywords
    }
}

/// Scan a raw message for crawl intent. The first URL is the crawl target;
/// the message with all URL substrings removed (trimmed) is the cleaned
/// query.
pub fn detect_url_intent(query: &str) -> UrlDetection {
    let urls: Vec<String> = URL_RE
        .find_iter(query)
        .map(|m| m.as_str().to_string())
        .collect();

    let cleaned = URL_RE.replace_all(query, "").trim().to_string();
    let cleaned_query = if cleaned.is_empty() {
        DEFAULT_CRAWL_QUERY.to_string()
    } else {
        cleaned
    };

    let query_lower = query.to_lowercase();
    let has_crawl_keywords = CRAWL_KEYWORDS.iter().any(|k| query_lower.contains(k));

    let main_url = urls.first().cloned();
    UrlDetection {
        has_url: !urls.is_empty(),
        urls,
        cleaned_query,
        main_url,
        has_crawl_keywords,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchDecision {
    pub needs_web_search: bool,
    pub confidence: Confidence,
    pub reasoning: String,
}

const WEB_SEARCH_CLASSIFIER_PROMPT: &str = r#"You are an AI assistant that determines whether a user's question needs current web search results to be answered properly.

Respond with exactly "YES" if the question:
- Asks about current events, recent news, or latest information
- Requests real-time data (stock prices, weather, scores)
- Needs recent updates on ongoing situations
- Asks about current status of companies, people, or events
- Requires factual verification of recent claims
- References "latest", "current", "recent", "today", "now", etc.
- Is about trending topics or breaking news

Respond with exactly "NO" if the question:
- Is about general knowledge or historical facts
- Can be answered with conversation context alone
- Is a personal opinion or subjective question
- Is about creative writing, coding, or hypothetical scenarios
- Asks for explanations of established concepts
- Is a follow-up that references previous conversation content

Consider the conversation context when making your decision."#;

/// Render recent turns as classifier context lines, newest last, each
/// truncated to a character cap.
fn context_lines(turns: &[ConversationTurn]) -> Vec<String> {
    let start = turns.len().saturating_sub(CLASSIFIER_CONTEXT_TURNS);
    turns[start..]
        .iter()
        .map(|turn| {
            let snippet: String = turn.content.chars().take(CLASSIFIER_CONTEXT_CHARS).collect();
            format!("{}: {}", turn.role.as_str(), snippet)
        })
        .collect()
}

/// Ask the completion provider whether the query needs live web search.
///
/// Expects a strict two-token answer; anything else is treated as NO with
/// low confidence. Callers treat any error as "no special intent"; this
/// check must never block the send.
pub async fn needs_web_search(
    provider: &dyn CompletionProvider,
    model: &str,
    query: &str,
    recent_turns: &[ConversationTurn],
    signal: &AbortSignal,
) -> Result<WebSearchDecision, ChatError> {
    let lines = context_lines(recent_turns);
    let context_string = if lines.is_empty() {
        String::new()
    } else {
        format!("\n\nRecent conversation context:\n{}", lines.join("\n"))
    };

    let request = CompletionRequest::new(
        model,
        vec![
            ProviderMessage::system(WEB_SEARCH_CLASSIFIER_PROMPT),
            ProviderMessage::user(format!(
                "Question: \"{query}\"{context_string}\n\nDoes this question need current web search results? Answer with exactly \"YES\" or \"NO\"."
            )),
        ],
    )
    .with_temperature(0.0)
    .with_max_tokens(50);

    let response = provider.chat(&request, signal).await?;
    let decision = match response {
        ChatResponse::Content(text) => text.trim().to_uppercase(),
        ChatResponse::ToolCalls(_) => String::new(),
    };

    let needs = decision == "YES";
    let confidence = if decision == "YES" || decision == "NO" {
        Confidence::High
    } else {
        Confidence::Low
    };

    tracing::debug!(query = %query, decision = %decision, "[Intent] Web search need");

    Ok(WebSearchDecision {
        needs_web_search: needs,
        confidence,
        reasoning: format!("Query analysis: {decision}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FixedProvider(String);

    #[async_trait]
    impl CompletionProvider for FixedProvider {
        async fn chat(
            &self,
            _request: &CompletionRequest,
            _signal: &AbortSignal,
        ) -> Result<ChatResponse, ChatError> {
            Ok(ChatResponse::Content(self.0.clone()))
        }

        async fn chat_stream(
            &self,
            _request: &CompletionRequest,
            _signal: &AbortSignal,
        ) -> Result<mpsc::Receiver<crate::llm::ChatStreamEvent>, ChatError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn info(&self) -> crate::llm::ProviderInfo {
            crate::llm::ProviderInfo {
                name: "fixed".into(),
                model: "test".into(),
                supports_streaming: false,
                supports_functions: false,
            }
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_url_detection_extracts_first_url_and_cleans_query() {
        let detection = detect_url_intent("https://example.com summarize this");
        assert!(detection.has_url);
        assert_eq!(detection.main_url.as_deref(), Some("https://example.com"));
        assert_eq!(detection.cleaned_query, "summarize this");
    }

    #[test]
    fn test_url_only_message_gets_default_query() {
        let detection = detect_url_intent("https://example.com/page");
        assert_eq!(detection.cleaned_query, DEFAULT_CRAWL_QUERY);
    }

    #[test]
    fn test_crawl_keywords_without_url() {
        let detection = detect_url_intent("please Summarize This Website for me");
        assert!(detection.has_crawl_keywords);
        assert!(!detection.has_url);
        assert!(detection.main_url.is_none());
        assert!(detection.should_crawl());
    }

    #[test]
    fn test_plain_message_has_no_crawl_intent() {
        let detection = detect_url_intent("WHAT is the WEATHER in Berlin");
        assert!(!detection.should_crawl());
        assert!(detection.urls.is_empty());
    }

    #[test]
    fn test_multiple_urls_first_wins() {
        let detection = detect_url_intent("compare https://a.com/x and https://b.com/y");
        assert_eq!(detection.urls.len(), 2);
        assert_eq!(detection.main_url.as_deref(), Some("https://a.com/x"));
        assert_eq!(detection.cleaned_query, "compare  and");
    }

    #[test]
    fn test_context_lines_caps_turns_and_chars() {
        let turns: Vec<ConversationTurn> = (0..6)
            .map(|i| ConversationTurn {
                role: Role::User,
                content: format!("{i}").repeat(300),
            })
            .collect();
        let lines = context_lines(&turns);
        assert_eq!(lines.len(), 4);
        // "user: " prefix plus 200 content chars
        assert_eq!(lines[0].chars().count(), 206);
        assert!(lines[3].contains('5'));
    }

    #[tokio::test]
    async fn test_yes_answer_is_high_confidence() {
        let provider = FixedProvider("YES".into());
        let decision = needs_web_search(&provider, "m", "weather today?", &[], &AbortSignal::never())
            .await
            .unwrap();
        assert!(decision.needs_web_search);
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn test_nonconforming_answer_is_no_with_low_confidence() {
        let provider = FixedProvider("Maybe, it depends".into());
        let decision = needs_web_search(&provider, "m", "hello", &[], &AbortSignal::never())
            .await
            .unwrap();
        assert!(!decision.needs_web_search);
        assert_eq!(decision.confidence, Confidence::Low);
    }
}
