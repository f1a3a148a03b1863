//! Web Search Strategy.
//!
//! Pre-flight connectivity check, optional context-aware query rewrite,
//! SERP fetch with basic-auth credentials, result normalization, and a
//! single buffered completion over system → history → results → question.
//! Only the synthesized answer text leaves this module; raw results are
//! never persisted.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::abort::{abortable, AbortSignal};
use crate::config::SearchBackendConfig;
use crate::error::ChatError;
use crate::llm::{ChatResponse, CompletionProvider, CompletionRequest, ProviderMessage};
use crate::types::{ChatSettings, ConversationTurn};

/// Turns of history offered to the query-rewrite call.
const REWRITE_CONTEXT_TURNS: usize = 8;
/// A rewrite shorter than this is considered trivial and discarded.
const MIN_REWRITE_LEN: usize = 4;

const SEARCH_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Use the up-to-date web search results below; cite sources by number.";

const REWRITE_SYSTEM_PROMPT: &str = r#"You are a search query rewriting assistant. Given a user's query and the recent conversation, decide whether the query depends on conversation context (pronouns, follow-ups, ellipsis). If it does, rewrite it into a self-contained web search query. If it is already self-contained, return it unchanged.

Reply with the search query only, without quotes or explanation."#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchResultKind {
    News,
    Image,
    Video,
    Organic,
}

impl SearchResultKind {
    fn from_raw(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("news") {
            SearchResultKind::News
        } else if lower.contains("image") {
            SearchResultKind::Image
        } else if lower.contains("video") {
            SearchResultKind::Video
        } else {
            SearchResultKind::Organic
        }
    }
}

/// A normalized search hit. Ephemeral: produced per request and discarded
/// after the answer is synthesized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(rename = "type")]
    pub kind: SearchResultKind,
    pub title: String,
    pub link: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

pub struct WebSearchClient {
    config: SearchBackendConfig,
    provider: Arc<dyn CompletionProvider>,
    client: Client,
}

impl WebSearchClient {
    pub fn new(
        config: SearchBackendConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> Result<Self, ChatError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChatError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            config,
            provider,
            client,
        })
    }

    fn check_credentials(&self) -> Result<(), ChatError> {
        if self.config.login.is_empty() || self.config.password.is_empty() {
            return Err(ChatError::Configuration(
                "Missing search backend credentials".to_string(),
            ));
        }
        Ok(())
    }

    /// Pre-flight connectivity check against the search backend.
    pub async fn check_connection(&self) -> bool {
        let result = self
            .client
            .get(&self.config.status_endpoint)
            .basic_auth(&self.config.login, Some(&self.config.password))
            .header("Content-Type", "application/json")
            .send()
            .await;
        matches!(result, Ok(response) if response.status().is_success())
    }

    /// Fetch the backend's status payload (for the connection endpoint).
    pub async fn connection_info(&self) -> Result<Value, ChatError> {
        self.check_credentials()?;
        let response = self
            .client
            .get(&self.config.status_endpoint)
            .basic_auth(&self.config.login, Some(&self.config.password))
            .header("Content-Type", "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                message: "search backend status check failed".to_string(),
            });
        }
        response.json().await.map_err(ChatError::from)
    }

    /// Execute the raw SERP call and return the provider payload.
    pub async fn fetch_raw(&self, query: &str, signal: &AbortSignal) -> Result<Value, ChatError> {
        self.check_credentials()?;
        let body = serde_json::json!([{
            "language_code": self.config.language_code,
            "location_name": self.config.location_name,
            "keyword": query,
        }]);

        abortable(signal, async {
            let response = self
                .client
                .post(&self.config.endpoint)
                .basic_auth(&self.config.login, Some(&self.config.password))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ChatError::Upstream {
                    status: status.as_u16(),
                    message: format!("search backend error {status}: {text}"),
                });
            }
            response.json().await.map_err(ChatError::from)
        })
        .await
    }

    /// Normalize raw provider items into the SearchResult shape.
    pub fn normalize(raw: &Value) -> Vec<SearchResult> {
        let items = raw
            .pointer("/tasks/0/result/0/items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        items
            .iter()
            .map(|item| SearchResult {
                kind: SearchResultKind::from_raw(
                    item.get("type").and_then(|v| v.as_str()).unwrap_or("organic"),
                ),
                title: item
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                link: item
                    .get("url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                snippet: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                image: item
                    .pointer("/images/0/url")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                date: item
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(|t| t.split(' ').next())
                    .map(String::from),
                channel: item
                    .get("website_name")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })
            .collect()
    }

    /// Contextual query rewrite. Accepts the rewrite only if it is
    /// non-trivial and differs from the original; any failure falls back to
    /// the original query; this step never blocks the search.
    pub async fn rewrite_query(
        &self,
        query: &str,
        history: &[ConversationTurn],
        model: &str,
        signal: &AbortSignal,
    ) -> String {
        let start = history.len().saturating_sub(REWRITE_CONTEXT_TURNS);
        let mut messages = vec![ProviderMessage::system(REWRITE_SYSTEM_PROMPT)];
        for turn in &history[start..] {
            messages.push(ProviderMessage::text(turn.role, turn.content.clone()));
        }
        messages.push(ProviderMessage::user(format!(
            "Query to rewrite: \"{query}\""
        )));

        let request = CompletionRequest::new(model, messages)
            .with_temperature(0.0)
            .with_max_tokens(150);

        match self.provider.chat(&request, signal).await {
            Ok(ChatResponse::Content(candidate)) => {
                accept_rewrite(query, &candidate).unwrap_or_else(|| query.to_string())
            }
            Ok(ChatResponse::ToolCalls(_)) => query.to_string(),
            Err(ChatError::Cancelled) => query.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "[WebSearch] Query rewrite failed, using original");
                query.to_string()
            }
        }
    }

    /// Full strategy: pre-flight, rewrite, fetch, synthesize. Returns the
    /// final answer text only.
    pub async fn run(
        &self,
        query: &str,
        chat_settings: Option<&ChatSettings>,
        history: &[ConversationTurn],
        signal: &AbortSignal,
    ) -> Result<String, ChatError> {
        if query.trim().is_empty() {
            return Err(ChatError::Validation("Missing `query` in body".to_string()));
        }
        self.check_credentials()?;
        if !self.check_connection().await {
            return Err(ChatError::Unreachable(
                "Cannot reach the search backend. Try again later.".to_string(),
            ));
        }

        let model = chat_settings
            .map(|s| s.model.clone())
            .unwrap_or_else(|| "gpt-4-turbo-preview".to_string());

        let search_query = if history.is_empty() {
            query.to_string()
        } else {
            self.rewrite_query(query, history, &model, signal).await
        };
        if search_query != query {
            tracing::info!(original = %query, rewritten = %search_query, "[WebSearch] Using rewritten query");
        }

        let raw = self.fetch_raw(&search_query, signal).await?;
        let results = Self::normalize(&raw);
        tracing::debug!(count = results.len(), "[WebSearch] Normalized results");

        let messages = build_answer_messages(query, &search_query, &results, history);
        let request = CompletionRequest::new(model.as_str(), messages)
            .with_temperature(chat_settings.map(|s| s.temperature).unwrap_or(0.0))
            .with_max_tokens(1200);

        match self.provider.chat(&request, signal).await? {
            ChatResponse::Content(answer) => Ok(answer),
            ChatResponse::ToolCalls(_) => Err(ChatError::Upstream {
                status: 502,
                message: "provider returned tool calls for a plain search completion".to_string(),
            }),
        }
    }
}

/// Strategy seam consumed by the orchestrator; `WebSearchClient` is the
/// production implementation.
#[async_trait::async_trait]
pub trait SearchStrategy: Send + Sync {
    async fn run(
        &self,
        query: &str,
        chat_settings: Option<&ChatSettings>,
        history: &[ConversationTurn],
        signal: &AbortSignal,
    ) -> Result<String, ChatError>;
}

#[async_trait::async_trait]
impl SearchStrategy for WebSearchClient {
    async fn run(
        &self,
        query: &str,
        chat_settings: Option<&ChatSettings>,
        history: &[ConversationTurn],
        signal: &AbortSignal,
    ) -> Result<String, ChatError> {
        WebSearchClient::run(self, query, chat_settings, history, signal).await
    }
}

/// Accept a rewrite only when it is non-trivial and actually different.
fn accept_rewrite(original: &str, candidate: &str) -> Option<String> {
    let candidate = candidate.trim().trim_matches('"').trim();
    if candidate.len() < MIN_REWRITE_LEN {
        return None;
    }
    if candidate.to_lowercase() == original.to_lowercase() {
        return None;
    }
    Some(candidate.to_string())
}

/// Fixed message order: system instruction, prior history, the serialized
/// results, then the original question. History sits between the system
/// message and the results so the model weighs conversational context before
/// seeing fresh data.
fn build_answer_messages(
    original_query: &str,
    search_query: &str,
    results: &[SearchResult],
    history: &[ConversationTurn],
) -> Vec<ProviderMessage> {
    let serialized = serde_json::to_string_pretty(results).unwrap_or_else(|_| "[]".to_string());

    let results_content = if search_query != original_query {
        format!(
            "Original query: \"{original_query}\"\nSearch query used: \"{search_query}\"\n\nWeb search results:\n{serialized}"
        )
    } else {
        format!("Web search results:\n{serialized}")
    };

    let mut messages = vec![ProviderMessage::system(SEARCH_SYSTEM_PROMPT)];
    for turn in history {
        messages.push(ProviderMessage::text(turn.role, turn.content.clone()));
    }
    messages.push(ProviderMessage::user(results_content));
    messages.push(ProviderMessage::user(format!(
        "User asked: \"{original_query}\". Use the search results above to answer."
    )));
    messages
}
