//! Chat session state and strategy selection.
//!
//! The session context is an explicit object passed by reference into each
//! strategy call. Ownership per state slice: the engine owns the generation
//! flags (`is_generating`, `first_token_received`, `tool_in_use`) and the
//! optimistic message bookkeeping; `chat_messages` becomes authoritative
//! only after the persistence layer confirms a turn.

pub mod engine;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

use crate::error::ChatError;
use crate::types::{
    Assistant, Chat, ChatMessage, ChatSettings, FileItem, Message, MessageImage, Profile,
    ToolRegistration,
};

pub use engine::ChatEngine;

/// Everything one chat session mutates across sends.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// The unsent input. Restored verbatim when a send fails, so the user
    /// can retry without retyping.
    pub user_input: String,
    pub chat: Option<Chat>,
    pub chat_messages: Vec<ChatMessage>,
    pub chat_file_items: Vec<FileItem>,
    /// Files attached to the chat, passed as retrieval scope.
    pub chat_files: Vec<Uuid>,
    pub chat_images: Vec<MessageImage>,
    /// Image references attached to the message being composed.
    pub pending_image_paths: Vec<String>,
    pub selected_tools: Vec<ToolRegistration>,
    pub chat_settings: ChatSettings,
    pub workspace_instructions: String,
    pub profile: Profile,
    pub assistant: Option<Assistant>,
    pub use_retrieval: bool,
    pub source_count: usize,
    pub is_generating: bool,
    pub first_token_received: bool,
    pub tool_in_use: String,
    /// IDs of optimistic messages awaiting persistence confirmation.
    optimistic_ids: Vec<Uuid>,
}

impl SessionState {
    pub fn new(profile: Profile, chat_settings: ChatSettings) -> Self {
        Self {
            user_input: String::new(),
            chat: None,
            chat_messages: Vec::new(),
            chat_file_items: Vec::new(),
            chat_files: Vec::new(),
            chat_images: Vec::new(),
            pending_image_paths: Vec::new(),
            selected_tools: Vec::new(),
            chat_settings,
            workspace_instructions: String::new(),
            profile,
            assistant: None,
            use_retrieval: false,
            source_count: 4,
            is_generating: false,
            first_token_received: false,
            tool_in_use: "none".to_string(),
            optimistic_ids: Vec::new(),
        }
    }

    pub fn next_sequence_number(&self) -> i64 {
        self.chat_messages
            .iter()
            .map(|m| m.message.sequence_number)
            .max()
            .map(|seq| seq + 1)
            .unwrap_or(0)
    }

    /// Insert temporary user + placeholder assistant messages so they are
    /// visible before any network round-trip completes.
    pub fn push_optimistic(&mut self, user: Message, assistant: Message) {
        self.optimistic_ids.push(user.id);
        self.optimistic_ids.push(assistant.id);
        self.chat_messages.push(ChatMessage::bare(user));
        self.chat_messages.push(ChatMessage::bare(assistant));
    }

    /// Drop optimistic messages that were never confirmed.
    pub fn rollback_optimistic(&mut self) {
        if self.optimistic_ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.optimistic_ids);
        self.chat_messages.retain(|m| !ids.contains(&m.message.id));
    }

    /// Replace optimistic messages with their persisted counterparts.
    pub fn confirm_optimistic(&mut self, stored: Vec<ChatMessage>) {
        let ids = std::mem::take(&mut self.optimistic_ids);
        self.chat_messages.retain(|m| !ids.contains(&m.message.id));
        self.chat_messages.extend(stored);
        self.chat_messages
            .sort_by_key(|m| m.message.sequence_number);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlIntent {
    pub url: String,
    pub cleaned_query: String,
}

/// Per-send classification result.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub crawl: Option<CrawlIntent>,
    pub web_search: bool,
}

/// Exactly one strategy executes per message.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Crawl { url: String, cleaned_query: String },
    WebSearch,
    Tools,
    Completion,
}

/// Fixed priority: crawl > web search > tools > plain completion, modeled as
/// an ordered (predicate, strategy) list evaluated once per send.
pub fn select_strategy(classification: &Classification, has_tools: bool) -> Strategy {
    let crawl = classification.crawl.as_ref().map(|intent| Strategy::Crawl {
        url: intent.url.clone(),
        cleaned_query: intent.cleaned_query.clone(),
    });

    let candidates: [(bool, Option<Strategy>); 4] = [
        (crawl.is_some(), crawl),
        (classification.web_search, Some(Strategy::WebSearch)),
        (has_tools, Some(Strategy::Tools)),
        (true, Some(Strategy::Completion)),
    ];

    candidates
        .into_iter()
        .find_map(|(predicate, strategy)| if predicate { strategy } else { None })
        .unwrap_or(Strategy::Completion)
}

/// The confirmed result of one send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
    pub generated_text: String,
}

/// Event sink for streaming tokens and progress events. HTTP servers can
/// provide SSE-backed implementations; non-streaming callers use
/// `NoopEmitter`.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, data: serde_json::Value);
}

pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: &str, _data: serde_json::Value) {}
}

pub type FallbackAttempt<'a, T> = (
    &'static str,
    Pin<Box<dyn Future<Output = Result<T, ChatError>> + Send + 'a>>,
);

/// Declarative fallback chain: strategies tried in order, first success
/// wins, and total exhaustion surfaces every attempt's failure in one
/// combined message. Cancellation is never retried.
pub async fn run_fallback_chain<T>(attempts: Vec<FallbackAttempt<'_, T>>) -> Result<T, ChatError> {
    let mut failures: Vec<String> = Vec::new();
    for (label, attempt) in attempts {
        match attempt.await {
            Ok(value) => return Ok(value),
            Err(ChatError::Cancelled) => return Err(ChatError::Cancelled),
            Err(error) => {
                tracing::warn!(attempt = label, error = %error, "Fallback attempt failed");
                failures.push(format!("{label} failed ({error})"));
            }
        }
    }
    Err(ChatError::FallbackExhausted(failures.join(" and ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_strategy_priority_order() {
        let classification = Classification {
            crawl: Some(CrawlIntent {
                url: "https://example.com".into(),
                cleaned_query: "summarize this".into(),
            }),
            web_search: true,
        };
        // Crawl wins over everything.
        assert!(matches!(
            select_strategy(&classification, true),
            Strategy::Crawl { .. }
        ));

        // Web search wins over tools.
        let classification = Classification {
            crawl: None,
            web_search: true,
        };
        assert_eq!(select_strategy(&classification, true), Strategy::WebSearch);

        // Tools win over plain completion.
        let classification = Classification::default();
        assert_eq!(select_strategy(&classification, true), Strategy::Tools);
        assert_eq!(select_strategy(&classification, false), Strategy::Completion);
    }

    #[test]
    fn test_optimistic_rollback_restores_history() {
        let mut session = SessionState::new(
            Profile {
                user_id: Uuid::new_v4(),
                username: "u".into(),
                profile_context: String::new(),
            },
            ChatSettings::default(),
        );
        let existing = Message::new(Uuid::nil(), Uuid::nil(), Role::User, "old", 0, "m");
        session.chat_messages.push(ChatMessage::bare(existing));

        let user = Message::new(Uuid::nil(), Uuid::nil(), Role::User, "new", 1, "m");
        let assistant = Message::new(Uuid::nil(), Uuid::nil(), Role::Assistant, "", 2, "m");
        session.push_optimistic(user, assistant);
        assert_eq!(session.chat_messages.len(), 3);

        session.rollback_optimistic();
        assert_eq!(session.chat_messages.len(), 1);
        assert_eq!(session.chat_messages[0].message.content, "old");
    }

    #[test]
    fn test_next_sequence_number_is_monotonic() {
        let mut session = SessionState::new(
            Profile {
                user_id: Uuid::new_v4(),
                username: "u".into(),
                profile_context: String::new(),
            },
            ChatSettings::default(),
        );
        assert_eq!(session.next_sequence_number(), 0);
        session
            .chat_messages
            .push(ChatMessage::bare(Message::new(
                Uuid::nil(),
                Uuid::nil(),
                Role::User,
                "hi",
                4,
                "m",
            )));
        assert_eq!(session.next_sequence_number(), 5);
    }

    #[tokio::test]
    async fn test_fallback_chain_first_success_wins() {
        let attempts: Vec<FallbackAttempt<&str>> = vec![
            ("first", Box::pin(async { Ok("one") })),
            ("second", Box::pin(async { panic!("never polled") })),
        ];
        assert_eq!(run_fallback_chain(attempts).await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_fallback_chain_combines_failures() {
        let attempts: Vec<FallbackAttempt<&str>> = vec![
            (
                "website crawl",
                Box::pin(async {
                    Err(ChatError::Upstream {
                        status: 504,
                        message: "timed out".into(),
                    })
                }),
            ),
            (
                "web search fallback",
                Box::pin(async { Err(ChatError::Unreachable("no network".into())) }),
            ),
        ];
        let err = run_fallback_chain(attempts).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("website crawl failed"));
        assert!(message.contains("web search fallback failed"));
        assert!(message.contains("timed out"));
        assert!(message.contains("no network"));
    }

    #[tokio::test]
    async fn test_fallback_chain_stops_on_cancellation() {
        let attempts: Vec<FallbackAttempt<&str>> = vec![
            ("first", Box::pin(async { Err(ChatError::Cancelled) })),
            ("second", Box::pin(async { Ok("never") })),
        ];
        assert!(matches!(
            run_fallback_chain(attempts).await,
            Err(ChatError::Cancelled)
        ));
    }
}
