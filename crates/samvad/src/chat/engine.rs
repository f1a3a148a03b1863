//! Chat orchestration engine.
//!
//! Per outgoing message: classify, pick exactly one strategy by fixed
//! priority (crawl > web search > tools > plain completion), generate,
//! then persist. Persistence is gated on successful generation, so a
//! failed send never leaves orphaned rows. Any failure restores the
//! user's unsent input; cancellation does the same silently.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::config::ChatConfig;
use crate::crawl::{build_crawl_prompt, CrawlStrategy, WebsiteCrawler};
use crate::error::ChatError;
use crate::intent;
use crate::llm::{ChatStreamEvent, CompletionProvider, CompletionRequest, TokenStream};
use crate::persistence::{ChatPatch, MessageStore};
use crate::prompt::build_final_messages;
use crate::retrieval::RetrievalService;
use crate::search::{SearchStrategy, WebSearchClient};
use crate::tools::ToolInvoker;
use crate::types::{
    Chat, ChatMessage, ChatPayload, ConversationTurn, FileItem, Message, MessageImage, Profile,
    Role,
};

use super::{
    run_fallback_chain, select_strategy, Classification, CrawlIntent, EventEmitter,
    FallbackAttempt, SendOutcome, SessionState, Strategy,
};

/// Chat names are derived from the first message, truncated to this length.
const CHAT_NAME_MAX_CHARS: usize = 100;

pub struct ChatEngine {
    provider: Arc<dyn CompletionProvider>,
    search: Arc<dyn SearchStrategy>,
    crawler: Arc<dyn CrawlStrategy>,
    invoker: ToolInvoker,
    store: Arc<dyn MessageStore>,
    retrieval: Arc<dyn RetrievalService>,
}

impl ChatEngine {
    pub fn new(
        config: &ChatConfig,
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn MessageStore>,
        retrieval: Arc<dyn RetrievalService>,
    ) -> Result<Self, ChatError> {
        let search = Arc::new(WebSearchClient::new(
            config.search.clone(),
            provider.clone(),
        )?);
        let crawler = Arc::new(WebsiteCrawler::new(config.crawl.clone())?);
        Self::with_strategies(provider, search, crawler, store, retrieval)
    }

    /// Wire the engine with explicit strategy implementations.
    pub fn with_strategies(
        provider: Arc<dyn CompletionProvider>,
        search: Arc<dyn SearchStrategy>,
        crawler: Arc<dyn CrawlStrategy>,
        store: Arc<dyn MessageStore>,
        retrieval: Arc<dyn RetrievalService>,
    ) -> Result<Self, ChatError> {
        let invoker = ToolInvoker::new(provider.clone())?;
        Ok(Self {
            provider,
            search,
            crawler,
            invoker,
            store,
            retrieval,
        })
    }

    /// Main entry point: run one send through the full pipeline.
    pub async fn send_message(
        &self,
        session: &mut SessionState,
        content: &str,
        is_regeneration: bool,
        signal: &AbortSignal,
        emitter: Option<&dyn EventEmitter>,
    ) -> Result<SendOutcome, ChatError> {
        let starting_input = content.to_string();
        session.user_input.clear();
        session.is_generating = true;
        session.first_token_received = false;

        let result = self
            .send_inner(session, content, is_regeneration, signal, emitter)
            .await;

        session.is_generating = false;
        session.first_token_received = false;
        session.tool_in_use = "none".to_string();
        if let Some(emitter) = emitter {
            emitter.emit("generation_done", serde_json::json!({}));
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                session.rollback_optimistic();
                session.user_input = starting_input;
                if !matches!(error, ChatError::Cancelled) {
                    tracing::error!(error = %error, "Send failed");
                }
                Err(error)
            }
        }
    }

    /// Edit a historical turn: delete it and everything after, then resend
    /// the edited content as a new send through the full pipeline.
    pub async fn send_edit(
        &self,
        session: &mut SessionState,
        edited_content: &str,
        sequence_number: i64,
        signal: &AbortSignal,
        emitter: Option<&dyn EventEmitter>,
    ) -> Result<SendOutcome, ChatError> {
        let chat = session
            .chat
            .clone()
            .ok_or_else(|| ChatError::Validation("No active chat to edit".to_string()))?;

        self.store
            .delete_messages_from(chat.id, sequence_number)
            .await?;
        session
            .chat_messages
            .retain(|m| m.message.sequence_number < sequence_number);

        self.send_message(session, edited_content, false, signal, emitter)
            .await
    }

    async fn send_inner(
        &self,
        session: &mut SessionState,
        content: &str,
        is_regeneration: bool,
        signal: &AbortSignal,
        emitter: Option<&dyn EventEmitter>,
    ) -> Result<SendOutcome, ChatError> {
        validate_send(session, content)?;

        // Snapshot the slices strategies read, so no strategy holds a
        // mutable borrow of the session.
        let settings = session.chat_settings.clone();
        let profile = session.profile.clone();
        let workspace_instructions = session.workspace_instructions.clone();
        let assistant = session.assistant.clone();
        let chat_images = session.chat_images.clone();
        let chat_file_items = session.chat_file_items.clone();

        // Optimistic temp messages, visible before any network round-trip.
        let next_seq = session.next_sequence_number();
        let chat_id = session.chat.as_ref().map(|c| c.id).unwrap_or(Uuid::nil());
        let mut temp_user = Message::new(
            chat_id,
            profile.user_id,
            Role::User,
            content,
            next_seq,
            &settings.model,
        );
        temp_user.image_paths = session.pending_image_paths.clone();
        let temp_assistant = Message::new(
            chat_id,
            profile.user_id,
            Role::Assistant,
            "",
            next_seq + 1,
            &settings.model,
        );

        // Context for the classifier and the search strategies: the turns
        // that existed before this send. The current message travels as the
        // query itself, never as history.
        let turns = ConversationTurn::from_chat_messages(&session.chat_messages);

        let history: Vec<ChatMessage> = if is_regeneration {
            session.chat_messages.clone()
        } else {
            let mut history = session.chat_messages.clone();
            history.push(ChatMessage::bare(temp_user.clone()));
            history
        };

        if !is_regeneration {
            session.push_optimistic(temp_user.clone(), temp_assistant);
        }

        // Retrieval for the current turn.
        let retrieved: Vec<FileItem> = if session.use_retrieval && !session.chat_files.is_empty() {
            session.tool_in_use = "retrieval".to_string();
            self.retrieval
                .retrieve(
                    content,
                    &session.chat_files,
                    &settings.embeddings_provider,
                    session.source_count,
                )
                .await?
        } else {
            Vec::new()
        };

        // Classification: URL first, web-search need only when crawl intent
        // is absent. Both are best-effort; only cancellation propagates.
        let detection = intent::detect_url_intent(content);
        let crawl_intent = if detection.should_crawl() {
            detection.main_url.as_ref().map(|url| CrawlIntent {
                url: url.clone(),
                cleaned_query: detection.cleaned_query.clone(),
            })
        } else {
            None
        };

        let web_search = if crawl_intent.is_some() {
            tracing::debug!(url = ?detection.main_url, "Skipping web search check, crawl intent present");
            false
        } else {
            match intent::needs_web_search(
                self.provider.as_ref(),
                &settings.model,
                content,
                &turns,
                signal,
            )
            .await
            {
                Ok(decision) => decision.needs_web_search,
                Err(ChatError::Cancelled) => return Err(ChatError::Cancelled),
                Err(error) => {
                    tracing::warn!(error = %error, "Web search detection failed, proceeding without");
                    false
                }
            }
        };

        let classification = Classification {
            crawl: crawl_intent,
            web_search,
        };
        let strategy = select_strategy(&classification, !session.selected_tools.is_empty());
        tracing::info!(strategy = ?strategy, "Strategy selected");

        let make_payload = |messages: Vec<ChatMessage>, current_items: Vec<FileItem>| ChatPayload {
            chat_settings: settings.clone(),
            workspace_instructions: workspace_instructions.clone(),
            chat_messages: messages,
            assistant: assistant.clone(),
            message_file_items: current_items,
            chat_file_items: chat_file_items.clone(),
        };

        let (generated_text, persisted_file_items) = match &strategy {
            Strategy::WebSearch => {
                session.tool_in_use = "web-search".to_string();
                let text = self
                    .search
                    .run(content, Some(&settings), &turns, signal)
                    .await?;
                (text, Vec::new())
            }
            Strategy::Crawl { url, cleaned_query } => {
                session.tool_in_use = "website-crawler".to_string();

                let crawl_attempt: FallbackAttempt<'_, (String, Vec<FileItem>)> = (
                    "website crawl",
                    Box::pin(async {
                        let crawl_result = self.crawler.crawl(url, signal).await?;
                        let prompt = build_crawl_prompt(&crawl_result, cleaned_query);

                        let mut crawl_history = history.clone();
                        if let Some(last) = crawl_history.last_mut() {
                            last.message.content = prompt;
                        }
                        let payload = make_payload(crawl_history, retrieved.clone());
                        let text = self
                            .generate_completion(&payload, &profile, &chat_images, signal, emitter)
                            .await?;
                        Ok((text, retrieved.clone()))
                    }),
                );
                let search_attempt: FallbackAttempt<'_, (String, Vec<FileItem>)> = (
                    "web search fallback",
                    Box::pin(async {
                        let fallback_query = format!("{cleaned_query} {url}");
                        let text = self
                            .search
                            .run(&fallback_query, Some(&settings), &turns, signal)
                            .await?;
                        Ok((text, Vec::new()))
                    }),
                );

                run_fallback_chain(vec![crawl_attempt, search_attempt]).await?
            }
            Strategy::Tools => {
                session.tool_in_use = "tools".to_string();
                let payload = make_payload(history.clone(), retrieved.clone());
                let formatted = build_final_messages(&payload, &profile, &chat_images);
                let stream = self
                    .invoker
                    .invoke(&session.selected_tools, &settings, formatted, signal)
                    .await?;
                session.tool_in_use = "none".to_string();
                let text = self.consume_stream(stream, signal, emitter).await?;
                (text, retrieved.clone())
            }
            Strategy::Completion => {
                let payload = make_payload(history.clone(), retrieved.clone());
                let text = self
                    .generate_completion(&payload, &profile, &chat_images, signal, emitter)
                    .await?;
                (text, retrieved.clone())
            }
        };

        if signal.is_aborted() {
            return Err(ChatError::Cancelled);
        }
        session.first_token_received = true;

        // Generation succeeded: create the chat if this is the first turn,
        // otherwise refresh its updated_at. Message persistence happens
        // strictly after this point.
        let chat = match session.chat.clone() {
            Some(existing) => {
                let updated = self
                    .store
                    .update_chat(
                        existing.id,
                        ChatPatch {
                            touch_updated_at: true,
                            ..ChatPatch::default()
                        },
                    )
                    .await?;
                session.chat = Some(updated.clone());
                updated
            }
            None => {
                let name: String = content.chars().take(CHAT_NAME_MAX_CHARS).collect();
                let now = Utc::now();
                let created = self
                    .store
                    .create_chat(Chat {
                        id: Uuid::new_v4(),
                        user_id: profile.user_id,
                        name,
                        model: settings.model.clone(),
                        assistant_id: assistant.as_ref().map(|a| a.id),
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
                session.chat = Some(created.clone());
                created
            }
        };

        let outcome = self
            .persist_turn(
                session,
                &chat,
                temp_user,
                generated_text,
                persisted_file_items,
                is_regeneration,
            )
            .await?;

        session.pending_image_paths.clear();
        Ok(outcome)
    }

    /// Persist the turn pair (or the regenerated assistant turn) with
    /// consecutive sequence numbers, then reconcile the optimistic messages
    /// with the stored rows.
    async fn persist_turn(
        &self,
        session: &mut SessionState,
        chat: &Chat,
        temp_user: Message,
        generated_text: String,
        file_items: Vec<FileItem>,
        is_regeneration: bool,
    ) -> Result<SendOutcome, ChatError> {
        if is_regeneration {
            let last_seq = session
                .chat_messages
                .last()
                .map(|m| m.message.sequence_number)
                .unwrap_or(0);
            self.store.delete_messages_from(chat.id, last_seq).await?;

            let assistant_message = Message::new(
                chat.id,
                session.profile.user_id,
                Role::Assistant,
                generated_text.clone(),
                last_seq,
                &session.chat_settings.model,
            );
            let stored = self.store.create_messages(vec![assistant_message]).await?;
            let stored_assistant =
                stored
                    .into_iter()
                    .next()
                    .ok_or_else(|| ChatError::Upstream {
                        status: 500,
                        message: "persistence returned no rows".to_string(),
                    })?;

            if let Some(last) = session.chat_messages.last_mut() {
                last.message = stored_assistant.clone();
            }
            let user_message = session
                .chat_messages
                .iter()
                .rev()
                .find(|m| m.message.role == Role::User)
                .map(|m| m.message.clone())
                .unwrap_or(temp_user);

            return Ok(SendOutcome {
                user_message,
                assistant_message: stored_assistant,
                generated_text,
            });
        }

        let mut user_message = temp_user;
        user_message.chat_id = chat.id;
        let assistant_message = Message::new(
            chat.id,
            session.profile.user_id,
            Role::Assistant,
            generated_text.clone(),
            user_message.sequence_number + 1,
            &session.chat_settings.model,
        );

        let stored = self
            .store
            .create_messages(vec![user_message, assistant_message])
            .await?;
        let mut stored = stored.into_iter();
        let (stored_user, stored_assistant) = match (stored.next(), stored.next()) {
            (Some(user), Some(assistant)) => (user, assistant),
            _ => {
                return Err(ChatError::Upstream {
                    status: 500,
                    message: "persistence returned fewer rows than inserted".to_string(),
                })
            }
        };

        // The assistant turn references the retrieval hits; that is what lets
        // the question turn (its predecessor) gain the source block when the
        // history is rebuilt on a later send.
        let file_item_ids: Vec<Uuid> = file_items.iter().map(|f| f.id).collect();
        session.confirm_optimistic(vec![
            ChatMessage::bare(stored_user.clone()),
            ChatMessage {
                message: stored_assistant.clone(),
                file_items: file_item_ids,
            },
        ]);
        session.chat_file_items.extend(file_items);

        Ok(SendOutcome {
            user_message: stored_user,
            assistant_message: stored_assistant,
            generated_text,
        })
    }

    /// Stream a plain completion for the given payload, surfacing the first
    /// token to the emitter.
    async fn generate_completion(
        &self,
        payload: &ChatPayload,
        profile: &Profile,
        chat_images: &[MessageImage],
        signal: &AbortSignal,
        emitter: Option<&dyn EventEmitter>,
    ) -> Result<String, ChatError> {
        let formatted = build_final_messages(payload, profile, chat_images);
        let request = CompletionRequest::new(payload.chat_settings.model.as_str(), formatted)
            .with_temperature(payload.chat_settings.temperature);

        let mut events = self.provider.chat_stream(&request, signal).await?;
        let mut text = String::new();
        while let Some(event) = events.recv().await {
            match event {
                ChatStreamEvent::ContentDelta(delta) => {
                    if text.is_empty() {
                        if let Some(emitter) = emitter {
                            emitter.emit("first_token", serde_json::json!({}));
                        }
                    }
                    text.push_str(&delta);
                }
                ChatStreamEvent::ToolCallComplete(_) => {}
                ChatStreamEvent::Done => break,
            }
        }

        if signal.is_aborted() {
            return Err(ChatError::Cancelled);
        }
        Ok(text)
    }

    async fn consume_stream(
        &self,
        mut stream: TokenStream,
        signal: &AbortSignal,
        emitter: Option<&dyn EventEmitter>,
    ) -> Result<String, ChatError> {
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            if text.is_empty() {
                if let Some(emitter) = emitter {
                    emitter.emit("first_token", serde_json::json!({}));
                }
            }
            text.push_str(&token);
        }
        if signal.is_aborted() {
            return Err(ChatError::Cancelled);
        }
        Ok(text)
    }
}

fn validate_send(session: &SessionState, content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation(
            "Message content is empty".to_string(),
        ));
    }
    if session.chat_settings.model.is_empty() {
        return Err(ChatError::Validation("Model not selected".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use crate::crawl::{CrawlMetadata, CrawlResult, CrawlStatus};
    use crate::llm::{ChatResponse, ProviderInfo};
    use crate::persistence::InMemoryMessageStore;
    use crate::retrieval::NoRetrieval;
    use crate::types::ChatSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Provider double: buffered calls answer with a fixed classifier
    /// verdict, streamed calls yield a fixed completion. All requests are
    /// recorded for assertions.
    struct MockProvider {
        classifier_answer: String,
        stream_text: String,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl MockProvider {
        fn new(classifier_answer: &str, stream_text: &str) -> Self {
            Self {
                classifier_answer: classifier_answer.to_string(),
                stream_text: stream_text.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for MockProvider {
        async fn chat(
            &self,
            request: &CompletionRequest,
            signal: &AbortSignal,
        ) -> Result<ChatResponse, ChatError> {
            if signal.is_aborted() {
                return Err(ChatError::Cancelled);
            }
            self.requests.lock().push(request.clone());
            Ok(ChatResponse::Content(self.classifier_answer.clone()))
        }

        async fn chat_stream(
            &self,
            request: &CompletionRequest,
            signal: &AbortSignal,
        ) -> Result<mpsc::Receiver<ChatStreamEvent>, ChatError> {
            if signal.is_aborted() {
                return Err(ChatError::Cancelled);
            }
            self.requests.lock().push(request.clone());
            let (tx, rx) = mpsc::channel(4);
            let text = self.stream_text.clone();
            tokio::spawn(async move {
                let _ = tx.send(ChatStreamEvent::ContentDelta(text)).await;
                let _ = tx.send(ChatStreamEvent::Done).await;
            });
            Ok(rx)
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "mock".into(),
                model: "mock".into(),
                supports_streaming: true,
                supports_functions: true,
            }
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    struct MockSearch {
        answer: Option<String>,
        queries: Mutex<Vec<String>>,
        history_lens: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SearchStrategy for MockSearch {
        async fn run(
            &self,
            query: &str,
            _chat_settings: Option<&ChatSettings>,
            history: &[ConversationTurn],
            _signal: &AbortSignal,
        ) -> Result<String, ChatError> {
            self.queries.lock().push(query.to_string());
            self.history_lens.lock().push(history.len());
            match &self.answer {
                Some(answer) => Ok(answer.clone()),
                None => Err(ChatError::Unreachable("search backend down".into())),
            }
        }
    }

    struct MockCrawler {
        result: Option<CrawlResult>,
    }

    #[async_trait]
    impl CrawlStrategy for MockCrawler {
        async fn crawl(&self, url: &str, _signal: &AbortSignal) -> Result<CrawlResult, ChatError> {
            match &self.result {
                Some(result) => Ok(CrawlResult {
                    url: url.to_string(),
                    ..result.clone()
                }),
                None => Err(ChatError::Upstream {
                    status: 504,
                    message: "crawl timed out after 30s".into(),
                }),
            }
        }
    }

    fn crawl_result() -> CrawlResult {
        CrawlResult {
            url: "https://example.com".into(),
            title: "Example Domain".into(),
            content: "Example content body".into(),
            description: Some("An example page".into()),
            metadata: CrawlMetadata {
                crawled_at: Utc::now(),
                word_count: 3,
                status: CrawlStatus::Success,
            },
        }
    }

    struct Harness {
        engine: ChatEngine,
        provider: Arc<MockProvider>,
        search: Arc<MockSearch>,
        store: Arc<InMemoryMessageStore>,
    }

    fn harness(
        classifier_answer: &str,
        stream_text: &str,
        search_answer: Option<&str>,
        crawl: Option<CrawlResult>,
    ) -> Harness {
        let provider = Arc::new(MockProvider::new(classifier_answer, stream_text));
        let search = Arc::new(MockSearch {
            answer: search_answer.map(String::from),
            queries: Mutex::new(Vec::new()),
            history_lens: Mutex::new(Vec::new()),
        });
        let crawler = Arc::new(MockCrawler { result: crawl });
        let store = Arc::new(InMemoryMessageStore::new());
        let engine = ChatEngine::with_strategies(
            provider.clone(),
            search.clone(),
            crawler,
            store.clone(),
            Arc::new(NoRetrieval),
        )
        .unwrap();
        Harness {
            engine,
            provider,
            search,
            store,
        }
    }

    fn session() -> SessionState {
        SessionState::new(
            Profile {
                user_id: Uuid::new_v4(),
                username: "tester".into(),
                profile_context: String::new(),
            },
            ChatSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_web_search_send_persists_one_turn_pair() {
        let h = harness("YES", "", Some("It is sunny in Berlin."), None);
        let mut session = session();
        let signal = AbortController::new().signal();

        let outcome = h
            .engine
            .send_message(
                &mut session,
                "What's the weather in Berlin today?",
                false,
                &signal,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.generated_text, "It is sunny in Berlin.");
        let chat = session.chat.clone().unwrap();
        let stored = h.store.messages_for_chat(chat.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].sequence_number, stored[0].sequence_number + 1);
        assert!(!session.is_generating);
        // The search strategy saw the original query with no prior turns:
        // the current message travels as the query, never as history.
        assert_eq!(
            h.search.queries.lock().as_slice(),
            ["What's the weather in Berlin today?"]
        );
        assert_eq!(h.search.history_lens.lock().as_slice(), [0]);
    }

    #[tokio::test]
    async fn test_crawl_send_routes_through_completion() {
        let h = harness("YES", "The page describes examples.", None, Some(crawl_result()));
        let mut session = session();
        let signal = AbortController::new().signal();

        let outcome = h
            .engine
            .send_message(
                &mut session,
                "https://example.com summarize this",
                false,
                &signal,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.generated_text, "The page describes examples.");
        // The streamed completion received the content-grounded prompt.
        let requests = h.provider.requests.lock();
        let completion = requests.last().unwrap();
        let last_content = completion
            .messages
            .last()
            .unwrap()
            .content
            .as_ref()
            .unwrap()
            .text()
            .unwrap()
            .to_string();
        assert!(last_content.contains("**Website Content:**"));
        assert!(last_content.contains("Example content body"));
        assert!(last_content.contains("summarize this"));
        // The classifier was never consulted: crawl intent takes priority.
        assert_eq!(requests.len(), 1);
        drop(requests);

        // The persisted user message keeps the original text, not the prompt.
        assert_eq!(outcome.user_message.content, "https://example.com summarize this");
        let stored = h
            .store
            .messages_for_chat(session.chat.unwrap().id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_crawl_failure_falls_back_to_search() {
        let h = harness("YES", "", Some("Fallback answer from search."), None);
        let mut session = session();
        let signal = AbortController::new().signal();

        let outcome = h
            .engine
            .send_message(
                &mut session,
                "https://example.com summarize this",
                false,
                &signal,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.generated_text, "Fallback answer from search.");
        // Fallback query = cleaned query + the failed URL.
        assert_eq!(
            h.search.queries.lock().as_slice(),
            ["summarize this https://example.com"]
        );
        let stored = h
            .store
            .messages_for_chat(session.chat.unwrap().id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_total_fallback_exhaustion_persists_nothing() {
        let h = harness("YES", "", None, None);
        let mut session = session();
        let signal = AbortController::new().signal();
        let content = "https://example.com summarize this";

        let err = h
            .engine
            .send_message(&mut session, content, false, &signal, None)
            .await
            .unwrap_err();

        match err {
            ChatError::FallbackExhausted(message) => {
                assert!(message.contains("website crawl failed"));
                assert!(message.contains("web search fallback failed"));
            }
            other => panic!("expected fallback exhaustion, got {other:?}"),
        }
        assert!(session.chat.is_none());
        assert!(session.chat_messages.is_empty());
        assert_eq!(session.user_input, content);
        assert!(!session.is_generating);
    }

    #[tokio::test]
    async fn test_plain_completion_when_classifier_says_no() {
        let h = harness("NO", "Paris is the capital of France.", Some("unused"), None);
        let mut session = session();
        let signal = AbortController::new().signal();

        let outcome = h
            .engine
            .send_message(
                &mut session,
                "What is the capital of France?",
                false,
                &signal,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.generated_text, "Paris is the capital of France.");
        assert!(h.search.queries.lock().is_empty());
        // First request was the classifier, second the streamed completion
        // with the synthesized system message in front.
        let requests = h.provider.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages[0].role, Role::System);
    }

    #[tokio::test]
    async fn test_aborted_signal_cancels_without_persistence() {
        let h = harness("NO", "never", Some("never"), None);
        let mut session = session();
        let controller = AbortController::new();
        controller.abort();

        let err = h
            .engine
            .send_message(&mut session, "hello there", false, &controller.signal(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Cancelled));
        assert!(session.chat.is_none());
        assert!(session.chat_messages.is_empty());
        assert_eq!(session.user_input, "hello there");
    }

    #[tokio::test]
    async fn test_send_edit_cascades_and_resends() {
        let h = harness("NO", "Edited answer.", None, None);
        let mut session = session();
        let signal = AbortController::new().signal();

        // Seed two turns through the normal pipeline.
        h.engine
            .send_message(&mut session, "first question", false, &signal, None)
            .await
            .unwrap();
        h.engine
            .send_message(&mut session, "second question", false, &signal, None)
            .await
            .unwrap();
        let chat_id = session.chat.clone().unwrap().id;
        assert_eq!(h.store.messages_for_chat(chat_id).await.unwrap().len(), 4);

        // Edit the second user turn (sequence 2): it and the answer after it
        // are deleted, then the edited content is resent.
        h.engine
            .send_edit(&mut session, "second question, edited", 2, &signal, None)
            .await
            .unwrap();

        let stored = h.store.messages_for_chat(chat_id).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[2].content, "second question, edited");
        assert_eq!(stored[3].content, "Edited answer.");
        let sequences: Vec<i64> = stored.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_crawl_keywords_without_url_fall_through_to_completion() {
        let h = harness("NO", "Plain answer.", Some("unused"), Some(crawl_result()));
        let mut session = session();
        let signal = AbortController::new().signal();

        let outcome = h
            .engine
            .send_message(
                &mut session,
                "can you summarize this website for me",
                false,
                &signal,
                None,
            )
            .await
            .unwrap();

        // Keywords alone never crawl: no URL means the intent is suppressed
        // and the send takes the plain completion path.
        assert_eq!(outcome.generated_text, "Plain answer.");
        assert!(h.search.queries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_regeneration_replaces_last_assistant_turn() {
        let h = harness("NO", "First answer.", None, None);
        let mut session = session();
        let signal = AbortController::new().signal();

        h.engine
            .send_message(&mut session, "a question", false, &signal, None)
            .await
            .unwrap();
        let chat_id = session.chat.clone().unwrap().id;

        let outcome = h
            .engine
            .send_message(&mut session, "a question", true, &signal, None)
            .await
            .unwrap();

        let stored = h.store.messages_for_chat(chat_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].sequence_number, 1);
        assert_eq!(outcome.assistant_message.sequence_number, 1);
        assert_eq!(session.chat_messages.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_before_any_work() {
        let h = harness("NO", "x", None, None);
        let mut session = session();
        let signal = AbortController::new().signal();

        let err = h
            .engine
            .send_message(&mut session, "   ", false, &signal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(h.provider.requests.lock().is_empty());
    }

    struct FixedRetrieval {
        items: Vec<FileItem>,
    }

    #[async_trait]
    impl crate::retrieval::RetrievalService for FixedRetrieval {
        async fn retrieve(
            &self,
            _query: &str,
            _file_scope: &[Uuid],
            _embeddings_provider: &str,
            _k: usize,
        ) -> Result<Vec<FileItem>, ChatError> {
            Ok(self.items.clone())
        }
    }

    #[tokio::test]
    async fn test_retrieval_hits_reach_the_completion_and_the_stored_turn() {
        let item = FileItem {
            id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            content: "quarterly revenue grew 12%".into(),
        };
        let provider = Arc::new(MockProvider::new("NO", "Revenue grew."));
        let search = Arc::new(MockSearch {
            answer: None,
            queries: Mutex::new(Vec::new()),
            history_lens: Mutex::new(Vec::new()),
        });
        let engine = ChatEngine::with_strategies(
            provider.clone(),
            search,
            Arc::new(MockCrawler { result: None }),
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(FixedRetrieval {
                items: vec![item.clone()],
            }),
        )
        .unwrap();

        let mut session = session();
        session.use_retrieval = true;
        session.chat_files = vec![item.file_id];
        let signal = AbortController::new().signal();

        engine
            .send_message(&mut session, "what did revenue do", false, &signal, None)
            .await
            .unwrap();

        // The completion saw the source block appended to the last message.
        let requests = provider.requests.lock();
        let last_content = requests
            .last()
            .unwrap()
            .messages
            .last()
            .unwrap()
            .content
            .as_ref()
            .unwrap()
            .text()
            .unwrap()
            .to_string();
        assert!(last_content.contains("<BEGIN SOURCE>"));
        assert!(last_content.contains("quarterly revenue grew 12%"));
        drop(requests);

        // The confirmed assistant turn carries the file item reference, so a
        // later send attaches the block to the question that triggered it.
        let assistant_turn = session
            .chat_messages
            .iter()
            .find(|m| m.message.role == Role::Assistant)
            .unwrap();
        assert_eq!(assistant_turn.file_items, vec![item.id]);
        assert_eq!(session.chat_file_items.len(), 1);
    }

    #[tokio::test]
    async fn test_second_send_touches_chat_updated_at() {
        let h = harness("NO", "answer", None, None);
        let mut session = session();
        let signal = AbortController::new().signal();

        h.engine
            .send_message(&mut session, "first", false, &signal, None)
            .await
            .unwrap();
        let first_updated = session.chat.clone().unwrap().updated_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        h.engine
            .send_message(&mut session, "second", false, &signal, None)
            .await
            .unwrap();
        assert!(session.chat.clone().unwrap().updated_at > first_updated);
    }
}
