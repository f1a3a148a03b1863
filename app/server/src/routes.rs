//! Route handlers for the strategy endpoints.
//!
//! The JSON contract is fixed for UI compatibility: success responses carry
//! `{message}` (or the endpoint's documented shape), failures carry
//! `{error}` with a non-2xx status. Completion-style endpoints return the
//! token stream as a chunked plain-text body.

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use dashmap::DashMap;
use uuid::Uuid;

use samvad::abort::AbortSignal;
use samvad::crawl::CrawlMetadata;
use samvad::intent;
use samvad::llm::{ChatStreamEvent, CompletionRequest, ProviderMessage};
use samvad::types::{ConversationTurn, Role, ToolRegistration};
use samvad::{
    ChatEngine, ChatError, ChatSettings, CompletionProvider, InMemoryMessageStore, NoRetrieval,
    OpenAiCompatProvider, Profile, SessionState, TokenStream, ToolInvoker, WebSearchClient,
    WebsiteCrawler,
};

pub struct AppState {
    pub config: samvad::ChatConfig,
    pub provider: Arc<dyn CompletionProvider>,
    pub search: Arc<WebSearchClient>,
    pub crawler: Arc<WebsiteCrawler>,
    pub invoker: Arc<ToolInvoker>,
    pub engine: ChatEngine,
    /// One session per chat tab; sends within a session are serialized by
    /// taking the session out of the map for the duration of the send.
    pub sessions: DashMap<Uuid, SessionState>,
    pub server_profile: Profile,
}

impl AppState {
    pub fn new(config: samvad::ChatConfig) -> anyhow::Result<Arc<Self>> {
        let provider: Arc<dyn CompletionProvider> =
            Arc::new(OpenAiCompatProvider::new(&config.completion)?);
        let search = Arc::new(WebSearchClient::new(
            config.search.clone(),
            provider.clone(),
        )?);
        let crawler = Arc::new(WebsiteCrawler::new(config.crawl.clone())?);
        let invoker = Arc::new(ToolInvoker::new(provider.clone())?);
        let store = Arc::new(InMemoryMessageStore::new());
        let engine = ChatEngine::with_strategies(
            provider.clone(),
            search.clone(),
            crawler.clone(),
            store,
            Arc::new(NoRetrieval),
        )?;
        Ok(Arc::new(Self {
            config,
            provider,
            search,
            crawler,
            invoker,
            engine,
            sessions: DashMap::new(),
            server_profile: Profile {
                user_id: Uuid::new_v4(),
                username: "server".to_string(),
                profile_context: String::new(),
            },
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/connection", get(connection))
        .route("/api/serpapi", get(serpapi))
        .route("/api/chat/detect-url", post(detect_url))
        .route(
            "/api/chat/auto-detect-web-search",
            post(auto_detect_web_search),
        )
        .route("/api/chat/web-search", post(web_search))
        .route("/api/chat/crawl-website", post(crawl_website))
        .route("/api/chat/tools", post(tools))
        .route("/api/chat/completion", post(completion))
        .route("/api/chat/send", post(send))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn error_response(error: &ChatError) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// `m.message ?? m`: accept both bundled and raw wire messages, discarding
/// anything without a string content or a recognized role.
fn wire_turns(messages: Option<&[Value]>) -> Vec<ConversationTurn> {
    let Some(messages) = messages else {
        return Vec::new();
    };
    messages
        .iter()
        .filter_map(|value| {
            let msg = value.get("message").unwrap_or(value);
            let role = msg.get("role").and_then(|r| r.as_str()).and_then(Role::parse)?;
            let content = msg.get("content").and_then(|c| c.as_str())?;
            Some(ConversationTurn {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}

fn stream_body(stream: TokenStream) -> Response {
    let body = Body::from_stream(stream.map(|token| Ok::<_, Infallible>(Bytes::from(token))));
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn connection(State(state): State<Arc<AppState>>) -> Response {
    match state.search.connection_info().await {
        Ok(info) => Json(json!({ "ok": true, "info": info })).into_response(),
        Err(error) => {
            let status = StatusCode::from_u16(error.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "ok": false }))).into_response()
        }
    }
}

async fn serpapi(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(query) = params.get("q").filter(|q| !q.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing query parameter" })),
        )
            .into_response();
    };
    match state.search.fetch_raw(query, &AbortSignal::never()).await {
        Ok(raw) => Json(raw).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn detect_url(Json(body): Json<Value>) -> Response {
    let Some(query) = body.get("query").and_then(|q| q.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing or invalid query in request body" })),
        )
            .into_response();
    };

    let detection = intent::detect_url_intent(query);
    tracing::debug!(
        query = %query,
        urls = detection.urls.len(),
        should_crawl = detection.should_crawl(),
        "[DetectUrl] Analysis"
    );

    Json(json!({
        "success": true,
        "shouldCrawl": detection.should_crawl(),
        "data": detection,
    }))
    .into_response()
}

async fn auto_detect_web_search(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let Some(query) = body.get("query").and_then(|q| q.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing query in request body" })),
        )
            .into_response();
    };
    let turns = wire_turns(body.get("messages").and_then(|m| m.as_array()).map(|a| a.as_slice()));

    match intent::needs_web_search(
        state.provider.as_ref(),
        &state.config.completion.model,
        query,
        &turns,
        &AbortSignal::never(),
    )
    .await
    {
        Ok(decision) => Json(decision).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "[AutoDetect] Classification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to analyze query", "needsWebSearch": false })),
            )
                .into_response()
        }
    }
}

async fn web_search(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let Some(query) = body.get("query").and_then(|q| q.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing `query` in body" })),
        )
            .into_response();
    };
    let chat_settings: Option<ChatSettings> = body
        .get("chatSettings")
        .and_then(|s| serde_json::from_value(s.clone()).ok());
    let turns = wire_turns(body.get("messages").and_then(|m| m.as_array()).map(|a| a.as_slice()));

    match state
        .search
        .run(query, chat_settings.as_ref(), &turns, &AbortSignal::never())
        .await
    {
        Ok(message) => Json(json!({ "message": message })).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn crawl_website(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let Some(url) = body.get("url").and_then(|u| u.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing URL in request body" })),
        )
            .into_response();
    };

    match state.crawler.crawl(url, &AbortSignal::never()).await {
        Ok(result) => {
            let message = format!(
                "Successfully crawled \"{}\" with {} words of content.",
                result.title, result.metadata.word_count
            );
            Json(json!({ "success": true, "data": result, "message": message })).into_response()
        }
        Err(error @ ChatError::Validation(_)) => error_response(&error),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": "Failed to crawl website",
                "details": error.to_string(),
                "data": { "metadata": CrawlMetadata::failed() },
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsRequest {
    chat_settings: ChatSettings,
    messages: Vec<ProviderMessage>,
    selected_tools: Vec<ToolRegistration>,
}

async fn tools(State(state): State<Arc<AppState>>, Json(body): Json<ToolsRequest>) -> Response {
    match state
        .invoker
        .invoke(
            &body.selected_tools,
            &body.chat_settings,
            body.messages,
            &AbortSignal::never(),
        )
        .await
    {
        Ok(stream) => stream_body(stream),
        Err(error) => error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequestBody {
    chat_settings: ChatSettings,
    messages: Vec<ProviderMessage>,
}

async fn completion(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompletionRequestBody>,
) -> Response {
    let mut request = CompletionRequest::new(body.chat_settings.model.as_str(), body.messages)
        .with_temperature(body.chat_settings.temperature);
    if body.chat_settings.model == "gpt-4-vision-preview" {
        request = request.with_max_tokens(4096);
    }

    match state.provider.chat_stream(&request, &AbortSignal::never()).await {
        Ok(events) => stream_body(content_stream(events)),
        Err(error) => error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    message: String,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    chat_settings: Option<ChatSettings>,
    #[serde(default)]
    selected_tools: Vec<ToolRegistration>,
    /// Key of a built-in persona preset applied onto the chat settings.
    #[serde(default)]
    preset: Option<String>,
    #[serde(default)]
    is_regeneration: bool,
}

/// Full orchestrated send: classification, strategy dispatch, persistence.
/// Sessions live in memory, one per chat tab; a send takes its session out
/// of the map, so concurrent sends to the same session serialize on the
/// caller side exactly as the UI does.
async fn send(State(state): State<Arc<AppState>>, Json(body): Json<SendRequest>) -> Response {
    let preset = match body.preset.as_deref() {
        Some(key) => match samvad::presets::preset_by_key(key) {
            Some(preset) => Some(preset),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("Unknown preset: {key}") })),
                )
                    .into_response()
            }
        },
        None => None,
    };

    let session_id = body.session_id.unwrap_or_else(Uuid::new_v4);
    let mut session = state
        .sessions
        .remove(&session_id)
        .map(|(_, session)| session)
        .unwrap_or_else(|| {
            SessionState::new(
                state.server_profile.clone(),
                body.chat_settings.clone().unwrap_or_default(),
            )
        });
    if let Some(settings) = body.chat_settings {
        session.chat_settings = settings;
    }
    if let Some(preset) = preset {
        session.chat_settings = samvad::presets::apply_preset(&session.chat_settings, preset);
    }
    session.selected_tools = body.selected_tools;

    let result = state
        .engine
        .send_message(
            &mut session,
            &body.message,
            body.is_regeneration,
            &AbortSignal::never(),
            None,
        )
        .await;

    let chat_id = session.chat.as_ref().map(|c| c.id);
    state.sessions.insert(session_id, session);

    match result {
        Ok(outcome) => Json(json!({
            "message": outcome.generated_text,
            "sessionId": session_id,
            "chatId": chat_id,
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

/// Forward content deltas from a chat event stream into a plain token
/// stream for the response body.
fn content_stream(mut events: mpsc::Receiver<ChatStreamEvent>) -> TokenStream {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChatStreamEvent::ContentDelta(delta) => {
                    if tx.send(delta).await.is_err() {
                        break;
                    }
                }
                ChatStreamEvent::ToolCallComplete(_) => {}
                ChatStreamEvent::Done => break,
            }
        }
    });
    TokenStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_turns_accepts_bundled_and_raw_messages() {
        let messages = vec![
            json!({"message": {"role": "user", "content": "bundled"}}),
            json!({"role": "assistant", "content": "raw"}),
            json!({"role": "model", "content": "unknown role"}),
            json!({"role": "user", "content": ["not", "a", "string"]}),
        ];
        let turns = wire_turns(Some(messages.as_slice()));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "bundled");
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "raw");
    }

    #[test]
    fn test_wire_turns_handles_missing_messages() {
        assert!(wire_turns(None).is_empty());
    }
}
