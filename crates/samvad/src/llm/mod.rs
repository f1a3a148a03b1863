//! Completion provider abstraction.
//!
//! Provider responses are validated once at this boundary into tagged
//! variants (`ChatResponse::Content` / `ChatResponse::ToolCalls`), so
//! downstream code never inspects loosely-typed JSON.

pub mod external;
pub mod streaming;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::abort::AbortSignal;
use crate::error::ChatError;
use crate::types::Role;

pub use external::OpenAiCompatProvider;
pub use streaming::TokenStream;

/// Message content as the provider wire accepts it: plain text, or an
/// ordered list of text/image parts for vision models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ProviderContent {
    /// The text portion, if this content is or contains one.
    pub fn text(&self) -> Option<&str> {
        match self {
            ProviderContent::Text(text) => Some(text),
            ProviderContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Append text to the content, targeting the text part when multi-part.
    pub fn append_text(&mut self, extra: &str) {
        match self {
            ProviderContent::Text(text) => {
                text.push_str(extra);
            }
            ProviderContent::Parts(parts) => {
                if let Some(ContentPart::Text { text }) =
                    parts.iter_mut().find(|p| matches!(p, ContentPart::Text { .. }))
                {
                    text.push_str(extra);
                } else {
                    parts.insert(
                        0,
                        ContentPart::Text {
                            text: extra.to_string(),
                        },
                    );
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A chat message in provider form, with optional tool call metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: Option<ProviderContent>,
    /// Tool calls requested by the assistant (only when role=Assistant).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message answers (only when role=Tool).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    /// Name of the tool (only when role=Tool).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl ProviderMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(ProviderContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: Some(ProviderContent::Parts(parts)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(ProviderContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the call with its tool-result message.
    pub id: String,
    pub name: String,
    /// JSON arguments string, exactly as the model produced it.
    pub arguments: String,
}

/// Schema describing a function the model can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the function's parameters.
    pub parameters: JsonValue,
}

/// The result of a buffered chat completion.
#[derive(Debug, Clone)]
pub enum ChatResponse {
    /// The model produced text content (final answer).
    Content(String),
    /// The model wants tools executed before answering.
    ToolCalls(Vec<ToolCall>),
}

/// A streaming event from the chat completion.
#[derive(Debug, Clone)]
pub enum ChatStreamEvent {
    ContentDelta(String),
    /// A tool call was fully assembled from streamed fragments.
    ToolCallComplete(ToolCall),
    Done,
}

/// One completion call's inputs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ProviderMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolSchema>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            tools: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub supports_streaming: bool,
    pub supports_functions: bool,
}

/// Core trait for completion providers. Both modes are required; the abort
/// signal must stop the underlying HTTP call.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Buffered completion. Returns `Content` or `ToolCalls`.
    async fn chat(
        &self,
        request: &CompletionRequest,
        signal: &AbortSignal,
    ) -> Result<ChatResponse, ChatError>;

    /// Streaming completion. Yields `ChatStreamEvent` items until `Done`.
    async fn chat_stream(
        &self,
        request: &CompletionRequest,
        signal: &AbortSignal,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>, ChatError>;

    fn info(&self) -> ProviderInfo;

    async fn is_ready(&self) -> bool;
}
