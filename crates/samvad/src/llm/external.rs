//! OpenAI-compatible chat completion provider over HTTP.
//!
//! Handles both plain endpoints and azure-style deployments (endpoint with a
//! deployment segment, `api-version` query, `api-key` header). Streaming uses
//! the SSE chunk format; tool calls arrive as fragments keyed by index and
//! are assembled before being surfaced.

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::abort::{abortable, AbortSignal};
use crate::config::CompletionConfig;
use crate::error::ChatError;

use super::{
    ChatResponse, ChatStreamEvent, CompletionProvider, CompletionRequest, ProviderInfo, ToolCall,
};

pub struct OpenAiCompatProvider {
    endpoint: String,
    api_key: String,
    api_version: Option<String>,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: &CompletionConfig) -> Result<Self, ChatError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChatError::Configuration(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    fn request_builder(&self, body: Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .header("api-key", &self.api_key)
            .json(&body);
        if let Some(version) = &self.api_version {
            builder = builder.query(&[("api-version", version.as_str())]);
        }
        builder
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }

    fn check_credentials(&self) -> Result<(), ChatError> {
        if self.api_key.is_empty() {
            return Err(ChatError::missing_key("Completion provider"));
        }
        Ok(())
    }

    /// Parse a response body as JSON, with a clear error if the server
    /// returned HTML (service down, misrouted deployment).
    async fn parse_json_response(response: reqwest::Response) -> Result<Value, ChatError> {
        let status = response.status();
        let body = response.text().await.map_err(ChatError::from)?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| body.chars().take(300).collect());
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                message: format!("provider returned HTML instead of JSON: {preview}"),
            });
        }

        serde_json::from_str(&body).map_err(|e| ChatError::Upstream {
            status: status.as_u16(),
            message: format!("invalid JSON from provider: {e}"),
        })
    }

    fn response_from_choice(payload: &Value) -> Result<ChatResponse, ChatError> {
        let message = payload
            .pointer("/choices/0/message")
            .ok_or_else(|| ChatError::Upstream {
                status: 502,
                message: "provider response missing choices[0].message".to_string(),
            })?;

        if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            if !calls.is_empty() {
                let tool_calls = calls
                    .iter()
                    .map(|c| ToolCall {
                        id: c.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: c
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        arguments: c
                            .pointer("/function/arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}")
                            .to_string(),
                    })
                    .collect();
                return Ok(ChatResponse::ToolCalls(tool_calls));
            }
        }

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        Ok(ChatResponse::Content(content))
    }
}

/// Serialize a ProviderMessage into the provider wire shape, nesting tool
/// calls under `function`.
fn wire_message(message: &super::ProviderMessage) -> Value {
    let mut value = json!({ "role": message.role.as_str() });
    match &message.content {
        Some(content) => value["content"] = serde_json::to_value(content).unwrap_or(Value::Null),
        None => value["content"] = Value::Null,
    }
    if let Some(calls) = &message.tool_calls {
        value["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments }
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    if let Some(name) = &message.name {
        value["name"] = json!(name);
    }
    value
}

/// Partially assembled streamed tool call, keyed by its stream index.
#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait::async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn chat(
        &self,
        request: &CompletionRequest,
        signal: &AbortSignal,
    ) -> Result<ChatResponse, ChatError> {
        self.check_credentials()?;
        let body = self.build_body(request, false);

        abortable(signal, async {
            let response = self.request_builder(body).send().await?;
            let payload = Self::parse_json_response(response).await?;
            Self::response_from_choice(&payload)
        })
        .await
    }

    async fn chat_stream(
        &self,
        request: &CompletionRequest,
        signal: &AbortSignal,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>, ChatError> {
        use futures_util::StreamExt;

        self.check_credentials()?;
        let body = self.build_body(request, true);

        let response = abortable(signal, async {
            let response = self.request_builder(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ChatError::Upstream {
                    status: status.as_u16(),
                    message: message.chars().take(300).collect(),
                });
            }
            Ok(response)
        })
        .await?;

        let (tx, rx) = mpsc::channel(256);
        let signal = signal.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut partials: Vec<PartialToolCall> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    _ = signal.aborted() => break,
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let Ok(bytes) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        for partial in partials.drain(..) {
                            let _ = tx
                                .send(ChatStreamEvent::ToolCallComplete(ToolCall {
                                    id: partial.id,
                                    name: partial.name,
                                    arguments: partial.arguments,
                                }))
                                .await;
                        }
                        let _ = tx.send(ChatStreamEvent::Done).await;
                        return;
                    }

                    let Ok(payload) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    let Some(delta) = payload.pointer("/choices/0/delta") else {
                        continue;
                    };

                    if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                        if !content.is_empty()
                            && tx
                                .send(ChatStreamEvent::ContentDelta(content.to_string()))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                        for call in calls {
                            let index =
                                call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                            while partials.len() <= index {
                                partials.push(PartialToolCall::default());
                            }
                            let partial = &mut partials[index];
                            if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                                partial.id.push_str(id);
                            }
                            if let Some(name) = call.pointer("/function/name").and_then(|v| v.as_str())
                            {
                                partial.name.push_str(name);
                            }
                            if let Some(args) =
                                call.pointer("/function/arguments").and_then(|v| v.as_str())
                            {
                                partial.arguments.push_str(args);
                            }
                        }
                    }
                }
            }

            // Stream ended without [DONE] (disconnect or abort): flush what
            // we have so the consumer is not left hanging.
            for partial in partials.drain(..) {
                let _ = tx
                    .send(ChatStreamEvent::ToolCallComplete(ToolCall {
                        id: partial.id,
                        name: partial.name,
                        arguments: partial.arguments,
                    }))
                    .await;
            }
            let _ = tx.send(ChatStreamEvent::Done).await;
        });

        Ok(rx)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "openai-compatible".to_string(),
            model: String::new(),
            supports_streaming: true,
            supports_functions: true,
        }
    }

    async fn is_ready(&self) -> bool {
        !self.api_key.is_empty()
    }
}
