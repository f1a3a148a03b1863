//! Tool Invoker.
//!
//! State machine: schema conversion → first completion → either stream the
//! content directly (no calls) or execute each requested call against its
//! HTTP endpoint, feed results back as tool messages, and stream a second
//! completion. Both branches surface a `TokenStream`, so tool-augmented and
//! plain responses are indistinguishable downstream.

pub mod openapi;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::mpsc;

use crate::abort::{abortable, AbortSignal};
use crate::error::ChatError;
use crate::llm::{
    ChatResponse, ChatStreamEvent, CompletionProvider, CompletionRequest, ProviderMessage,
    TokenStream, ToolCall, ToolSchema,
};
use crate::types::{ChatSettings, ToolRegistration};

pub use openapi::{colonize_path, openapi_to_functions, OpenApiConversion};

static COLON_PARAM_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r":(\w+)").expect("colon param regex is valid"));

/// Per-tool metadata collected during schema conversion.
#[derive(Debug, Clone)]
pub struct SchemaDetail {
    pub title: String,
    pub description: String,
    pub url: String,
    /// Custom headers as stored in the registry (a JSON object as text).
    pub headers: Option<String>,
    /// Colon-form path template → operation id.
    pub route_map: HashMap<String, String>,
    /// The tool's declared convention: request body vs. query string.
    pub request_in_body: bool,
    pub tool_name: String,
}

pub struct ToolInvoker {
    provider: Arc<dyn CompletionProvider>,
    client: reqwest::Client,
}

impl ToolInvoker {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| ChatError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self { provider, client })
    }

    /// Convert each selected tool's OpenAPI document. A conversion failure
    /// for one tool is logged and that tool is skipped; it never aborts the
    /// others.
    pub fn convert_tools(
        selected: &[ToolRegistration],
    ) -> (Vec<ToolSchema>, Vec<SchemaDetail>) {
        let mut all_tools = Vec::new();
        let mut details = Vec::new();

        for tool in selected {
            let conversion = serde_json::from_str::<Value>(&tool.schema)
                .map_err(|e| ChatError::Validation(format!("invalid OpenAPI JSON: {e}")))
                .and_then(|doc| openapi_to_functions(&doc));

            match conversion {
                Ok(conversion) => {
                    let route_map: HashMap<String, String> = conversion
                        .routes
                        .iter()
                        .map(|r| (colonize_path(&r.path), r.operation_id.clone()))
                        .collect();
                    all_tools.extend(conversion.functions);
                    details.push(SchemaDetail {
                        title: conversion.info.title,
                        description: conversion.info.description,
                        url: conversion.info.server,
                        headers: tool.custom_headers.clone(),
                        route_map,
                        request_in_body: conversion
                            .routes
                            .first()
                            .map(|r| r.request_in_body)
                            .unwrap_or(false),
                        tool_name: tool.name.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(tool = %tool.name, error = %e, "Schema conversion failed, skipping tool");
                }
            }
        }

        (all_tools, details)
    }

    /// Run the full invocation state machine for one turn.
    pub async fn invoke(
        &self,
        selected_tools: &[ToolRegistration],
        chat_settings: &ChatSettings,
        mut messages: Vec<ProviderMessage>,
        signal: &AbortSignal,
    ) -> Result<TokenStream, ChatError> {
        let (all_tools, details) = Self::convert_tools(selected_tools);

        let first_request = CompletionRequest::new(chat_settings.model.as_str(), messages.clone())
            .with_temperature(chat_settings.temperature)
            .with_tools(all_tools);
        let first = self.provider.chat(&first_request, signal).await?;

        let tool_calls = match first {
            ChatResponse::Content(text) => {
                // No calls requested: the first response is the final answer,
                // streamed for consistency with the tool path.
                return Ok(TokenStream::from_text(text));
            }
            ChatResponse::ToolCalls(calls) => calls,
        };

        tracing::info!(
            count = tool_calls.len(),
            tools = ?tool_calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
            "[ToolInvoker] Executing requested calls"
        );

        messages.push(ProviderMessage::assistant_tool_calls(tool_calls.clone()));

        // Sequential execution preserves deterministic ordering of the tool
        // result messages fed back to the second completion.
        for call in &tool_calls {
            let data = self.execute_call(call, &details, signal).await?;
            messages.push(ProviderMessage::tool_result(
                &call.id,
                &call.name,
                data.to_string(),
            ));
        }

        let second_request = CompletionRequest::new(chat_settings.model.as_str(), messages)
            .with_temperature(chat_settings.temperature);
        let mut events = self.provider.chat_stream(&second_request, signal).await?;

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
        Ok(TokenStream::new(rx))
    }

    /// Execute one requested call. A non-success upstream response is
    /// captured as a structured error payload rather than an error, so the model
    /// can react to it. Missing routes and parameters fail the whole turn.
    async fn execute_call(
        &self,
        call: &ToolCall,
        details: &[SchemaDetail],
        signal: &AbortSignal,
    ) -> Result<Value, ChatError> {
        let args: Value = serde_json::from_str(call.arguments.trim()).unwrap_or_else(|_| json!({}));

        let detail = details
            .iter()
            .find(|d| d.route_map.values().any(|op| op == &call.name))
            .ok_or_else(|| {
                ChatError::Validation(format!("Function {} not found in any schema", call.name))
            })?;

        let path_template = detail
            .route_map
            .iter()
            .find(|(_, op)| *op == &call.name)
            .map(|(template, _)| template.clone())
            .ok_or_else(|| {
                ChatError::Validation(format!("Path for function {} not found", call.name))
            })?;

        let path = resolve_path(&path_template, &args, &call.name)?;
        let full_url = format!("{}{}", detail.url, path);

        let response = if detail.request_in_body {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            merge_custom_headers(&mut headers, detail.headers.as_deref());

            let body = request_body_for(&detail.tool_name, &args);
            abortable(signal, async {
                self.client
                    .post(&full_url)
                    .headers(headers)
                    .json(&body)
                    .send()
                    .await
                    .map_err(ChatError::from)
            })
            .await?
        } else {
            let mut headers = HeaderMap::new();
            merge_custom_headers(&mut headers, detail.headers.as_deref());

            let query: Vec<(String, String)> = args
                .get("parameters")
                .and_then(|p| p.as_object())
                .map(|params| {
                    params
                        .iter()
                        .map(|(k, v)| (k.clone(), value_as_string(v)))
                        .collect()
                })
                .unwrap_or_default();

            abortable(signal, async {
                self.client
                    .get(&full_url)
                    .headers(headers)
                    .query(&query)
                    .send()
                    .await
                    .map_err(ChatError::from)
            })
            .await?
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                function = %call.name,
                status = status.as_u16(),
                "[ToolInvoker] Upstream call failed"
            );
            return Ok(json!({
                "error": format!("API Error {}: {}", status.as_u16(), text)
            }));
        }

        Ok(response
            .json::<Value>()
            .await
            .unwrap_or_else(|e| json!({ "error": format!("Invalid JSON response: {e}") })))
    }
}

/// Substitute colon-form path parameters from the call's parsed arguments.
/// A missing required parameter fails the whole turn, naming the parameter.
fn resolve_path(template: &str, args: &Value, function: &str) -> Result<String, ChatError> {
    let mut resolved = String::new();
    let mut last_end = 0;

    for captures in COLON_PARAM_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = args
            .pointer(&format!("/parameters/{}", name.as_str()))
            .map(value_as_string)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ChatError::Validation(format!(
                    "Parameter {} not found for function {}",
                    name.as_str(),
                    function
                ))
            })?;

        resolved.push_str(&template[last_end..whole.start()]);
        resolved.push_str(&value);
        last_end = whole.end();
    }
    resolved.push_str(&template[last_end..]);
    Ok(resolved)
}

/// Body payload selection, with the array-wrap transform for tools following
/// the dataforseo convention.
fn request_body_for(tool_name: &str, args: &Value) -> Value {
    let body = args.get("requestBody").cloned().unwrap_or_else(|| args.clone());
    if tool_name.to_lowercase().contains("dataforseo") && !body.is_array() {
        return json!([body]);
    }
    body
}

fn merge_custom_headers(headers: &mut HeaderMap, custom: Option<&str>) {
    let Some(custom) = custom else { return };
    let Ok(parsed) = serde_json::from_str::<HashMap<String, String>>(custom) else {
        tracing::warn!("Custom headers are not a JSON object, ignoring");
        return;
    };
    for (key, value) in parsed {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %key, "Skipping invalid custom header"),
        }
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    #[test]
    fn test_resolve_path_substitutes_parameters() {
        let args = json!({"parameters": {"id": "42"}});
        assert_eq!(resolve_path("/users/:id", &args, "getUser").unwrap(), "/users/42");

        let args = json!({"parameters": {"id": 7, "tab": "posts"}});
        assert_eq!(
            resolve_path("/users/:id/:tab", &args, "getUserTab").unwrap(),
            "/users/7/posts"
        );
    }

    #[test]
    fn test_resolve_path_missing_parameter_names_it() {
        let args = json!({"parameters": {}});
        let err = resolve_path("/users/:id", &args, "getUser").unwrap_err();
        match err {
            ChatError::Validation(message) => {
                assert!(message.contains("id"));
                assert!(message.contains("getUser"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_request_body_wrap_for_dataforseo_convention() {
        let args = json!({"requestBody": {"keyword": "rust"}});
        let wrapped = request_body_for("DataForSEO SERP", &args);
        assert!(wrapped.is_array());
        assert_eq!(wrapped[0]["keyword"], "rust");

        let plain = request_body_for("User API", &args);
        assert_eq!(plain["keyword"], "rust");

        // Already-array bodies are not double-wrapped.
        let args = json!({"requestBody": [{"keyword": "rust"}]});
        let wrapped = request_body_for("dataforseo labs", &args);
        assert_eq!(wrapped.as_array().map(|a| a.len()), Some(1));
    }

    #[test]
    fn test_merge_custom_headers_skips_invalid_entries() {
        let mut headers = HeaderMap::new();
        merge_custom_headers(
            &mut headers,
            Some(r#"{"Authorization": "Bearer x", "Bad\nName": "v"}"#),
        );
        assert_eq!(headers.get("authorization").unwrap(), "Bearer x");
        assert_eq!(headers.len(), 1);
    }

    fn registration(name: &str, schema: &str) -> ToolRegistration {
        ToolRegistration {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            schema: schema.to_string(),
            custom_headers: None,
        }
    }

    #[test]
    fn test_convert_tools_skips_broken_schemas() {
        let good = r#"{
            "info": {"title": "User API"},
            "servers": [{"url": "https://api.example.com"}],
            "paths": {"/users/{id}": {"get": {
                "operationId": "getUser",
                "parameters": [{"name": "id", "in": "path", "required": true,
                                "schema": {"type": "string"}}]
            }}}
        }"#;
        let tools = vec![
            registration("broken", "not json at all"),
            registration("users", good),
        ];

        let (schemas, details) = ToolInvoker::convert_tools(&tools);
        assert_eq!(schemas.len(), 1);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].route_map.get("/users/:id").unwrap(), "getUser");
        assert!(!details[0].request_in_body);
    }

    struct ContentProvider;

    #[async_trait]
    impl CompletionProvider for ContentProvider {
        async fn chat(
            &self,
            _request: &CompletionRequest,
            _signal: &AbortSignal,
        ) -> Result<ChatResponse, ChatError> {
            Ok(ChatResponse::Content("direct answer".to_string()))
        }

        async fn chat_stream(
            &self,
            _request: &CompletionRequest,
            _signal: &AbortSignal,
        ) -> Result<mpsc::Receiver<ChatStreamEvent>, ChatError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn info(&self) -> crate::llm::ProviderInfo {
            crate::llm::ProviderInfo {
                name: "test".into(),
                model: "test".into(),
                supports_streaming: true,
                supports_functions: true,
            }
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_invoke_streams_content_when_no_calls_requested() {
        let invoker = ToolInvoker::new(Arc::new(ContentProvider)).unwrap();
        let stream = invoker
            .invoke(
                &[],
                &ChatSettings::default(),
                vec![ProviderMessage::user("hello")],
                &AbortSignal::never(),
            )
            .await
            .unwrap();
        assert_eq!(stream.collect().await, "direct answer");
    }
}
