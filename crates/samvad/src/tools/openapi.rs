//! OpenAPI document → function-call schema conversion.
//!
//! Each operation becomes one callable function whose parameter schema nests
//! the path/query parameters under `parameters` and any JSON request body
//! under `requestBody`. Routes keep the original path template; the route
//! map rewrites braced params to colon form for substitution.

use serde_json::{json, Map, Value};
use std::sync::LazyLock;

use crate::error::ChatError;
use crate::llm::ToolSchema;

static BRACED_PARAM_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\{(\w+)\}").expect("braced param regex is valid"));

const METHODS: [&str; 5] = ["get", "post", "put", "patch", "delete"];

#[derive(Debug, Clone)]
pub struct OpenApiInfo {
    pub title: String,
    pub description: String,
    pub server: String,
}

#[derive(Debug, Clone)]
pub struct OpenApiRoute {
    pub path: String,
    pub method: String,
    pub operation_id: String,
    pub request_in_body: bool,
}

#[derive(Debug, Clone)]
pub struct OpenApiConversion {
    pub info: OpenApiInfo,
    pub routes: Vec<OpenApiRoute>,
    pub functions: Vec<ToolSchema>,
}

/// Rewrite `{param}` path segments to `:param` form.
pub fn colonize_path(path: &str) -> String {
    BRACED_PARAM_RE.replace_all(path, ":$1").to_string()
}

/// Resolve a single-level `$ref` against the document's component schemas.
fn resolve_schema(doc: &Value, schema: &Value) -> Value {
    if let Some(reference) = schema.get("$ref").and_then(|r| r.as_str()) {
        if let Some(name) = reference.strip_prefix("#/components/schemas/") {
            if let Some(resolved) = doc.pointer(&format!("/components/schemas/{name}")) {
                return resolved.clone();
            }
        }
    }
    schema.clone()
}

pub fn openapi_to_functions(doc: &Value) -> Result<OpenApiConversion, ChatError> {
    let title = doc
        .pointer("/info/title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChatError::Validation("OpenAPI document missing info.title".to_string()))?
        .to_string();
    let description = doc
        .pointer("/info/description")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let server = doc
        .pointer("/servers/0/url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ChatError::Validation("OpenAPI document missing servers[0].url".to_string())
        })?
        .trim_end_matches('/')
        .to_string();

    let mut routes = Vec::new();
    let mut functions = Vec::new();

    let paths = doc
        .get("paths")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    for (path, item) in &paths {
        for method in METHODS {
            let Some(operation) = item.get(method) else {
                continue;
            };
            let operation_id = operation
                .get("operationId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ChatError::Validation(format!(
                        "operation {} {} missing operationId",
                        method.to_uppercase(),
                        path
                    ))
                })?
                .to_string();

            let function_description = operation
                .get("summary")
                .or_else(|| operation.get("description"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let mut properties = Map::new();
            let mut required: Vec<Value> = Vec::new();

            // Path and query parameters, nested under `parameters`.
            let params = operation
                .get("parameters")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default();
            if !params.is_empty() {
                let mut param_properties = Map::new();
                let mut param_required: Vec<Value> = Vec::new();
                for param in &params {
                    let Some(name) = param.get("name").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let mut schema = resolve_schema(doc, param.get("schema").unwrap_or(&json!({})));
                    if let Some(desc) = param.get("description").and_then(|v| v.as_str()) {
                        schema["description"] = json!(desc);
                    }
                    param_properties.insert(name.to_string(), schema);
                    if param.get("required").and_then(|v| v.as_bool()).unwrap_or(false) {
                        param_required.push(json!(name));
                    }
                }
                properties.insert(
                    "parameters".to_string(),
                    json!({
                        "type": "object",
                        "properties": param_properties,
                        "required": param_required,
                    }),
                );
                required.push(json!("parameters"));
            }

            // JSON request body, nested under `requestBody`.
            let request_in_body = operation.get("requestBody").is_some();
            if let Some(body_schema) =
                operation.pointer("/requestBody/content/application~1json/schema")
            {
                properties.insert(
                    "requestBody".to_string(),
                    resolve_schema(doc, body_schema),
                );
                if operation
                    .pointer("/requestBody/required")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    required.push(json!("requestBody"));
                }
            }

            functions.push(ToolSchema {
                name: operation_id.clone(),
                description: function_description,
                parameters: json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            });
            routes.push(OpenApiRoute {
                path: path.clone(),
                method: method.to_string(),
                operation_id,
                request_in_body,
            });
        }
    }

    Ok(OpenApiConversion {
        info: OpenApiInfo {
            title,
            description,
            server,
        },
        routes,
        functions,
    })
}
