//! JSON-RPC 2.0 client for the upstream game tool server, per
//! `spec.md §6`: requests carry `jsonrpc`/`id`/`method`/`params`, and a
//! response may come back as a single JSON object or as Server-Sent-Events
//! framed with `data: <json>\n\n`.
//!
//! The `reqwest::Client` built once with a fixed timeout and reused across
//! calls follows the same shape as `tool_protocols::McpClientProtocol`;
//! the wire framing itself (JSON-RPC envelopes, SSE parsing,
//! `initialize`/`notifications/initialized` handshake) has no teacher
//! precedent and is built fresh against the spec.

use std::error::Error;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ToolMetadata, ToolParameter, ToolParameterType, ToolResult, UpstreamClient};

const PROTOCOL_VERSION: &str = "2024-11-05";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: Option<i64>,
    method: String,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// A client for an upstream MCP-shaped tool server, speaking JSON-RPC 2.0
/// over HTTP POST and tolerating SSE-framed responses.
pub struct JsonRpcToolClient {
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicI64,
    initialized: RwLock<bool>,
}

impl JsonRpcToolClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            next_id: AtomicI64::new(1),
            initialized: RwLock::new(false),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value, notification: bool) -> Result<Option<Value>, Box<dyn Error + Send + Sync>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: if notification { None } else { Some(self.next_id()) },
            method: method.to_string(),
            params,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(format!("upstream returned http {}: {}", status, body).into());
        }
        if notification || body.trim().is_empty() {
            return Ok(None);
        }

        let rpc_response = parse_wire_body(&body)?;
        if let Some(error) = rpc_response.error {
            let hint = error
                .data
                .as_ref()
                .and_then(|d| d.get("retry_after"))
                .map(|v| format!(" (retry-after: {})", v))
                .unwrap_or_default();
            return Err(format!("{}{}", error.message, hint).into());
        }
        Ok(rpc_response.result)
    }

    /// Perform the `initialize` handshake, idempotently.
    pub async fn ensure_initialized(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if *self.initialized.read().unwrap() {
            return Ok(());
        }
        self.call(
            "initialize",
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": { "name": "zoea-nova", "version": env!("CARGO_PKG_VERSION") },
            }),
            false,
        )
        .await?;
        self.call("notifications/initialized", serde_json::json!({}), true).await?;
        *self.initialized.write().unwrap() = true;
        Ok(())
    }
}

/// Parse a JSON-RPC response body that may be a bare JSON object or SSE
/// frames (`data: <json>\n\n`). Pure function over the body string.
fn parse_wire_body(body: &str) -> Result<JsonRpcResponse, Box<dyn Error + Send + Sync>> {
    let trimmed = body.trim();
    if trimmed.starts_with("data:") || trimmed.contains("\ndata:") {
        let last_data_line = trimmed
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .last()
            .ok_or("SSE response had no data frames")?;
        Ok(serde_json::from_str(last_data_line.trim())?)
    } else {
        Ok(serde_json::from_str(trimmed)?)
    }
}

fn parse_parameter_type(schema_type: &str) -> ToolParameterType {
    match schema_type {
        "string" => ToolParameterType::String,
        "number" => ToolParameterType::Number,
        "integer" => ToolParameterType::Integer,
        "boolean" => ToolParameterType::Boolean,
        "array" => ToolParameterType::Array,
        _ => ToolParameterType::Object,
    }
}

fn metadata_from_mcp_tool(value: &Value) -> Option<ToolMetadata> {
    let name = value.get("name")?.as_str()?.to_string();
    let description = value
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or_default()
        .to_string();
    let mut metadata = ToolMetadata::new(name, description);

    if let Some(properties) = value
        .get("input_schema")
        .or_else(|| value.get("inputSchema"))
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object())
    {
        let required: Vec<String> = value
            .get("input_schema")
            .or_else(|| value.get("inputSchema"))
            .and_then(|s| s.get("required"))
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        for (name, schema) in properties {
            let kind = schema.get("type").and_then(|t| t.as_str()).unwrap_or("object");
            let mut param = ToolParameter::new(name.clone(), parse_parameter_type(kind));
            if let Some(description) = schema.get("description").and_then(|d| d.as_str()) {
                param = param.with_description(description);
            }
            if required.contains(name) {
                param = param.required();
            }
            metadata = metadata.with_parameter(param);
        }
    }

    Some(metadata)
}

#[async_trait]
impl UpstreamClient for JsonRpcToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        self.ensure_initialized().await?;
        let result = self
            .call("tools/list", serde_json::json!({}), false)
            .await?
            .ok_or("tools/list returned no result")?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(tools.iter().filter_map(metadata_from_mcp_tool).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        self.ensure_initialized().await?;
        let result = self
            .call("tools/call", serde_json::json!({ "name": name, "arguments": args }), false)
            .await?
            .ok_or("tools/call returned no result")?;

        let is_error = result.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
        let content = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if is_error {
            Ok(ToolResult::failure(content))
        } else {
            Ok(ToolResult::success(serde_json::json!({ "text": content, "raw": result })))
        }
    }

    async fn initialize(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.ensure_initialized().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_response() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        let response = parse_wire_body(body).unwrap();
        assert!(response.result.is_some());
    }

    #[test]
    fn parses_sse_framed_response() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let response = parse_wire_body(body).unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[test]
    fn surfaces_jsonrpc_error() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#;
        let response = parse_wire_body(body).unwrap();
        assert!(response.error.is_some());
        assert_eq!(response.error.unwrap().message, "boom");
    }

    #[test]
    fn metadata_extracted_from_mcp_tool_descriptor() {
        let tool = serde_json::json!({
            "name": "move",
            "description": "move the player",
            "input_schema": {
                "type": "object",
                "properties": { "direction": { "type": "string" } },
                "required": ["direction"]
            }
        });
        let metadata = metadata_from_mcp_tool(&tool).unwrap();
        assert_eq!(metadata.name, "move");
        assert_eq!(metadata.parameters.len(), 1);
        assert!(metadata.parameters[0].required);
    }
}
