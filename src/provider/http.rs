//! A generic OpenAI-compatible chat-completions [`Provider`].
//!
//! The teacher's own OpenAI binding wraps a vendored SDK (`openai-rust2`);
//! that fork isn't part of this rework's dependency set (see `DESIGN.md`),
//! so this talks the wire protocol directly over `reqwest`, the way
//! `tool_protocols::McpClientProtocol` talks to its MCP server — a
//! `reqwest::Client` built once with a fixed timeout, reused across calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

use super::{AssistantMessage, CompletionConfig, Provider, ProviderError, ProviderMessage, Role, ToolCall, ToolDefinition};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Speaks the OpenAI-style `/chat/completions` wire format against any
/// compatible endpoint (OpenAI itself, or a local server exposing the
/// same shape).
pub struct HttpProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: String, config: &ProviderConfig) -> Self {
        Self {
            name,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    temperature: f32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReplyMessage,
}

#[derive(Deserialize, Default)]
struct WireReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireToolCallFunction,
}

#[derive(Deserialize)]
struct WireToolCallFunction {
    name: String,
    arguments: String,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn complete(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        config: &CompletionConfig,
    ) -> Result<AssistantMessage, ProviderError> {
        let request = WireRequest {
            model: config.model.clone(),
            temperature: config.temperature,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: role_str(m.role),
                    content: m.content.clone(),
                    tool_call_id: m.tool_call_id.clone(),
                })
                .collect(),
            tools: tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters_schema.clone(),
                    },
                })
                .collect(),
        };

        let mut req = self.client.post(&self.endpoint).json(&request);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ProviderError::Transient(e.to_string())
            } else {
                ProviderError::Fatal(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Transient(format!("http {}", status)));
        }
        if !status.is_success() {
            return Err(ProviderError::Fatal(format!("http {}", status)));
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("malformed response: {}", e)))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Fatal("no choices in response".to_string()))?;

        let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
        for call in choice.message.tool_calls {
            let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
                .map_err(|e| ProviderError::Fatal(format!("malformed tool arguments: {}", e)))?;
            tool_calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }

        Ok(AssistantMessage {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content,
            tool_calls,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
