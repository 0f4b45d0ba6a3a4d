//! A mysis whose provider asks for a tool call should persist the call and
//! its result, in order, then carry on.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use zoea_nova::config::ProviderConfig;
use zoea_nova::event_bus::EventBus;
use zoea_nova::provider::{
    AssistantMessage, CompletionConfig, Provider, ProviderError, ProviderMessage, ProviderRegistry, ToolCall, ToolDefinition,
};
use zoea_nova::store::{MemoryRole, MemorySource, Store};
use zoea_nova::tool_proxy::{CallerContext, ToolMetadata, ToolProxy, ToolResult};
use zoea_nova::Mysis;

/// Asks for `ping` on its first call, then replies plainly once it sees the
/// tool result come back.
struct ToolCallingProvider;

#[async_trait]
impl Provider for ToolCallingProvider {
    async fn complete(
        &self,
        messages: &[ProviderMessage],
        _tools: &[ToolDefinition],
        _config: &CompletionConfig,
    ) -> Result<AssistantMessage, ProviderError> {
        let already_called = messages.iter().any(|m| matches!(m.role, zoea_nova::provider::Role::Tool));
        if already_called {
            Ok(AssistantMessage {
                content: "done".to_string(),
                reasoning: None,
                tool_calls: vec![],
            })
        } else {
            Ok(AssistantMessage {
                content: "calling ping".to_string(),
                reasoning: None,
                tool_calls: vec![ToolCall {
                    id: "call-1".to_string(),
                    name: "ping".to_string(),
                    arguments: serde_json::json!({}),
                }],
            })
        }
    }

    fn name(&self) -> &str {
        "tool-calling"
    }
}

struct PingHandler;

#[async_trait]
impl zoea_nova::tool_proxy::LocalHandler for PingHandler {
    async fn call(
        &self,
        _caller: Option<&CallerContext>,
        _args: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        Ok(ToolResult::success(serde_json::json!("pong")))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("ping", "replies pong")
    }
}

fn provider_config() -> ProviderConfig {
    ProviderConfig {
        endpoint: "http://localhost".into(),
        model: "m".into(),
        temperature: 0.5,
        rate_limit: 1000.0,
        rate_burst: 1000,
        api_key: None,
    }
}

#[tokio::test]
async fn tool_call_and_result_persist_in_order() {
    let store = Store::open_in_memory().unwrap();
    let mut registry = ProviderRegistry::new();
    registry.register("p", Arc::new(ToolCallingProvider), &provider_config());
    let providers = Arc::new(registry);

    let mut tool_proxy = ToolProxy::new(None);
    tool_proxy.register_local(Arc::new(PingHandler));
    let tool_proxy = Arc::new(tool_proxy);

    let event_bus = EventBus::new();
    let id = Uuid::new_v4();
    let mysis = Mysis::new(
        id,
        "scout".to_string(),
        store.clone(),
        providers,
        "p".to_string(),
        "m".to_string(),
        0.5,
        tool_proxy,
        event_bus,
        "system prompt".to_string(),
    );

    mysis.start().await.unwrap();
    // Give the background turn loop time to run two provider calls and one
    // tool call, all in-process with no real I/O.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    mysis.stop().await.unwrap();

    let entries = store.recent_memories(id, 20).await.unwrap();
    let tool_call_entry = entries
        .iter()
        .find(|e| e.source == MemorySource::ToolCall)
        .expect("a tool-call entry should be persisted");
    let tool_result_entry = entries
        .iter()
        .find(|e| e.source == MemorySource::ToolResult)
        .expect("a tool-result entry should be persisted");

    assert!(tool_call_entry.content.contains("ping"));
    assert_eq!(tool_call_entry.role, MemoryRole::Assistant);
    assert!(tool_result_entry.content.contains("pong"));
    assert_eq!(tool_result_entry.role, MemoryRole::Tool);

    let call_index = entries.iter().position(|e| e.id == tool_call_entry.id).unwrap();
    let result_index = entries.iter().position(|e| e.id == tool_result_entry.id).unwrap();
    assert!(call_index < result_index, "tool call must precede its result in memory order");
}
