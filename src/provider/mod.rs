//! Provider registry: name → chat-completion capability.
//!
//! Adapted from the `ClientWrapper` trait this crate's lineage uses for
//! LLM bindings (`Message`/`Role`/`TokenUsage`, a single `send_message`
//! entrypoint), generalized to the exact contract the swarm needs: tool
//! definitions passed alongside messages, a separate `reasoning` channel
//! on the reply, and a per-provider token-bucket rate limit sitting in
//! front of every call — grounded on the `governor` usage in
//! `stencila-stencila/rust/codec-github/src/client.rs`.

mod http;

pub use http::HttpProvider;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;

/// One message in the conversation sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ProviderMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            reasoning: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            reasoning: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Message role, matching the four memory roles the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call the assistant asked to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool description passed to the provider so it knows what it may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Sampling configuration for a single `complete` call.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub model: String,
    pub temperature: f32,
}

/// The assistant's reply: content, an optional separate reasoning trace,
/// and zero or more tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

const FALLBACK_CONTENT: &str = "(no response)";
const CONTINUE_PROMPT: &str = "Continue.";

/// Failure modes a provider call can surface.
#[derive(Debug, Clone)]
pub enum ProviderError {
    Canceled,
    Transient(String),
    Fatal(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Canceled => write!(f, "provider call canceled"),
            ProviderError::Transient(msg) => write!(f, "transient provider error: {}", msg),
            ProviderError::Fatal(msg) => write!(f, "fatal provider error: {}", msg),
        }
    }
}

impl Error for ProviderError {}

/// A chat-completion capability. Implementations speak whatever wire
/// protocol the backend needs; callers only see this contract.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        config: &CompletionConfig,
    ) -> Result<AssistantMessage, ProviderError>;

    fn name(&self) -> &str;
}

/// Ensure a system-only message list gets at least one non-system entry,
/// per the fallback contract some backends require.
pub fn ensure_non_system_message(messages: &[ProviderMessage]) -> Vec<ProviderMessage> {
    if messages.iter().all(|m| m.role == Role::System) {
        let mut out = messages.to_vec();
        out.push(ProviderMessage::user(CONTINUE_PROMPT));
        out
    } else {
        messages.to_vec()
    }
}

/// Apply the empty-reply fallback: a provider that returns neither
/// content nor tool calls gets a fixed placeholder instead of an empty
/// turn.
pub fn apply_empty_reply_fallback(mut message: AssistantMessage) -> AssistantMessage {
    if message.content.trim().is_empty() && message.tool_calls.is_empty() {
        message.content = FALLBACK_CONTENT.to_string();
    }
    message
}

type TokenBucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct RegisteredProvider {
    provider: Arc<dyn Provider>,
    limiter: Arc<TokenBucket>,
}

/// Maps provider names to bound providers, each behind its own
/// token-bucket rate limiter.
///
/// # Example
///
/// ```rust,no_run
/// use zoea_nova::provider::{ProviderRegistry, HttpProvider};
/// use zoea_nova::config::ProviderConfig;
/// use std::sync::Arc;
///
/// let config = ProviderConfig {
///     endpoint: "http://localhost:8000/v1/chat/completions".into(),
///     model: "local-model".into(),
///     temperature: 0.7,
///     rate_limit: 2.0,
///     rate_burst: 4,
///     api_key: None,
/// };
/// let mut registry = ProviderRegistry::new();
/// registry.register("local", Arc::new(HttpProvider::new("local".into(), &config)), &config);
/// ```
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>, config: &ProviderConfig) {
        let per_second = config.rate_limit.max(0.001);
        // governor's Quota is integral-per-period; model sub-1/s rates as
        // one token replenished over the corresponding multi-second period.
        let quota = if per_second >= 1.0 {
            Quota::per_second(NonZeroU32::new(per_second.round() as u32).unwrap_or(NonZeroU32::new(1).unwrap()))
        } else {
            let period = Duration::from_secs_f64(1.0 / per_second);
            Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
        }
        .allow_burst(NonZeroU32::new(config.rate_burst.max(1)).unwrap());

        self.providers.insert(
            name.into(),
            RegisteredProvider {
                provider,
                limiter: Arc::new(RateLimiter::direct(quota)),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(|r| r.provider.clone())
    }

    /// Run `complete` against the named provider, waiting for a rate
    /// limit token first. The wait honors cancellation: a canceled token
    /// returns promptly with [`ProviderError::Canceled`].
    pub async fn complete(
        &self,
        provider_name: &str,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        config: &CompletionConfig,
        cancel: &CancellationToken,
    ) -> Result<AssistantMessage, ProviderError> {
        let registered = self
            .providers
            .get(provider_name)
            .ok_or_else(|| ProviderError::Fatal(format!("unknown provider {:?}", provider_name)))?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Canceled),
            _ = registered.limiter.until_ready() => {}
        }

        let prepared = ensure_non_system_message(messages);
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Canceled),
            result = registered.provider.complete(&prepared, tools, config) => result?,
        };
        Ok(apply_empty_reply_fallback(reply))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn complete(
            &self,
            messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _config: &CompletionConfig,
        ) -> Result<AssistantMessage, ProviderError> {
            Ok(AssistantMessage {
                content: messages.last().map(|m| m.content.clone()).unwrap_or_default(),
                reasoning: None,
                tool_calls: Vec::new(),
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct EmptyProvider;

    #[async_trait]
    impl Provider for EmptyProvider {
        async fn complete(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _config: &CompletionConfig,
        ) -> Result<AssistantMessage, ProviderError> {
            Ok(AssistantMessage {
                content: String::new(),
                reasoning: None,
                tool_calls: Vec::new(),
            })
        }

        fn name(&self) -> &str {
            "empty"
        }
    }

    fn sample_config() -> ProviderConfig {
        ProviderConfig {
            endpoint: "http://localhost".into(),
            model: "m".into(),
            temperature: 0.7,
            rate_limit: 1000.0,
            rate_burst: 1000,
            api_key: None,
        }
    }

    #[test]
    fn system_only_gets_continue_appended() {
        let messages = vec![ProviderMessage::system("you are an agent")];
        let prepared = ensure_non_system_message(&messages);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[1].role, Role::User);
        assert_eq!(prepared[1].content, CONTINUE_PROMPT);
    }

    #[test]
    fn mixed_messages_are_untouched() {
        let messages = vec![ProviderMessage::system("sys"), ProviderMessage::user("hi")];
        let prepared = ensure_non_system_message(&messages);
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn empty_reply_gets_fallback_content() {
        let message = AssistantMessage {
            content: String::new(),
            reasoning: None,
            tool_calls: Vec::new(),
        };
        let fixed = apply_empty_reply_fallback(message);
        assert_eq!(fixed.content, FALLBACK_CONTENT);
    }

    #[test]
    fn reply_with_tool_calls_keeps_empty_content() {
        let message = AssistantMessage {
            content: String::new(),
            reasoning: None,
            tool_calls: vec![ToolCall {
                id: "1".into(),
                name: "ping".into(),
                arguments: serde_json::json!({}),
            }],
        };
        let fixed = apply_empty_reply_fallback(message);
        assert_eq!(fixed.content, "");
    }

    #[tokio::test]
    async fn registry_dispatches_to_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register("echo", Arc::new(EchoProvider), &sample_config());
        let config = CompletionConfig {
            model: "m".into(),
            temperature: 0.5,
        };
        let reply = registry
            .complete(
                "echo",
                &[ProviderMessage::user("hello")],
                &[],
                &config,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply.content, "hello");
    }

    #[tokio::test]
    async fn registry_applies_empty_reply_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register("empty", Arc::new(EmptyProvider), &sample_config());
        let config = CompletionConfig {
            model: "m".into(),
            temperature: 0.5,
        };
        let reply = registry
            .complete("empty", &[ProviderMessage::user("hi")], &[], &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, FALLBACK_CONTENT);
    }

    #[tokio::test]
    async fn unknown_provider_is_fatal() {
        let registry = ProviderRegistry::new();
        let config = CompletionConfig {
            model: "m".into(),
            temperature: 0.5,
        };
        let err = registry
            .complete("missing", &[], &[], &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Fatal(_)));
    }

    #[tokio::test]
    async fn canceled_token_short_circuits_rate_limit_wait() {
        let config_data = ProviderConfig {
            rate_limit: 0.01,
            rate_burst: 1,
            ..sample_config()
        };
        let mut registry = ProviderRegistry::new();
        registry.register("echo", Arc::new(EchoProvider), &config_data);
        // drain the single burst token
        let cancel = CancellationToken::new();
        let config = CompletionConfig {
            model: "m".into(),
            temperature: 0.5,
        };
        let _ = registry
            .complete("echo", &[ProviderMessage::user("1")], &[], &config, &cancel)
            .await;
        cancel.cancel();
        let result = registry
            .complete("echo", &[ProviderMessage::user("2")], &[], &config, &cancel)
            .await;
        assert!(matches!(result, Err(ProviderError::Canceled)));
    }
}
