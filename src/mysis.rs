//! The per-agent cognitive loop: state machine, turn executor, memory
//! assembly, tool-call fan-out, and cancellation.
//!
//! The turn loop's shape — a background task driven by queued events,
//! racing a [`CancellationToken`] against in-flight work — follows the
//! consciousness loop in `other_examples/.../agenticlaw/.../queue.rs`
//! rather than this crate lineage's own `Agent::send()`, which is a
//! synchronous call-and-return design with no notion of a mysis idling
//! between turns, a shared inbox, or stop-the-current-turn cancellation.
//! The builder-pattern and doc-comment conventions on the public API
//! still follow `cloudllm::agent`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event_bus::{Event, EventBus, EventKind};
use crate::provider::{CompletionConfig, ProviderMessage, ProviderRegistry, Role as ProviderRole, ToolCall, ToolDefinition};
use crate::store::{MemoryEntry, MemoryRole, MemorySource, NewMemoryEntry, Store, StoreError};
use crate::tool_proxy::{CallerContext, ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProxy};

/// Maximum tool-call round trips within a single turn before the loop
/// gives up and ends the turn regardless of what the assistant asked for.
pub const MAX_TOOL_ITERATIONS: usize = 10;
/// Overall wall-clock budget for a single turn.
pub const TURN_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// How many of the most recent memories are assembled into context.
pub const CONTEXT_WINDOW: usize = 20;
/// How long `stop()` waits for an in-flight turn to acknowledge
/// cancellation before forcing the Stopped transition anyway.
pub const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Tool names whose results are idempotent on re-query; only the most
/// recent result for each is kept in assembled context.
pub const DEFAULT_SNAPSHOT_TOOL_NAMES: &[&str] = &["inventory", "map", "player_state", "look"];

/// The mysis lifecycle state machine (`spec.md §4.5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MysisState {
    Idle,
    Running,
    Thinking,
    Stopped,
    Errored,
}

impl MysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MysisState::Idle => "idle",
            MysisState::Running => "running",
            MysisState::Thinking => "thinking",
            MysisState::Stopped => "stopped",
            MysisState::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "idle" => Ok(MysisState::Idle),
            "running" => Ok(MysisState::Running),
            "thinking" => Ok(MysisState::Thinking),
            "stopped" => Ok(MysisState::Stopped),
            "errored" => Ok(MysisState::Errored),
            other => Err(StoreError::Corrupt(format!("unknown mysis state {:?}", other))),
        }
    }
}

/// Failure modes a turn can end with.
#[derive(Debug, Clone)]
pub enum MysisError {
    Canceled,
    Fatal(String),
}

impl fmt::Display for MysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MysisError::Canceled => write!(f, "turn canceled"),
            MysisError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for MysisError {}

struct Shared {
    id: Uuid,
    name: String,
    store: Store,
    providers: Arc<ProviderRegistry>,
    provider_name: String,
    model_name: String,
    temperature: f32,
    tool_proxy: Arc<ToolProxy>,
    event_bus: Arc<EventBus>,
    system_prompt: String,
    snapshot_tool_names: Vec<String>,
    state: Mutex<MysisState>,
    turn_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
    wake: Notify,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A single autonomous agent. Cheaply cloneable — clones share the same
/// underlying state and the same background turn loop.
///
/// # Example
///
/// ```rust,no_run
/// use zoea_nova::mysis::Mysis;
/// use zoea_nova::store::Store;
/// use zoea_nova::provider::ProviderRegistry;
/// use zoea_nova::tool_proxy::ToolProxy;
/// use zoea_nova::event_bus::EventBus;
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::open_in_memory()?;
/// let record = store.create_mysis("scout".into(), "local".into(), "local-model".into(), 0.7).await?;
/// let mysis = Mysis::new(
///     record.id,
///     "scout".into(),
///     store,
///     Arc::new(ProviderRegistry::new()),
///     "local".into(),
///     "local-model".into(),
///     0.7,
///     Arc::new(ToolProxy::new(None)),
///     EventBus::new(),
///     "You are an agent playing a game.".into(),
/// );
/// mysis.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Mysis {
    inner: Arc<Shared>,
}

impl Mysis {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        name: String,
        store: Store,
        providers: Arc<ProviderRegistry>,
        provider_name: String,
        model_name: String,
        temperature: f32,
        tool_proxy: Arc<ToolProxy>,
        event_bus: Arc<EventBus>,
        system_prompt: String,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                id,
                name,
                store,
                providers,
                provider_name,
                model_name,
                temperature,
                tool_proxy,
                event_bus,
                system_prompt,
                snapshot_tool_names: DEFAULT_SNAPSHOT_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
                state: Mutex::new(MysisState::Idle),
                turn_lock: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(None),
                wake: Notify::new(),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> MysisState {
        *self.inner.state.lock().unwrap()
    }

    fn publish(&self, kind: EventKind) {
        self.inner
            .event_bus
            .publish(Event::for_mysis(self.inner.id, self.inner.name.clone(), kind));
    }

    async fn persist_state(&self, state: MysisState, last_error: Option<String>) {
        if let Err(err) = self.inner.store.update_mysis_state(self.inner.id, state, last_error).await {
            log::error!("mysis {} failed to persist state {:?}: {}", self.inner.id, state, err);
        }
    }

    /// Idempotent: a no-op if already Running or Thinking. Transitions
    /// Idle/Stopped/Errored into Running and (re)launches the turn loop.
    pub async fn start(&self) -> Result<(), MysisError> {
        let should_launch = {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                MysisState::Running | MysisState::Thinking => false,
                MysisState::Idle | MysisState::Stopped | MysisState::Errored => {
                    *state = MysisState::Running;
                    true
                }
            }
        };

        if !should_launch {
            return Ok(());
        }

        self.publish(EventKind::MysisStateChanged {
            from: "idle_or_terminal".into(),
            to: MysisState::Running.as_str().into(),
        });
        self.persist_state(MysisState::Running, None).await;

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap() = Some(cancel.clone());

        let mysis = self.clone();
        let handle = tokio::spawn(async move { mysis.run_loop(cancel).await });
        *self.inner.loop_handle.lock().unwrap() = Some(handle);

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Cancel the in-flight turn (if any), wait up to [`STOP_DEADLINE`]
    /// for it to acknowledge, then transition to Stopped.
    pub async fn stop(&self) -> Result<(), MysisError> {
        let in_flight = {
            let state = self.inner.state.lock().unwrap();
            matches!(*state, MysisState::Running | MysisState::Thinking)
        };
        if !in_flight {
            return Ok(());
        }

        if let Some(cancel) = self.inner.cancel.lock().unwrap().clone() {
            cancel.cancel();
        }

        // Waiting for the turn lock blocks until any in-flight turn has
        // actually returned, bounded by STOP_DEADLINE.
        let _ = tokio::time::timeout(STOP_DEADLINE, self.inner.turn_lock.lock()).await;

        let from = {
            let mut state = self.inner.state.lock().unwrap();
            let from = *state;
            *state = MysisState::Stopped;
            from
        };
        self.publish(EventKind::MysisStateChanged {
            from: from.as_str().into(),
            to: MysisState::Stopped.as_str().into(),
        });
        self.persist_state(MysisState::Stopped, None).await;
        Ok(())
    }

    /// Enqueue a direct user message and ensure the mysis is running.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<(), MysisError> {
        self.append_memory(MemoryRole::User, MemorySource::Direct, content.into(), None, None)
            .await?;
        self.start().await?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Enqueue a broadcast from another mysis. Never call this with
    /// `sender_id == self.id()` — the commander is responsible for
    /// excluding the sender from delivery.
    pub async fn receive_broadcast(&self, sender_id: Uuid, content: impl Into<String>) -> Result<(), MysisError> {
        self.append_memory(MemoryRole::User, MemorySource::Broadcast, content.into(), Some(sender_id), None)
            .await?;
        self.start().await?;
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn append_memory(
        &self,
        role: MemoryRole,
        source: MemorySource,
        content: String,
        sender_id: Option<Uuid>,
        tool_call_id: Option<String>,
    ) -> Result<MemoryEntry, MysisError> {
        self.append_memory_with_reasoning(role, source, content, None, sender_id, tool_call_id).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_memory_with_reasoning(
        &self,
        role: MemoryRole,
        source: MemorySource,
        content: String,
        reasoning: Option<String>,
        sender_id: Option<Uuid>,
        tool_call_id: Option<String>,
    ) -> Result<MemoryEntry, MysisError> {
        self.inner
            .store
            .append_memory(
                self.inner.id,
                NewMemoryEntry {
                    role,
                    source,
                    content,
                    reasoning,
                    sender_id,
                    tool_call_id,
                },
            )
            .await
            .map_err(|e| MysisError::Fatal(e.to_string()))
    }

    async fn ensure_system_prompt_seeded(&self) {
        match self.inner.store.recent_memories(self.inner.id, 1).await {
            Ok(entries) if entries.is_empty() => {
                let _ = self
                    .append_memory(MemoryRole::System, MemorySource::System, self.inner.system_prompt.clone(), None, None)
                    .await;
            }
            Ok(_) => {}
            Err(err) => log::error!("failed to check seed state for mysis {}: {}", self.inner.id, err),
        }
    }

    async fn run_loop(self, cancel: CancellationToken) {
        self.ensure_system_prompt_seeded().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            {
                let mut state = self.inner.state.lock().unwrap();
                if *state != MysisState::Running {
                    continue;
                }
                *state = MysisState::Thinking;
            }
            self.publish(EventKind::TurnStarted);

            let result = self.run_turn(&cancel).await;

            let mut state = self.inner.state.lock().unwrap();
            if *state == MysisState::Stopped {
                if let Err(err) = &result {
                    log::debug!("mysis {} turn error after stop, discarding: {}", self.inner.id, err);
                }
                drop(state);
                continue;
            }
            match result {
                Ok(tool_calls) => {
                    *state = MysisState::Running;
                    drop(state);
                    self.persist_state(MysisState::Running, None).await;
                    self.publish(EventKind::TurnCompleted { tool_calls });
                }
                Err(MysisError::Canceled) => {
                    // Not yet marked Stopped: stop() hasn't run its adjudication
                    // yet. Leave state as-is; stop() will finish the transition.
                }
                Err(MysisError::Fatal(message)) => {
                    *state = MysisState::Errored;
                    drop(state);
                    self.persist_state(MysisState::Errored, Some(message.clone())).await;
                    self.publish(EventKind::MysisErrored { message });
                    break;
                }
            }
        }

        *self.inner.loop_handle.lock().unwrap() = None;
    }

    /// Run one turn: assemble context, call the provider, execute any
    /// requested tool calls (looping until none remain or the iteration
    /// cap is hit), and persist everything along the way. Returns the
    /// number of tool calls executed.
    async fn run_turn(&self, cancel: &CancellationToken) -> Result<usize, MysisError> {
        let _turn_guard = self.inner.turn_lock.lock().await;
        let deadline = tokio::time::sleep(TURN_DEADLINE);
        tokio::pin!(deadline);

        let mut total_tool_calls = 0;
        for _iteration in 0..MAX_TOOL_ITERATIONS {
            let context = tokio::select! {
                _ = cancel.cancelled() => return Err(MysisError::Canceled),
                _ = &mut deadline => return Err(MysisError::Fatal("turn deadline exceeded".into())),
                result = self.assemble_context() => result?,
            };

            let config = CompletionConfig {
                model: self.inner.model_name.clone(),
                temperature: self.inner.temperature,
            };
            let tools = tokio::select! {
                _ = cancel.cancelled() => return Err(MysisError::Canceled),
                _ = &mut deadline => return Err(MysisError::Fatal("turn deadline exceeded".into())),
                metadata = self.inner.tool_proxy.list_tools() => tool_definitions_from_metadata(&metadata),
            };
            let reply = tokio::select! {
                _ = &mut deadline => return Err(MysisError::Fatal("turn deadline exceeded".into())),
                result = self.inner.providers.complete(&self.inner.provider_name, &context, &tools, &config, cancel) => result,
            };
            let reply = reply.map_err(|e| match e {
                crate::provider::ProviderError::Canceled => MysisError::Canceled,
                other => MysisError::Fatal(other.to_string()),
            })?;

            self.append_memory_with_reasoning(
                MemoryRole::Assistant,
                MemorySource::Direct,
                reply.content.clone(),
                reply.reasoning.clone(),
                None,
                None,
            )
            .await?;

            if reply.tool_calls.is_empty() {
                return Ok(total_tool_calls);
            }

            for tool_call in &reply.tool_calls {
                total_tool_calls += 1;
                self.run_tool_call(tool_call, cancel).await?;
            }
        }
        Ok(total_tool_calls)
    }

    async fn run_tool_call(&self, tool_call: &ToolCall, cancel: &CancellationToken) -> Result<(), MysisError> {
        self.append_memory(
            MemoryRole::Assistant,
            MemorySource::ToolCall,
            serde_json::json!({ "name": tool_call.name, "arguments": tool_call.arguments }).to_string(),
            None,
            Some(tool_call.id.clone()),
        )
        .await?;

        let caller = CallerContext {
            mysis_id: self.inner.id,
            mysis_name: self.inner.name.clone(),
        };

        let result = self
            .inner
            .tool_proxy
            .call_tool(&caller, &tool_call.name, tool_call.arguments.clone(), cancel)
            .await;

        let (content, success) = match result {
            Ok(result) => (serde_json::to_string(&result).unwrap_or_default(), result.success),
            Err(ToolError::Canceled) => return Err(MysisError::Canceled),
            Err(ToolError::RetryExhausted(message)) => return Err(MysisError::Fatal(message)),
            Err(other) => (
                serde_json::to_string(&crate::tool_proxy::ToolResult::failure(other.to_string())).unwrap_or_default(),
                false,
            ),
        };

        self.append_memory(
            MemoryRole::Tool,
            MemorySource::ToolResult,
            content,
            None,
            Some(tool_call.id.clone()),
        )
        .await?;

        self.publish(EventKind::ToolInvoked {
            tool_name: tool_call.name.clone(),
            success,
        });
        Ok(())
    }

    async fn assemble_context(&self) -> Result<Vec<ProviderMessage>, MysisError> {
        let recent = self
            .inner
            .store
            .recent_memories(self.inner.id, CONTEXT_WINDOW)
            .await
            .map_err(|e| MysisError::Fatal(e.to_string()))?;
        let names: Vec<&str> = self.inner.snapshot_tool_names.iter().map(|s| s.as_str()).collect();
        let compacted = compact_snapshots(recent, &names);
        Ok(entries_to_messages(&compacted))
    }
}

fn tool_parameter_type_name(kind: &ToolParameterType) -> &'static str {
    match kind {
        ToolParameterType::String => "string",
        ToolParameterType::Number => "number",
        ToolParameterType::Integer => "integer",
        ToolParameterType::Boolean => "boolean",
        ToolParameterType::Array => "array",
        ToolParameterType::Object => "object",
    }
}

fn tool_parameter_schema(param: &ToolParameter) -> serde_json::Value {
    let mut schema = serde_json::json!({ "type": tool_parameter_type_name(&param.param_type) });
    if let Some(description) = &param.description {
        schema["description"] = serde_json::Value::String(description.clone());
    }
    if let Some(default) = &param.default {
        schema["default"] = default.clone();
    }
    if let Some(items) = &param.items {
        schema["items"] = serde_json::json!({ "type": tool_parameter_type_name(items) });
    }
    if let Some(properties) = &param.properties {
        let nested: serde_json::Map<String, serde_json::Value> = properties
            .iter()
            .map(|(name, p)| (name.clone(), tool_parameter_schema(p)))
            .collect();
        schema["properties"] = serde_json::Value::Object(nested);
    }
    schema
}

/// Build a JSON Schema `{type: object, properties, required}` document from a
/// tool's parameter list, the shape a provider expects in a tool definition.
fn json_schema_for_parameters(parameters: &[ToolParameter]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in parameters {
        properties.insert(param.name.clone(), tool_parameter_schema(param));
        if param.required {
            required.push(param.name.clone());
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Bridge the tool proxy's merged local/upstream tool listing into the
/// provider's wire-facing [`ToolDefinition`] shape.
fn tool_definitions_from_metadata(metadata: &[ToolMetadata]) -> Vec<ToolDefinition> {
    metadata
        .iter()
        .map(|m| ToolDefinition {
            name: m.name.clone(),
            description: m.description.clone(),
            parameters_schema: json_schema_for_parameters(&m.parameters),
        })
        .collect()
}

fn entries_to_messages(entries: &[MemoryEntry]) -> Vec<ProviderMessage> {
    entries
        .iter()
        .map(|entry| ProviderMessage {
            role: match entry.role {
                MemoryRole::System => ProviderRole::System,
                MemoryRole::User => ProviderRole::User,
                MemoryRole::Assistant => ProviderRole::Assistant,
                MemoryRole::Tool => ProviderRole::Tool,
            },
            content: entry.content.clone(),
            reasoning: entry.reasoning.clone(),
            tool_call_id: entry.tool_call_id.clone(),
            tool_calls: Vec::new(),
        })
        .collect()
}

/// Drop older tool-result entries for snapshot-tool names, keeping only
/// each name's most recent occurrence. Pure function of the memory
/// sequence: no store access, independently testable.
pub fn compact_snapshots(entries: Vec<MemoryEntry>, snapshot_tool_names: &[&str]) -> Vec<MemoryEntry> {
    let mut call_names: HashMap<String, String> = HashMap::new();
    for entry in &entries {
        if entry.source == MemorySource::ToolCall {
            if let Some(id) = &entry.tool_call_id {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&entry.content) {
                    if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
                        call_names.insert(id.clone(), name.to_string());
                    }
                }
            }
        }
    }

    let mut latest_index: HashMap<String, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.source != MemorySource::ToolResult {
            continue;
        }
        if let Some(name) = entry.tool_call_id.as_ref().and_then(|id| call_names.get(id)) {
            if snapshot_tool_names.contains(&name.as_str()) {
                latest_index.insert(name.clone(), index);
            }
        }
    }

    entries
        .into_iter()
        .enumerate()
        .filter(|(index, entry)| {
            if entry.source != MemorySource::ToolResult {
                return true;
            }
            match entry.tool_call_id.as_ref().and_then(|id| call_names.get(id)) {
                Some(name) if snapshot_tool_names.contains(&name.as_str()) => latest_index.get(name) == Some(index),
                _ => true,
            }
        })
        .map(|(_, entry)| entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AssistantMessage, CompletionConfig as ProviderCompletionConfig, Provider, ProviderError};
    use crate::tool_proxy::{CallerContext as ToolCallerContext, LocalHandler, ToolMetadata, ToolResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn memory(
        id: i64,
        source: MemorySource,
        content: &str,
        tool_call_id: Option<&str>,
    ) -> MemoryEntry {
        MemoryEntry {
            id,
            mysis_id: Uuid::new_v4(),
            role: MemoryRole::Tool,
            source,
            content: content.to_string(),
            reasoning: None,
            sender_id: None,
            tool_call_id: tool_call_id.map(str::to_string),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn compact_snapshots_keeps_only_latest_per_tool() {
        let entries = vec![
            memory(1, MemorySource::ToolCall, r#"{"name":"inventory"}"#, Some("a")),
            memory(2, MemorySource::ToolResult, "old inventory", Some("a")),
            memory(3, MemorySource::ToolCall, r#"{"name":"inventory"}"#, Some("b")),
            memory(4, MemorySource::ToolResult, "new inventory", Some("b")),
            memory(5, MemorySource::ToolCall, r#"{"name":"attack"}"#, Some("c")),
            memory(6, MemorySource::ToolResult, "attack result", Some("c")),
        ];
        let compacted = compact_snapshots(entries, &["inventory"]);
        let contents: Vec<&str> = compacted.iter().map(|e| e.content.as_str()).collect();
        assert!(!contents.contains(&"old inventory"));
        assert!(contents.contains(&"new inventory"));
        assert!(contents.contains(&"attack result"));
    }

    #[test]
    fn compact_snapshots_leaves_non_snapshot_tools_alone() {
        let entries = vec![
            memory(1, MemorySource::ToolCall, r#"{"name":"attack"}"#, Some("a")),
            memory(2, MemorySource::ToolResult, "hit for 3", Some("a")),
            memory(3, MemorySource::ToolCall, r#"{"name":"attack"}"#, Some("b")),
            memory(4, MemorySource::ToolResult, "hit for 5", Some("b")),
        ];
        let compacted = compact_snapshots(entries, &["inventory"]);
        assert_eq!(compacted.len(), 4);
    }

    struct SlowProvider;

    #[async_trait]
    impl Provider for SlowProvider {
        async fn complete(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _config: &ProviderCompletionConfig,
        ) -> Result<AssistantMessage, ProviderError> {
            tokio::time::sleep(StdDuration::from_secs(2)).await;
            Ok(AssistantMessage {
                content: "too late".into(),
                reasoning: None,
                tool_calls: Vec::new(),
            })
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    struct InstantProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for InstantProvider {
        async fn complete(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _config: &ProviderCompletionConfig,
        ) -> Result<AssistantMessage, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AssistantMessage {
                content: "hello".into(),
                reasoning: None,
                tool_calls: Vec::new(),
            })
        }

        fn name(&self) -> &str {
            "instant"
        }
    }

    struct ToolRecordingProvider {
        seen_tools: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for ToolRecordingProvider {
        async fn complete(
            &self,
            _messages: &[ProviderMessage],
            tools: &[ToolDefinition],
            _config: &ProviderCompletionConfig,
        ) -> Result<AssistantMessage, ProviderError> {
            *self.seen_tools.lock().unwrap() = tools.iter().map(|t| t.name.clone()).collect();
            Ok(AssistantMessage {
                content: "hello".into(),
                reasoning: None,
                tool_calls: Vec::new(),
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct PingHandler;

    #[async_trait]
    impl LocalHandler for PingHandler {
        async fn call(
            &self,
            _caller: Option<&ToolCallerContext>,
            _args: serde_json::Value,
        ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
            Ok(ToolResult::success(serde_json::json!("pong")))
        }

        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::new("ping", "replies pong")
        }
    }

    fn sample_provider_config() -> crate::config::ProviderConfig {
        crate::config::ProviderConfig {
            endpoint: "http://localhost".into(),
            model: "m".into(),
            temperature: 0.5,
            rate_limit: 1000.0,
            rate_burst: 1000,
            api_key: None,
        }
    }

    async fn make_mysis(provider: Arc<dyn Provider>) -> (Mysis, Store) {
        let store = Store::open_in_memory().unwrap();
        let record = store
            .create_mysis("scout".into(), "p".into(), "m".into(), 0.5)
            .await
            .unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register("p", provider, &sample_provider_config());
        let mut proxy = ToolProxy::new(None);
        proxy.register_local(Arc::new(PingHandler));
        let mysis = Mysis::new(
            record.id,
            "scout".into(),
            store.clone(),
            Arc::new(registry),
            "p".into(),
            "m".into(),
            0.5,
            Arc::new(proxy),
            EventBus::new(),
            "system prompt".into(),
        );
        (mysis, store)
    }

    #[tokio::test]
    async fn s1_basic_turn_produces_assistant_reply() {
        let (mysis, store) = make_mysis(Arc::new(InstantProvider { calls: AtomicUsize::new(0) })).await;
        mysis.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        let recent = store.recent_memories(mysis.id(), 10).await.unwrap();
        assert!(recent.iter().any(|m| m.content == "hello" && m.role == MemoryRole::Assistant));
    }

    #[tokio::test]
    async fn s4_stop_during_turn_reaches_stopped_not_errored() {
        let (mysis, _store) = make_mysis(Arc::new(SlowProvider)).await;
        mysis.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        mysis.stop().await.unwrap();
        assert_eq!(mysis.state(), MysisState::Stopped);
    }

    #[tokio::test]
    async fn start_is_idempotent_when_already_running() {
        let (mysis, _store) = make_mysis(Arc::new(InstantProvider { calls: AtomicUsize::new(0) })).await;
        mysis.start().await.unwrap();
        mysis.start().await.unwrap();
        assert!(matches!(mysis.state(), MysisState::Running | MysisState::Thinking));
    }

    #[tokio::test]
    async fn send_message_persists_before_turn_runs() {
        let (mysis, store) = make_mysis(Arc::new(InstantProvider { calls: AtomicUsize::new(0) })).await;
        mysis.send_message("hello there").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let recent = store.recent_memories(mysis.id(), 10).await.unwrap();
        assert!(recent.iter().any(|m| m.content == "hello there" && m.source == MemorySource::Direct));
    }

    #[tokio::test]
    async fn run_turn_passes_registered_tools_to_provider() {
        let provider = Arc::new(ToolRecordingProvider { seen_tools: Mutex::new(Vec::new()) });
        let (mysis, _store) = make_mysis(provider.clone()).await;
        mysis.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        let seen = provider.seen_tools.lock().unwrap().clone();
        assert!(
            seen.contains(&"ping".to_string()),
            "provider should have been offered the registered local tool, saw {:?}",
            seen
        );
    }

    #[test]
    fn tool_definitions_from_metadata_builds_schema() {
        let param = ToolParameter::new("amount", ToolParameterType::Integer).required();
        let metadata = vec![ToolMetadata {
            name: "attack".into(),
            description: "deal damage".into(),
            parameters: vec![param],
        }];

        let defs = tool_definitions_from_metadata(&metadata);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "attack");
        assert_eq!(defs[0].parameters_schema["type"], "object");
        assert_eq!(defs[0].parameters_schema["properties"]["amount"]["type"], "integer");
        assert_eq!(defs[0].parameters_schema["required"][0], "amount");
    }
}
