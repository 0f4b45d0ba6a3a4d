//! The swarm-wide commander: mysis lifecycle, capacity enforcement, and
//! broadcast fan-out across every running mysis.
//!
//! The registry itself — an `Arc<RwLock<HashMap<Uuid, _>>>` guarding named,
//! independently-owned units — follows the same shape `ToolRegistry` uses
//! for tools; broadcast delivery (write the global record first, then fan
//! out to everyone except the sender) is new, grounded directly on
//! `spec.md §4.6`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::mysis::{Mysis, MysisError, MysisState};
use crate::provider::ProviderRegistry;
use crate::store::{BroadcastRecord, MemoryEntry, MysisRecord, Store, StoreError};
use crate::tool_proxy::ToolProxy;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an autonomous agent playing a persistent online game. Decide your own goals and act through the tools available to you.";

/// Failure modes the commander can surface.
#[derive(Debug, Clone)]
pub enum CommanderError {
    CapacityExceeded { max: usize },
    NameConflict(String),
    NotFound(Uuid),
    UnknownProvider(String),
    Store(StoreError),
    Mysis(String),
}

impl fmt::Display for CommanderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommanderError::CapacityExceeded { max } => write!(f, "swarm is at capacity ({} myses)", max),
            CommanderError::NameConflict(name) => write!(f, "a mysis named {:?} already exists", name),
            CommanderError::NotFound(id) => write!(f, "no mysis with id {}", id),
            CommanderError::UnknownProvider(name) => write!(f, "unknown provider {:?}", name),
            CommanderError::Store(err) => write!(f, "{}", err),
            CommanderError::Mysis(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CommanderError {}

impl From<StoreError> for CommanderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => CommanderError::NameConflict(msg),
            StoreError::NotFound(_) => CommanderError::NotFound(Uuid::nil()),
            other => CommanderError::Store(other),
        }
    }
}

impl From<MysisError> for CommanderError {
    fn from(err: MysisError) -> Self {
        CommanderError::Mysis(err.to_string())
    }
}

/// Owns the live [`Mysis`] handles and coordinates swarm-wide operations:
/// capacity-checked creation, broadcast fan-out, and cross-mysis search.
///
/// # Example
///
/// ```rust,no_run
/// use zoea_nova::commander::Commander;
/// use zoea_nova::store::Store;
/// use zoea_nova::provider::ProviderRegistry;
/// use zoea_nova::tool_proxy::ToolProxy;
/// use zoea_nova::event_bus::EventBus;
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::open_in_memory()?;
/// let commander = Commander::new(
///     store,
///     Arc::new(ProviderRegistry::new()),
///     Arc::new(ToolProxy::new(None)),
///     EventBus::new(),
///     16,
/// );
/// let id = commander.create_mysis("scout".into(), "local".into(), "local-model".into(), 0.7, None).await?;
/// commander.start_mysis(id).await?;
/// # Ok(())
/// # }
/// ```
pub struct Commander {
    store: Store,
    providers: Arc<ProviderRegistry>,
    tool_proxy: Arc<ToolProxy>,
    event_bus: Arc<EventBus>,
    max_myses: usize,
    myses: RwLock<HashMap<Uuid, Mysis>>,
}

impl Commander {
    pub fn new(
        store: Store,
        providers: Arc<ProviderRegistry>,
        tool_proxy: Arc<ToolProxy>,
        event_bus: Arc<EventBus>,
        max_myses: usize,
    ) -> Self {
        Self {
            store,
            providers,
            tool_proxy,
            event_bus,
            max_myses,
            myses: RwLock::new(HashMap::new()),
        }
    }

    /// Build a commander from a loaded [`Config`] plus the shared
    /// collaborators it doesn't own directly.
    pub fn from_config(config: &Config, store: Store, providers: Arc<ProviderRegistry>, tool_proxy: Arc<ToolProxy>, event_bus: Arc<EventBus>) -> Self {
        Self::new(store, providers, tool_proxy, event_bus, config.swarm.max_myses)
    }

    pub fn max_myses(&self) -> usize {
        self.max_myses
    }

    pub async fn mysis_count(&self) -> usize {
        self.myses.read().await.len()
    }

    fn publish(&self, event: Event) {
        self.event_bus.publish(event);
    }

    /// Register a new mysis. Fails with [`CommanderError::CapacityExceeded`]
    /// if the swarm is already full, or [`CommanderError::NameConflict`] if
    /// the name is taken. The mysis is created Idle; call [`Commander::start_mysis`]
    /// to launch its turn loop.
    pub async fn create_mysis(
        &self,
        name: String,
        provider_name: String,
        model_name: String,
        temperature: f32,
        system_prompt: Option<String>,
    ) -> Result<Uuid, CommanderError> {
        if self.providers.get(&provider_name).is_none() {
            return Err(CommanderError::UnknownProvider(provider_name));
        }

        {
            let myses = self.myses.read().await;
            if myses.len() >= self.max_myses {
                return Err(CommanderError::CapacityExceeded { max: self.max_myses });
            }
        }

        let record = self
            .store
            .create_mysis(name.clone(), provider_name.clone(), model_name.clone(), temperature)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => CommanderError::NameConflict(name.clone()),
                other => CommanderError::Store(other),
            })?;

        let mysis = Mysis::new(
            record.id,
            record.name.clone(),
            self.store.clone(),
            self.providers.clone(),
            provider_name,
            model_name,
            temperature,
            self.tool_proxy.clone(),
            self.event_bus.clone(),
            system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        );

        let mut myses = self.myses.write().await;
        if myses.len() >= self.max_myses {
            // Lost the race against a concurrent create_mysis; undo the store insert.
            let _ = self.store.delete_mysis(record.id).await;
            return Err(CommanderError::CapacityExceeded { max: self.max_myses });
        }
        myses.insert(record.id, mysis);
        drop(myses);

        self.publish(Event::for_mysis(record.id, record.name, EventKind::MysisCreated));
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<Mysis, CommanderError> {
        self.myses.read().await.get(&id).cloned().ok_or(CommanderError::NotFound(id))
    }

    pub async fn start_mysis(&self, id: Uuid) -> Result<(), CommanderError> {
        self.get(id).await?.start().await.map_err(CommanderError::from)
    }

    pub async fn stop_mysis(&self, id: Uuid) -> Result<(), CommanderError> {
        self.get(id).await?.stop().await.map_err(CommanderError::from)
    }

    /// Stop (if running) and permanently remove a mysis, both from the
    /// in-memory registry and the store.
    pub async fn delete_mysis(&self, id: Uuid) -> Result<(), CommanderError> {
        let mysis = self.get(id).await?;
        mysis.stop().await?;
        self.store.delete_mysis(id).await?;
        self.myses.write().await.remove(&id);
        Ok(())
    }

    pub async fn list_myses(&self) -> Result<Vec<MysisRecord>, CommanderError> {
        Ok(self.store.list_myses().await?)
    }

    pub async fn mysis_state(&self, id: Uuid) -> Result<MysisState, CommanderError> {
        Ok(self.get(id).await?.state())
    }

    /// Count live myses by current in-memory state (authoritative for
    /// "is it actually running right now", as opposed to the store's
    /// last-persisted state).
    pub async fn state_counts(&self) -> HashMap<MysisState, usize> {
        let myses = self.myses.read().await;
        let mut counts = HashMap::new();
        for mysis in myses.values() {
            *counts.entry(mysis.state()).or_insert(0) += 1;
        }
        counts
    }

    pub async fn send_message_async(&self, id: Uuid, content: impl Into<String>) -> Result<(), CommanderError> {
        self.get(id).await?.send_message(content).await.map_err(CommanderError::from)
    }

    /// Broadcast from a named mysis: persisted once, then delivered to
    /// every other currently Running/Thinking mysis. The sender never
    /// receives its own broadcast.
    pub async fn broadcast_from(&self, sender_id: Uuid, content: String) -> Result<BroadcastRecord, CommanderError> {
        let record = self.store.record_broadcast(sender_id, content.clone()).await?;
        self.publish(Event::for_mysis(sender_id, "", EventKind::BroadcastSent { content: content.clone() }));
        self.deliver_broadcast(Some(sender_id), content).await;
        Ok(record)
    }

    /// Broadcast with no originating mysis (an operator or system message).
    /// Delivered to every currently Running/Thinking mysis.
    pub async fn broadcast(&self, content: String) -> Result<BroadcastRecord, CommanderError> {
        let record = self.store.record_broadcast(Uuid::nil(), content.clone()).await?;
        self.publish(Event::new(EventKind::BroadcastSent { content: content.clone() }));
        self.deliver_broadcast(None, content).await;
        Ok(record)
    }

    async fn deliver_broadcast(&self, sender_id: Option<Uuid>, content: String) {
        let effective_sender = sender_id.unwrap_or_else(Uuid::nil);
        let myses = self.myses.read().await;
        for (id, mysis) in myses.iter() {
            if Some(*id) == sender_id {
                continue;
            }
            if !matches!(mysis.state(), MysisState::Running | MysisState::Thinking) {
                continue;
            }
            if let Err(err) = mysis.receive_broadcast(effective_sender, content.clone()).await {
                log::warn!("mysis {} failed to receive broadcast: {}", id, err);
            }
        }
    }

    pub async fn search_messages(&self, mysis_id: Uuid, substring: String, limit: usize) -> Result<Vec<MemoryEntry>, CommanderError> {
        Ok(self.store.search_memories(mysis_id, substring, limit).await?)
    }

    pub async fn search_reasoning(&self, mysis_id: Uuid, substring: String, limit: usize) -> Result<Vec<MemoryEntry>, CommanderError> {
        Ok(self.store.search_reasoning(mysis_id, substring, limit).await?)
    }

    pub async fn search_broadcasts(&self, substring: String, limit: usize) -> Result<Vec<BroadcastRecord>, CommanderError> {
        Ok(self.store.search_broadcasts(substring, limit).await?)
    }

    pub async fn claim_account(&self, mysis_id: Uuid) -> Result<crate::store::Account, CommanderError> {
        Ok(self.store.claim_account(mysis_id).await?)
    }

    /// Count of known accounts by in-use state, for the CLI's status display.
    pub async fn account_status(&self) -> Result<HashMap<bool, usize>, CommanderError> {
        let accounts = self.store.list_accounts().await?;
        Ok(crate::store::in_use_summary(&accounts))
    }
}
