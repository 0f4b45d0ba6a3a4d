// src/lib.rs

//! Zoea Nova — a swarm runtime for autonomous LLM-driven game-playing agents ("myses").
//!
//! The crate is organized around the six components described in the design
//! document: an [`event_bus`] for fanning out state changes, a [`store`] for
//! durable persistence, a [`provider`] registry for LLM backends, a
//! [`tool_proxy`] that merges local and upstream tools, the per-agent
//! [`mysis`] turn loop, and the swarm-wide [`commander`].

pub mod cli;
pub mod commander;
pub mod config;
pub mod event_bus;
pub mod mysis;
pub mod provider;
pub mod store;
pub mod tool_proxy;

pub use commander::{Commander, CommanderError};
pub use config::{Config, ConfigError};
pub use event_bus::{Event, EventBus, EventKind};
pub use mysis::{Mysis, MysisError, MysisState};
pub use store::{Store, StoreError};
