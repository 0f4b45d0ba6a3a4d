//! Canned-response stub standing in for the upstream game tool server, per
//! `spec.md §6`'s offline run mode: a fixed set of read-only tool names
//! answer with static data instead of a real HTTP round trip, so the swarm
//! can be exercised without a live game server.
//!
//! Grounded on [`super::mcp_client::JsonRpcToolClient`] for the
//! [`UpstreamClient`] shape; the canned payloads themselves have no wire
//! counterpart to follow and are invented fresh as plausible read-only
//! game state.

use std::error::Error;

use async_trait::async_trait;
use serde_json::Value;

use super::{ToolMetadata, ToolParameter, ToolParameterType, ToolResult, UpstreamClient};

/// Tool names this stub knows how to answer. Matches
/// [`crate::mysis::DEFAULT_SNAPSHOT_TOOL_NAMES`] — these are exactly the
/// read-only tools a mysis polls every turn, which is what makes them safe
/// to fake offline.
const READ_ONLY_TOOLS: &[&str] = &["inventory", "map", "player_state", "look"];

/// An [`UpstreamClient`] that never leaves the process: `tools/list`
/// advertises [`READ_ONLY_TOOLS`] and `tools/call` answers each with a
/// fixed payload. Any other tool name comes back as a failed [`ToolResult`]
/// rather than a transport error, so a mysis sees it the same way it would
/// see a real upstream rejecting an unsupported tool.
pub struct OfflineUpstreamClient;

impl OfflineUpstreamClient {
    pub fn new() -> Self {
        Self
    }

    fn canned_response(name: &str) -> Option<Value> {
        match name {
            "inventory" => Some(serde_json::json!({"items": [], "capacity": 20})),
            "map" => Some(serde_json::json!({"region": "offline-sandbox", "exits": ["north", "south"]})),
            "player_state" => Some(serde_json::json!({"health": 100, "level": 1, "position": [0, 0]})),
            "look" => Some(serde_json::json!({"description": "An empty offline sandbox room."})),
            _ => None,
        }
    }
}

impl Default for OfflineUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for OfflineUpstreamClient {
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(READ_ONLY_TOOLS
            .iter()
            .map(|name| {
                ToolMetadata::new(*name, format!("offline stub for {}", name)).with_parameter(
                    ToolParameter::new("_unused", ToolParameterType::String).with_description("ignored in offline mode"),
                )
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, _args: Value) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        match Self::canned_response(name) {
            Some(output) => Ok(ToolResult::success(output)),
            None => Ok(ToolResult::failure(format!(
                "{:?} is not available in offline mode; only {:?} are stubbed",
                name, READ_ONLY_TOOLS
            ))),
        }
    }
}
