//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::broker::Broker;
use crate::config::Config;
use crate::history::ConversationStore;
use crate::mcp::McpManager;
use crate::registry::DeviceRegistry;

/// Shared application state for the bridge.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live device sockets and device records/PINs.
    pub registry: DeviceRegistry,
    /// Request/response correlation broker.
    pub broker: Broker,
    /// Per-device conversation windows.
    pub history: ConversationStore,
    /// MCP tool-server manager.
    pub mcp: McpManager,
}

impl AppState {
    /// Build a fresh state tree from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = DeviceRegistry::new();
        let broker = Broker::new(registry.clone());
        let mcp = McpManager::new(config.mcp.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            broker,
            history: ConversationStore::new(),
            mcp,
        }
    }
}
