//! Shared server state.

use std::sync::Arc;

use finsight_agent::multiplexer::StreamParams;
use finsight_agent::source::AnswerSource;
use finsight_core::config::Config;
use finsight_core::store::{ChatStore, JsonlChatStore};
use finsight_tools::market::{MarketData, StaticMarket};
use finsight_tools::{register_builtin_tools, ToolRegistry};

/// Shared state accessible from all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub market: Arc<dyn MarketData>,
    pub source: Arc<dyn AnswerSource>,
    pub store: Arc<dyn ChatStore>,
}

impl AppState {
    /// Build state with the built-in tool set and a JSONL store under the
    /// configured data directory.
    pub fn new(config: Arc<Config>, source: Arc<dyn AnswerSource>) -> Self {
        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools);

        let store = Arc::new(JsonlChatStore::new(config.data_dir()));

        Self {
            config,
            tools: Arc::new(tools),
            market: Arc::new(StaticMarket::new()),
            source,
            store,
        }
    }

    /// Per-stream parameter bundle for the multiplexer.
    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            config: self.config.clone(),
            tools: self.tools.clone(),
            market: self.market.clone(),
            source: self.source.clone(),
            store: self.store.clone(),
        }
    }
}
