//! Tool implementations for the Finsight agent.
//!
//! Tools are the capabilities the agent can invoke while answering a
//! question: ticker lookup, quotes, and technical/fundamental analysis.
//! Each tool implements the [`Tool`] trait; the streaming pipeline only
//! cares about their start/end/error boundaries.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use finsight_core::config::Config;

pub mod fibonacci;
pub mod fundamentals;
pub mod market;
pub mod stochastic;

use market::MarketData;

/// Context provided to tools during execution.
///
/// `symbol` carries the request's `current_symbol` when present; the
/// request value always wins over any server-stored UI symbol, so tools
/// never depend on the arrival order of a separate state-sync call.
pub struct ToolContext {
    pub symbol: Option<String>,
    pub config: Arc<Config>,
    pub market: Arc<dyn MarketData>,
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// The core tool trait. Every analysis capability implements this.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the agent (e.g., "search_ticker").
    fn name(&self) -> &str;

    /// Human-readable label shown in the transcript while running.
    fn display_name(&self) -> &str;

    /// Icon identifier for the tool-progress UI entry.
    fn icon(&self) -> &str;

    /// Human-readable description for the agent.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Generate tool definitions for the agent's planning step.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.parameters_schema(),
                })
            })
            .collect()
    }
}

/// Register the built-in analysis tools.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(Box::new(market::SearchTickerTool));
    registry.register(Box::new(market::FetchQuoteTool));
    registry.register(Box::new(fibonacci::FibonacciLevelsTool));
    registry.register(Box::new(stochastic::StochasticOscillatorTool));
    registry.register(Box::new(fundamentals::FundamentalsTool));
}
