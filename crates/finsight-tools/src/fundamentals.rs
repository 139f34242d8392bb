//! fundamentals tool: company valuation snapshot.

use async_trait::async_trait;
use serde::Deserialize;

use crate::{Tool, ToolContext, ToolOutput};

pub struct FundamentalsTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default)]
    symbol: Option<String>,
}

#[async_trait]
impl Tool for FundamentalsTool {
    fn name(&self) -> &str {
        "fundamentals"
    }

    fn display_name(&self) -> &str {
        "Fetching fundamentals"
    }

    fn icon(&self) -> &str {
        "report"
    }

    fn description(&self) -> &str {
        "Fetch company fundamentals: market cap, P/E ratio, EPS, dividend yield."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Ticker symbol (falls back to the conversation's current symbol)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: Params = serde_json::from_value(params)?;
        let Some(symbol) = params
            .symbol
            .or_else(|| context.symbol.clone())
            .map(|s| s.to_uppercase())
        else {
            return Ok(ToolOutput::error("No symbol provided and none in context"));
        };

        let fundamentals = context.market.fundamentals(&symbol).await?;
        Ok(ToolOutput::ok(serde_json::to_string(&fundamentals)?))
    }
}
