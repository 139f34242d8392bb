//! fibonacci_levels tool: retracement levels over a recent price window.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market::PriceBar;
use crate::{Tool, ToolContext, ToolOutput};

const RATIOS: [f64; 5] = [0.236, 0.382, 0.5, 0.618, 0.786];

#[derive(Debug, Serialize)]
struct FibLevels {
    symbol: String,
    window_days: usize,
    swing_high: f64,
    swing_low: f64,
    levels: Vec<FibLevel>,
}

#[derive(Debug, Serialize)]
struct FibLevel {
    ratio: f64,
    price: f64,
}

/// Retracement levels between the window's swing high and swing low.
fn retracement_levels(bars: &[PriceBar]) -> Option<(f64, f64, Vec<FibLevel>)> {
    if bars.is_empty() {
        return None;
    }
    let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let range = high - low;

    let levels = RATIOS
        .iter()
        .map(|&ratio| FibLevel {
            ratio,
            price: high - range * ratio,
        })
        .collect();
    Some((high, low, levels))
}

pub struct FibonacciLevelsTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default = "default_window")]
    window_days: usize,
}

fn default_window() -> usize {
    90
}

#[async_trait]
impl Tool for FibonacciLevelsTool {
    fn name(&self) -> &str {
        "fibonacci_levels"
    }

    fn display_name(&self) -> &str {
        "Computing Fibonacci levels"
    }

    fn icon(&self) -> &str {
        "fibonacci"
    }

    fn description(&self) -> &str {
        "Compute Fibonacci retracement levels from the swing high/low of a recent price window."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Ticker symbol (falls back to the conversation's current symbol)"
                },
                "window_days": {
                    "type": "integer",
                    "description": "Lookback window in trading days (default: 90)"
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

        let bars = context.market.history(&symbol, params.window_days).await?;
        let Some((high, low, levels)) = retracement_levels(&bars) else {
            return Ok(ToolOutput::error(format!("No price history for {symbol}")));
        };

        let result = FibLevels {
            symbol,
            window_days: params.window_days,
            swing_high: high,
            swing_low: low,
            levels,
        };
        Ok(ToolOutput::ok(serde_json::to_string(&result)?))
    }
}
