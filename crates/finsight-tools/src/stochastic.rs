//! stochastic_oscillator tool: %K/%D momentum readings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market::PriceBar;
use crate::{Tool, ToolContext, ToolOutput};

#[derive(Debug, Serialize)]
struct StochasticReading {
    symbol: String,
    period: usize,
    percent_k: f64,
    percent_d: f64,
    signal: &'static str,
}

/// %K for the window ending at `bars[end]` (inclusive), over `period` bars.
fn percent_k(bars: &[PriceBar], end: usize, period: usize) -> Option<f64> {
    if end + 1 < period {
        return None;
    }
    let window = &bars[end + 1 - period..=end];
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if (high - low).abs() < f64::EPSILON {
        return Some(50.0);
    }
    Some((bars[end].close - low) / (high - low) * 100.0)
}

/// Latest %K plus %D (3-period SMA of %K). Needs `period + 2` bars.
fn stochastic(bars: &[PriceBar], period: usize) -> Option<(f64, f64)> {
    let last = bars.len().checked_sub(1)?;
    let k = percent_k(bars, last, period)?;
    let d_values: Vec<f64> = (0..3)
        .filter_map(|i| percent_k(bars, last.checked_sub(i)?, period))
        .collect();
    if d_values.len() < 3 {
        return None;
    }
    Some((k, d_values.iter().sum::<f64>() / 3.0))
}

fn classify(k: f64) -> &'static str {
    if k >= 80.0 {
        "overbought"
    } else if k <= 20.0 {
        "oversold"
    } else {
        "neutral"
    }
}

pub struct StochasticOscillatorTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default = "default_period")]
    period: usize,
}

fn default_period() -> usize {
    14
}

#[async_trait]
impl Tool for StochasticOscillatorTool {
    fn name(&self) -> &str {
        "stochastic_oscillator"
    }

    fn display_name(&self) -> &str {
        "Computing stochastic oscillator"
    }

    fn icon(&self) -> &str {
        "oscillator"
    }

    fn description(&self) -> &str {
        "Compute the stochastic oscillator (%K, %D) for a symbol and classify it as overbought, oversold, or neutral."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Ticker symbol (falls back to the conversation's current symbol)"
                },
                "period": {
                    "type": "integer",
                    "description": "Lookback period in trading days (default: 14)"
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

        // +2 bars so %D has three full %K windows
        let bars = context.market.history(&symbol, params.period + 2).await?;
        let Some((k, d)) = stochastic(&bars, params.period) else {
            return Ok(ToolOutput::error(format!(
                "Not enough history for {symbol} (need {} bars, got {})",
                params.period + 2,
                bars.len()
            )));
        };

        let reading = StochasticReading {
            symbol,
            period: params.period,
            percent_k: k,
            percent_d: d,
            signal: classify(k),
        };
        Ok(ToolOutput::ok(serde_json::to_string(&reading)?))
    }
}
