//! Market data access: the provider seam plus the ticker/quote tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Tool, ToolContext, ToolOutput};

/// A daily price bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// A current-price snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_pct: f64,
}

/// Company fundamentals snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fundamentals {
    pub symbol: String,
    pub name: String,
    pub market_cap: f64,
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub dividend_yield: Option<f64>,
}

/// Market data provider seam. Tools depend on this trait, never on a
/// concrete backend, so the whole pipeline runs offline under test.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Resolve a free-text query to (symbol, company name) candidates.
    async fn search(&self, query: &str) -> anyhow::Result<Vec<(String, String)>>;

    /// Current price snapshot for a symbol.
    async fn quote(&self, symbol: &str) -> anyhow::Result<Quote>;

    /// Up to `days` most recent daily bars, oldest first.
    async fn history(&self, symbol: &str, days: usize) -> anyhow::Result<Vec<PriceBar>>;

    /// Fundamentals for a symbol.
    async fn fundamentals(&self, symbol: &str) -> anyhow::Result<Fundamentals>;
}

/// Deterministic in-process market data, seeded per symbol. Used for the
/// offline demo and for tests.
pub struct StaticMarket {
    symbols: Vec<(String, String, f64)>, // (symbol, name, base price)
}

impl Default for StaticMarket {
    fn default() -> Self {
        Self {
            symbols: vec![
                ("AAPL".into(), "Apple Inc.".into(), 230.0),
                ("MSFT".into(), "Microsoft Corporation".into(), 420.0),
                ("GOOGL".into(), "Alphabet Inc.".into(), 180.0),
                ("AMZN".into(), "Amazon.com, Inc.".into(), 195.0),
                ("NVDA".into(), "NVIDIA Corporation".into(), 135.0),
                ("TSLA".into(), "Tesla, Inc.".into(), 250.0),
            ],
        }
    }
}

impl StaticMarket {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, symbol: &str) -> Option<&(String, String, f64)> {
        let upper = symbol.to_uppercase();
        self.symbols.iter().find(|(s, _, _)| *s == upper)
    }
}

/// Deterministic pseudo-random walk seeded by symbol, so tests see stable
/// histories without a network.
fn synthetic_history(symbol: &str, base: f64, days: usize) -> Vec<PriceBar> {
    use rand::{Rng, SeedableRng};
    let seed = symbol.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut close = base;
    let mut bars = Vec::with_capacity(days);
    for _ in 0..days {
        let drift: f64 = rng.random_range(-0.02..0.02);
        let open = close;
        close = (open * (1.0 + drift)).max(1.0);
        let high = open.max(close) * (1.0 + rng.random_range(0.0..0.01));
        let low = open.min(close) * (1.0 - rng.random_range(0.0..0.01));
        let volume = rng.random_range(5_000_000..80_000_000);
        bars.push(PriceBar { open, high, low, close, volume });
    }
    bars
}

#[async_trait]
impl MarketData for StaticMarket {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<(String, String)>> {
        let q = query.to_lowercase();
        Ok(self
            .symbols
            .iter()
            .filter(|(s, name, _)| {
                s.to_lowercase().contains(&q) || name.to_lowercase().contains(&q)
            })
            .map(|(s, name, _)| (s.clone(), name.clone()))
            .collect())
    }

    async fn quote(&self, symbol: &str) -> anyhow::Result<Quote> {
        let (sym, _, base) = self
            .lookup(symbol)
            .ok_or_else(|| anyhow::anyhow!("Unknown symbol: {symbol}"))?;
        let bars = synthetic_history(sym, *base, 2);
        let prev = bars[0].close;
        let last = bars[1].close;
        Ok(Quote {
            symbol: sym.clone(),
            price: last,
            change_pct: (last - prev) / prev * 100.0,
        })
    }

    async fn history(&self, symbol: &str, days: usize) -> anyhow::Result<Vec<PriceBar>> {
        let (sym, _, base) = self
            .lookup(symbol)
            .ok_or_else(|| anyhow::anyhow!("Unknown symbol: {symbol}"))?;
        Ok(synthetic_history(sym, *base, days))
    }

    async fn fundamentals(&self, symbol: &str) -> anyhow::Result<Fundamentals> {
        let (sym, name, base) = self
            .lookup(symbol)
            .ok_or_else(|| anyhow::anyhow!("Unknown symbol: {symbol}"))?;
        Ok(Fundamentals {
            symbol: sym.clone(),
            name: name.clone(),
            market_cap: base * 1.5e10,
            pe_ratio: Some(28.4),
            eps: Some(base / 30.0),
            dividend_yield: Some(0.55),
        })
    }
}

/// Resolve the symbol for a tool call: explicit param wins, then the
/// request-scoped context symbol.
fn resolve_symbol(param: Option<&str>, context: &ToolContext) -> Option<String> {
    param
        .map(str::to_string)
        .or_else(|| context.symbol.clone())
        .map(|s| s.to_uppercase())
}

// --- search_ticker ---

pub struct SearchTickerTool;

#[derive(Deserialize)]
struct SearchParams {
    query: String,
}

#[async_trait]
impl Tool for SearchTickerTool {
    fn name(&self) -> &str {
        "search_ticker"
    }

    fn display_name(&self) -> &str {
        "Searching tickers"
    }

    fn icon(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Resolve a company name or partial symbol to matching ticker symbols."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Company name or partial ticker symbol"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: SearchParams = serde_json::from_value(params)?;
        debug!(query = %params.query, "Searching tickers");

        let matches = context.market.search(&params.query).await?;
        if matches.is_empty() {
            return Ok(ToolOutput::error(format!(
                "No tickers found for \"{}\"",
                params.query
            )));
        }

        let listing: Vec<serde_json::Value> = matches
            .iter()
            .map(|(s, name)| serde_json::json!({ "symbol": s, "name": name }))
            .collect();
        Ok(ToolOutput::ok(serde_json::to_string(&listing)?))
    }
}

// --- fetch_quote ---

pub struct FetchQuoteTool;

#[derive(Deserialize)]
struct QuoteParams {
    #[serde(default)]
    symbol: Option<String>,
}

#[async_trait]
impl Tool for FetchQuoteTool {
    fn name(&self) -> &str {
        "fetch_quote"
    }

    fn display_name(&self) -> &str {
        "Fetching quote"
    }

    fn icon(&self) -> &str {
        "chart"
    }

    fn description(&self) -> &str {
        "Fetch the current price snapshot for a ticker symbol."
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
        let params: QuoteParams = serde_json::from_value(params)?;
        let Some(symbol) = resolve_symbol(params.symbol.as_deref(), context) else {
            return Ok(ToolOutput::error("No symbol provided and none in context"));
        };

        let quote = context.market.quote(&symbol).await?;
        Ok(ToolOutput::ok(serde_json::to_string(&quote)?))
    }
}
