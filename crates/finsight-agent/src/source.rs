//! The opaque answer source behind the pipeline.
//!
//! The pipeline treats the LLM as an async iterator of string fragments
//! plus a planning step that picks tool invocations. [`ScriptedSource`]
//! is a deterministic implementation used by the offline demo and the
//! pipeline tests; a real completion provider plugs in behind the same
//! trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use finsight_core::types::ToolCallRecord;

/// Async iterator of answer fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// A tool invocation requested by the planning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCall {
    pub tool_name: String,
    pub inputs: serde_json::Value,
}

#[async_trait]
pub trait AnswerSource: Send + Sync {
    /// Decide which tools to run for this message. May be empty.
    async fn plan(
        &self,
        message: &str,
        tool_definitions: &[serde_json::Value],
        symbol: Option<&str>,
    ) -> anyhow::Result<Vec<PlannedCall>>;

    /// Produce the final answer as a stream of text fragments, given the
    /// completed tool results (possibly partial; failed tools appear with
    /// their error recorded).
    async fn answer(
        &self,
        message: &str,
        tool_results: &[ToolCallRecord],
    ) -> anyhow::Result<TokenStream>;

    /// Short conversation title for a first message, if this source
    /// supports title generation.
    async fn title(&self, message: &str) -> anyhow::Result<Option<String>> {
        let _ = message;
        Ok(None)
    }
}

/// Deterministic keyword-driven source. Plans tools from trigger words in
/// the message and templates an answer from their outputs.
#[derive(Default)]
pub struct ScriptedSource {
    /// When set, `answer` streams exactly these fragments instead of the
    /// templated summary. Used by tests that need byte-exact output.
    fixed_fragments: Option<Vec<String>>,
    /// When set, `plan` returns exactly these calls.
    fixed_plan: Option<Vec<PlannedCall>>,
    fail_answer: bool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fragments(fragments: Vec<String>) -> Self {
        Self {
            fixed_fragments: Some(fragments),
            ..Self::default()
        }
    }

    pub fn with_plan(mut self, plan: Vec<PlannedCall>) -> Self {
        self.fixed_plan = Some(plan);
        self
    }

    /// Make `answer` fail, for exercising the upstream-failure path.
    pub fn failing_answer(mut self) -> Self {
        self.fail_answer = true;
        self
    }
}

fn keyword_plan(message: &str, symbol: Option<&str>) -> Vec<PlannedCall> {
    let lower = message.to_lowercase();
    let mut calls = Vec::new();

    if lower.contains("fib") {
        calls.push(PlannedCall {
            tool_name: "fibonacci_levels".into(),
            inputs: serde_json::json!({}),
        });
    }
    if lower.contains("stochastic") || lower.contains("momentum") {
        calls.push(PlannedCall {
            tool_name: "stochastic_oscillator".into(),
            inputs: serde_json::json!({}),
        });
    }
    if lower.contains("fundamental") || lower.contains("valuation") || lower.contains("p/e") {
        calls.push(PlannedCall {
            tool_name: "fundamentals".into(),
            inputs: serde_json::json!({}),
        });
    }
    if lower.contains("price") || lower.contains("quote") || lower.contains("doing") {
        calls.push(PlannedCall {
            tool_name: "fetch_quote".into(),
            inputs: serde_json::json!({}),
        });
    }
    // Nothing matched but we have a symbol: at least look at the quote.
    if calls.is_empty() && symbol.is_some() {
        calls.push(PlannedCall {
            tool_name: "fetch_quote".into(),
            inputs: serde_json::json!({}),
        });
    }
    calls
}

fn templated_answer(message: &str, tool_results: &[ToolCallRecord]) -> String {
    if tool_results.is_empty() {
        return format!(
            "I don't have market data to add here. You asked: \"{message}\". \
             Mention a ticker symbol and I can pull quotes, Fibonacci levels, \
             momentum readings, or fundamentals."
        );
    }

    let mut out = String::from("Here is what the analysis found:\n");
    for record in tool_results {
        match (&record.output, &record.error) {
            (Some(output), _) => {
                out.push_str(&format!("- {}: {}\n", record.tool_name, output));
            }
            (None, Some(error)) => {
                out.push_str(&format!("- {} failed: {}\n", record.tool_name, error));
            }
            (None, None) => {}
        }
    }
    out
}

#[async_trait]
impl AnswerSource for ScriptedSource {
    async fn plan(
        &self,
        message: &str,
        _tool_definitions: &[serde_json::Value],
        symbol: Option<&str>,
    ) -> anyhow::Result<Vec<PlannedCall>> {
        if let Some(plan) = &self.fixed_plan {
            return Ok(plan.clone());
        }
        Ok(keyword_plan(message, symbol))
    }

    async fn answer(
        &self,
        message: &str,
        tool_results: &[ToolCallRecord],
    ) -> anyhow::Result<TokenStream> {
        if self.fail_answer {
            anyhow::bail!("answer source unavailable");
        }

        let fragments = match &self.fixed_fragments {
            Some(fragments) => fragments.clone(),
            None => {
                let text = templated_answer(message, tool_results);
                // Fragment on word boundaries, the way a real model streams.
                text.split_inclusive(' ').map(str::to_string).collect()
            }
        };

        Ok(Box::pin(futures::stream::iter(
            fragments.into_iter().map(Ok),
        )))
    }

    async fn title(&self, message: &str) -> anyhow::Result<Option<String>> {
        let mut title: String = message.chars().take(40).collect();
        if message.chars().count() > 40 {
            title.push('…');
        }
        Ok(Some(title))
    }
}
