//! Tool execution supervision.
//!
//! Runs the planned tool invocations concurrently. Each invocation pushes
//! `tool_start` before executing and exactly one of `tool_end`/`tool_error`
//! after. A failing or panicking tool is contained at its own boundary;
//! it never aborts sibling invocations or the agent task. Whether the
//! overall answer still succeeds on partial results is the answer source's
//! call, not inferred here.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use finsight_core::protocol::StreamEvent;
use finsight_core::types::ToolCallRecord;
use finsight_tools::{ToolContext, ToolOutput, ToolRegistry};

use crate::queue::EventQueue;
use crate::source::PlannedCall;

pub struct ToolSupervisor {
    queue: Arc<EventQueue>,
    tools: Arc<ToolRegistry>,
}

impl ToolSupervisor {
    pub fn new(queue: Arc<EventQueue>, tools: Arc<ToolRegistry>) -> Self {
        Self { queue, tools }
    }

    /// Execute all planned calls concurrently and collect their records in
    /// plan order. Always returns a record per call, failed or not.
    pub async fn execute_all(
        &self,
        calls: Vec<PlannedCall>,
        context: Arc<ToolContext>,
    ) -> Vec<ToolCallRecord> {
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls {
            let run_id = Uuid::new_v4().to_string();
            let queue = self.queue.clone();
            let tools = self.tools.clone();
            let context = context.clone();

            let handle = tokio::spawn(run_one(run_id.clone(), call.clone(), queue, tools, context));
            handles.push((run_id, call, handle));
        }

        let mut records = Vec::with_capacity(handles.len());
        for (run_id, call, handle) in handles {
            match handle.await {
                Ok(record) => records.push(record),
                Err(join_err) => {
                    // Tool task panicked. Contain it: emit the terminal
                    // event the task never got to send and record the
                    // failure like any other tool error.
                    warn!(%run_id, tool = %call.tool_name, %join_err, "Tool task panicked");
                    let _ = self.queue.push(StreamEvent::ToolError {
                        run_id: run_id.clone(),
                        error: format!("tool panicked: {join_err}"),
                        duration_ms: 0,
                    });
                    records.push(ToolCallRecord {
                        run_id,
                        tool_name: call.tool_name,
                        inputs: call.inputs,
                        output: None,
                        error: Some(format!("tool panicked: {join_err}")),
                        duration_ms: 0,
                    });
                }
            }
        }
        records
    }
}

/// One supervised invocation: start event, execute, terminal event.
async fn run_one(
    run_id: String,
    call: PlannedCall,
    queue: Arc<EventQueue>,
    tools: Arc<ToolRegistry>,
    context: Arc<ToolContext>,
) -> ToolCallRecord {
    let (display_name, icon) = match tools.get(&call.tool_name) {
        Some(tool) => (tool.display_name().to_string(), tool.icon().to_string()),
        None => (call.tool_name.clone(), "tool".to_string()),
    };

    let started = queue.push(StreamEvent::ToolStart {
        run_id: run_id.clone(),
        tool_name: call.tool_name.clone(),
        display_name,
        icon,
        symbol: context.symbol.clone(),
        inputs: call.inputs.clone(),
    });

    if started.is_err() {
        // Stream is gone (queue tripped or closed). Skip the work; nobody
        // will see its events.
        debug!(%run_id, tool = %call.tool_name, "Queue inactive, skipping tool");
        return ToolCallRecord {
            run_id,
            tool_name: call.tool_name,
            inputs: call.inputs,
            output: None,
            error: Some("stream inactive".into()),
            duration_ms: 0,
        };
    }

    info!(%run_id, tool = %call.tool_name, "Executing tool");
    let start = Instant::now();

    let output = match tools.get(&call.tool_name) {
        Some(tool) => match tool.execute(call.inputs.clone(), &context).await {
            Ok(output) => output,
            Err(e) => {
                warn!(%run_id, tool = %call.tool_name, %e, "Tool execution error");
                ToolOutput::error(format!("Tool error: {e}"))
            }
        },
        None => ToolOutput::error(format!("Unknown tool: {}", call.tool_name)),
    };

    let duration_ms = start.elapsed().as_millis() as u64;

    if output.is_error {
        let _ = queue.push(StreamEvent::ToolError {
            run_id: run_id.clone(),
            error: output.content.clone(),
            duration_ms,
        });
        ToolCallRecord {
            run_id,
            tool_name: call.tool_name,
            inputs: call.inputs,
            output: None,
            error: Some(output.content),
            duration_ms,
        }
    } else {
        let _ = queue.push(StreamEvent::ToolEnd {
            run_id: run_id.clone(),
            output: output.content.clone(),
            duration_ms,
        });
        ToolCallRecord {
            run_id,
            tool_name: call.tool_name,
            inputs: call.inputs,
            output: Some(output.content),
            error: None,
            duration_ms,
        }
    }
}
