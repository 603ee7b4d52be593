//! Tool registry - name-keyed handler map with uniform failure capture.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use tutor_agent::{ToolCall, ToolDefinition};

use super::types::{ToolContext, ToolInvocation, ToolResult};
use crate::error::{EngineError, Result};

/// Default upper bound for a single tool execution.
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

/// A capability the tutor may invoke.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Name the model uses to call this tool.
    fn name(&self) -> &'static str;

    /// Schema advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute with already-decoded JSON arguments.
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value>;
}

/// Dispatches tool calls to registered handlers.
///
/// `execute` never returns an error: unknown tools, handler errors, panics
/// and timeouts all come back as a failed [`ToolResult`].
///
/// Each handler runs on its own task. A timeout ends the wait only; the
/// handler keeps running to completion so its writes land whole.
pub struct ToolRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ToolHandler>>>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    /// Register a handler, replacing any previous one with the same name.
    pub async fn register_handler(&self, handler: Arc<dyn ToolHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(handler.name().to_string(), handler);
    }

    /// Tool schema for the model, sorted by name.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let handlers = self.handlers.read().await;
        let mut defs: Vec<ToolDefinition> = handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn tool_names(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute one tool by name.
    pub async fn execute(&self, tool_name: &str, args: &Value, ctx: &ToolContext) -> ToolResult {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(tool_name).cloned()
        };

        let Some(handler) = handler else {
            warn!(tool = %tool_name, session_id = %ctx.session_id, "Unknown tool requested");
            return ToolResult::failed(&EngineError::Validation(format!(
                "unknown tool: {}",
                tool_name
            )));
        };

        let task = {
            let args = args.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.execute(&args, &ctx).await })
        };
        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(EngineError::System(format!("tool {} panicked", tool_name)))
            }
            Ok(Err(join_err)) => Err(EngineError::System(format!(
                "tool {} aborted: {}",
                tool_name, join_err
            ))),
            Err(_) => {
                debug!(tool = %tool_name, session_id = %ctx.session_id, "Tool still running after timeout");
                Err(EngineError::timeout(format!(
                    "tool {} exceeded {}ms",
                    tool_name,
                    self.timeout.as_millis()
                )))
            }
        };

        match outcome {
            Ok(data) => ToolResult::ok(data),
            Err(err) => {
                match &err {
                    EngineError::System(_) => {
                        error!(tool = %tool_name, session_id = %ctx.session_id, error = %err, "Tool failed")
                    }
                    _ => {
                        warn!(tool = %tool_name, session_id = %ctx.session_id, error = %err, "Tool failed")
                    }
                }
                ToolResult::failed(&err)
            }
        }
    }

    /// Execute a batch of model tool calls concurrently.
    ///
    /// Results come back in call order; one failure never affects the others.
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolInvocation> {
        let runs = calls.iter().map(|call| async move {
            let started = Instant::now();
            let result = self.execute(&call.name, &call.arguments, ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            debug!(
                tool = %call.name,
                call_id = %call.id,
                success = result.success,
                duration_ms,
                "Tool call finished"
            );
            ToolInvocation {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                result,
                duration_ms,
            }
        });
        join_all(runs).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Echo;

    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "Echo arguments", json!({"type": "object"}))
        }
        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(args.clone())
        }
    }

    struct Boom;

    #[async_trait::async_trait]
    impl ToolHandler for Boom {
        fn name(&self) -> &'static str {
            "boom"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("boom", "Always panics", json!({"type": "object"}))
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<Value> {
            panic!("handler bug");
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl ToolHandler for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("slow", "Sleeps", json!({"type": "object"}))
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct Marker {
        done: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ToolHandler for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("marker", "Sleeps, then marks done", json!({"type": "object"}))
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.done.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    async fn registry() -> ToolRegistry {
        let registry = ToolRegistry::with_timeout(Duration::from_millis(50));
        registry.register_handler(Arc::new(Echo)).await;
        registry.register_handler(Arc::new(Boom)).await;
        registry.register_handler(Arc::new(Slow)).await;
        registry
    }

    fn ctx() -> ToolContext {
        ToolContext::new("t", "s", "l")
    }

    #[tokio::test]
    async fn test_unknown_tool_is_validation_error() {
        let result = registry().await.execute("fly", &json!({}), &ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error_type(), Some("ValidationError"));
    }

    #[tokio::test]
    async fn test_panic_becomes_system_error() {
        let result = registry().await.execute("boom", &json!({}), &ctx()).await;
        assert_eq!(result.error_type(), Some("SystemError"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_upstream_error() {
        let result = registry().await.execute("slow", &json!({}), &ctx()).await;
        assert_eq!(result.error_type(), Some("UpstreamError"));
    }

    #[tokio::test]
    async fn test_timed_out_handler_runs_to_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let registry = registry().await;
        registry
            .register_handler(Arc::new(Marker {
                done: Arc::clone(&done),
            }))
            .await;

        let result = registry.execute("marker", &json!({}), &ctx()).await;
        assert_eq!(result.error_type(), Some("UpstreamError"));
        assert!(!done.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let registry = registry().await;
        let calls = vec![
            ToolCall::new("echo", json!({"n": 1})),
            ToolCall::new("boom", json!({})),
            ToolCall::new("echo", json!({"n": 2})),
        ];
        let results = registry.execute_all(&calls, &ctx()).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].result.data, Some(json!({"n": 1})));
        assert!(!results[1].result.success);
        assert_eq!(results[2].call_id, calls[2].id);
        assert!(results[2].result.success);
    }

    #[tokio::test]
    async fn test_definitions_sorted() {
        let names: Vec<String> = registry()
            .await
            .definitions()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["boom", "echo", "slow"]);
    }
}
