//! Tool executor
//!
//! One uniform dispatch path for everything side-effecting: tool calls
//! requested by the reply generator and intent short-circuit actions both
//! resolve through here. Handler failures are captured as results, never
//! propagated — a failed tool becomes a tool message describing the failure
//! and the turn continues.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::dialogue::ToolCall;
use crate::providers::ToolDefinition;
use crate::{Error, Result};

/// Async tool handler: JSON arguments in, display text out
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<String>> + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Registry and dispatcher for tool calls
#[derive(Default)]
pub struct ToolExecutor {
    tools: HashMap<String, RegisteredTool>,
    /// Intent name → tool name, for the short-circuit path
    intent_actions: HashMap<String, String>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.tools.keys())
            .field("intent_actions", &self.intent_actions)
            .finish()
    }
}

impl ToolExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor preloaded with the built-in tools
    #[must_use]
    pub fn builtin() -> Self {
        let mut executor = Self::new();
        executor.register(
            ToolDefinition {
                name: "get_time".to_string(),
                description: "Get the current date and time (UTC)".to_string(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
            Arc::new(|_args| -> BoxFuture<'static, Result<String>> {
                Box::pin(async { Ok(chrono::Utc::now().to_rfc3339()) })
            }),
        );
        executor.register_intent_action("query_time", "get_time");
        executor
    }

    /// Register a tool under its definition name
    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        let name = definition.name.clone();
        self.tools
            .insert(name, RegisteredTool { definition, handler });
    }

    /// Map an intent name onto a registered tool for short-circuit execution
    pub fn register_intent_action(&mut self, intent: impl Into<String>, tool: impl Into<String>) {
        self.intent_actions.insert(intent.into(), tool.into());
    }

    /// The tool backing an intent, if one was registered
    #[must_use]
    pub fn intent_action(&self, intent: &str) -> Option<&str> {
        self.intent_actions.get(intent).map(String::as_str)
    }

    /// Definitions advertised to the reply generator
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute one tool call
    ///
    /// # Errors
    ///
    /// Returns `Error::Tool` for unknown tools, unparsable arguments, or
    /// handler failures.
    pub async fn execute(&self, name: &str, arguments: &str) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;

        let args: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| Error::Tool(format!("invalid arguments for {name}: {e}")))?
        };

        tracing::debug!(tool = name, "executing tool");
        (tool.handler)(args)
            .await
            .map_err(|e| Error::Tool(format!("{name}: {e}")))
    }

    /// Execute a batch of tool calls concurrently
    ///
    /// Results come back in input order; each failure is captured per call.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<(ToolCall, Result<String>)> {
        let futures = calls.iter().map(|call| {
            let call = call.clone();
            async move {
                let result = self.execute(&call.name, &call.arguments).await;
                (call, result)
            }
        });
        futures::future::join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_executor() -> ToolExecutor {
        let mut executor = ToolExecutor::new();
        executor.register(
            ToolDefinition {
                name: "echo".to_string(),
                description: "Echo the input".to_string(),
                parameters: serde_json::json!({ "type": "object" }),
            },
            Arc::new(|args| -> BoxFuture<'static, Result<String>> {
                Box::pin(async move {
                    Ok(args
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string())
                })
            }),
        );
        executor.register(
            ToolDefinition {
                name: "fail".to_string(),
                description: "Always fails".to_string(),
                parameters: serde_json::json!({ "type": "object" }),
            },
            Arc::new(|_| -> BoxFuture<'static, Result<String>> {
                Box::pin(async { Err(Error::Tool("broken".to_string())) })
            }),
        );
        executor
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let executor = echo_executor();
        let output = executor.execute("echo", r#"{"text":"hi"}"#).await.unwrap();
        assert_eq!(output, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_tool_error() {
        let executor = echo_executor();
        let err = executor.execute("nope", "{}").await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[tokio::test]
    async fn empty_arguments_default_to_object() {
        let executor = echo_executor();
        assert!(executor.execute("echo", "").await.is_ok());
    }

    #[tokio::test]
    async fn batch_preserves_order_and_captures_failures() {
        let executor = echo_executor();
        let calls = vec![
            ToolCall {
                id: "1".to_string(),
                name: "echo".to_string(),
                arguments: r#"{"text":"a"}"#.to_string(),
            },
            ToolCall {
                id: "2".to_string(),
                name: "fail".to_string(),
                arguments: "{}".to_string(),
            },
        ];
        let results = executor.execute_batch(&calls).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.id, "1");
        assert_eq!(results[0].1.as_deref().unwrap(), "a");
        assert!(results[1].1.is_err());
    }

    #[tokio::test]
    async fn builtin_get_time_runs() {
        let executor = ToolExecutor::builtin();
        let output = executor.execute("get_time", "{}").await.unwrap();
        assert!(output.contains('T'));
        assert_eq!(executor.intent_action("query_time"), Some("get_time"));
    }
}
