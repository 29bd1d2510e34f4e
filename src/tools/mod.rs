pub mod calendar;
pub mod control;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// A model-initiated request to run a named capability. Consumed exactly once
/// by the registry.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
}

/// Outcome of one tool call, paired to its request by call id.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub payload: Value,
}

impl ToolCallResult {
    pub fn success(call_id: &str, tool_name: &str, payload: Value) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            status: ToolStatus::Success,
            payload,
        }
    }

    pub fn error(call_id: &str, tool_name: &str, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            status: ToolStatus::Error,
            payload: Value::String(message.into()),
        }
    }
}

/// A capability the model can invoke: name, schema, handler. Handlers may
/// block on network I/O; the registry keeps them off the audio path.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the accepted arguments.
    fn parameters(&self) -> Value;
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Maps tool names to handlers and dispatches incoming tool calls.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Names are unique; re-registration overwrites.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            log::warn!("Tool '{name}' re-registered, previous handler replaced");
        } else {
            log::info!("Tool registered: {name}");
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function declarations advertised at session-open time.
    pub fn declarations(&self) -> Vec<Value> {
        let mut declarations: Vec<Value> = self
            .tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters(),
                })
            })
            .collect();
        declarations.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        declarations
    }

    /// Dispatch one tool call. Always produces exactly one result on the
    /// `results` channel for the request's call id: validation failures and
    /// unknown tools answer immediately, handlers run in their own task so a
    /// slow or failing handler never blocks audio streaming.
    pub fn dispatch(
        &self,
        request: ToolCallRequest,
        results: mpsc::UnboundedSender<ToolCallResult>,
    ) {
        let ToolCallRequest {
            call_id,
            tool_name,
            arguments,
        } = request;

        let tool = match self.tools.get(&tool_name) {
            Some(tool) => Arc::clone(tool),
            None => {
                log::warn!("Unknown tool requested: {tool_name}");
                let _ = results.send(ToolCallResult::error(
                    &call_id,
                    &tool_name,
                    format!("tool '{tool_name}' not found"),
                ));
                return;
            }
        };

        if let Err(reason) = validate_arguments(&tool.parameters(), &arguments) {
            log::warn!("Rejecting call to {tool_name}: {reason}");
            let _ = results.send(ToolCallResult::error(&call_id, &tool_name, reason));
            return;
        }

        tokio::spawn(async move {
            log::info!("🔧 Tool call: {tool_name}({arguments})");
            let handler_tool = Arc::clone(&tool);
            let handler = tokio::spawn(async move { handler_tool.invoke(arguments).await });

            let result = match handler.await {
                Ok(Ok(payload)) => ToolCallResult::success(&call_id, &tool_name, payload),
                Ok(Err(e)) => {
                    log::error!("Tool {tool_name} failed: {e}");
                    ToolCallResult::error(&call_id, &tool_name, e.to_string())
                }
                Err(e) => {
                    log::error!("Tool {tool_name} handler aborted: {e}");
                    ToolCallResult::error(&call_id, &tool_name, "tool handler aborted")
                }
            };
            let _ = results.send(result);
        });
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check arguments against a declared JSON schema: required fields must be
/// present, declared properties must match their primitive type. Unknown
/// properties pass through.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err("arguments must be an object".to_string()),
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            let name = field.as_str().unwrap_or_default();
            if !args.contains_key(name) {
                return Err(format!("missing required field: {name}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in args {
            let Some(declared) = properties.get(name).and_then(|p| p.get("type")) else {
                continue;
            };
            let matches = match declared.as_str().unwrap_or_default() {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!(
                    "field '{name}' must be of type '{}', got '{}'",
                    declared.as_str().unwrap_or_default(),
                    json_type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoTool {
        fail: bool,
        invoked: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the message back"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Text to echo" }
                },
                "required": ["message"]
            })
        }

        async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
            self.invoked.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(ToolError::ExecutionFailed("downstream broke".to_string()));
            }
            Ok(json!({ "echoed": arguments["message"] }))
        }
    }

    fn echo_tool(fail: bool) -> (Arc<EchoTool>, Arc<AtomicBool>) {
        let invoked = Arc::new(AtomicBool::new(false));
        let tool = Arc::new(EchoTool {
            fail,
            invoked: Arc::clone(&invoked),
        });
        (tool, invoked)
    }

    fn request(args: Value) -> ToolCallRequest {
        ToolCallRequest {
            call_id: "call-1".to_string(),
            tool_name: "echo".to_string(),
            arguments: args,
        }
    }

    #[test]
    fn test_re_registration_overwrites() {
        let mut registry = ToolRegistry::new();
        let (first, _) = echo_tool(false);
        let (second, _) = echo_tool(true);
        registry.register(first);
        registry.register(second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_declarations_shape() {
        let mut registry = ToolRegistry::new();
        let (tool, _) = echo_tool(false);
        registry.register(tool);

        let declarations = registry.declarations();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0]["name"], "echo");
        assert_eq!(declarations[0]["parameters"]["required"][0], "message");
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let mut registry = ToolRegistry::new();
        let (tool, _) = echo_tool(false);
        registry.register(tool);
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.dispatch(request(json!({ "message": "hi" })), tx);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.call_id, "call-1");
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.payload["echoed"], "hi");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool_yields_error_result() {
        let registry = ToolRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.dispatch(
            ToolCallRequest {
                call_id: "call-9".to_string(),
                tool_name: "no_such_tool".to_string(),
                arguments: json!({}),
            },
            tx,
        );

        let result = rx.recv().await.unwrap();
        assert_eq!(result.call_id, "call-9");
        assert_eq!(result.status, ToolStatus::Error);
        // Channel is closed after the single result.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_invalid_arguments_skips_handler() {
        let mut registry = ToolRegistry::new();
        let (tool, invoked) = echo_tool(false);
        registry.register(tool);
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.dispatch(request(json!({})), tx);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert!(!invoked.load(Ordering::SeqCst), "handler must not run");
    }

    #[tokio::test]
    async fn test_dispatch_wrong_type_skips_handler() {
        let mut registry = ToolRegistry::new();
        let (tool, invoked) = echo_tool(false);
        registry.register(tool);
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.dispatch(request(json!({ "message": 42 })), tx);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_handler_yields_exactly_one_error_result() {
        let mut registry = ToolRegistry::new();
        let (tool, _) = echo_tool(true);
        registry.register(tool);
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.dispatch(request(json!({ "message": "hi" })), tx);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_validate_null_arguments_with_no_required() {
        let schema = json!({ "type": "object", "properties": {} });
        assert!(validate_arguments(&schema, &Value::Null).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_object_arguments() {
        let schema = json!({ "type": "object", "properties": {} });
        assert!(validate_arguments(&schema, &json!("text")).is_err());
    }

    #[test]
    fn test_validate_allows_undeclared_properties() {
        let schema = json!({
            "type": "object",
            "properties": { "known": { "type": "string" } },
            "required": []
        });
        assert!(validate_arguments(&schema, &json!({ "extra": 1 })).is_ok());
    }
}
