use super::{Tool, ToolError};
use crate::assistant::AssistantCommand;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Lets the model end the conversation itself when the user says goodbye.
/// Registered unconditionally; the orchestrator reacts to the command on its
/// event loop, so the tool only signals.
pub struct EndConversationTool {
    commands: mpsc::UnboundedSender<AssistantCommand>,
}

impl EndConversationTool {
    pub fn new(commands: mpsc::UnboundedSender<AssistantCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl Tool for EndConversationTool {
    fn name(&self) -> &str {
        "end_conversation"
    }

    fn description(&self) -> &str {
        "End the current conversation and return to wakeword listening. Use this when the user \
         says goodbye, thanks you, says 'that's all' or 'done', or otherwise wants to stop."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn invoke(&self, _arguments: Value) -> Result<Value, ToolError> {
        log::info!("🔚 Conversation end requested by the model");
        self.commands
            .send(AssistantCommand::EndConversation)
            .map_err(|_| ToolError::ExecutionFailed("assistant is shutting down".to_string()))?;
        Ok(json!({ "result": "Ending the conversation. Goodbye!" }))
    }
}
