//! Wire types for the duplex conversation protocol.
//!
//! Outbound messages are assembled with `json!` (setup, realtime audio, tool
//! responses); inbound messages deserialize into typed structs and are
//! flattened into [`SessionEvent`]s by the session reader.

use crate::tools::{ToolCallRequest, ToolCallResult, ToolStatus};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

/// Initial setup message: model selection, audio-out voice, system prompt and
/// the tool declarations advertised for this session.
pub fn setup_message(
    model: &str,
    voice: &str,
    system_prompt: &str,
    tool_declarations: &[Value],
) -> Value {
    let tools = if tool_declarations.is_empty() {
        json!([])
    } else {
        json!([{ "function_declarations": tool_declarations }])
    };

    json!({
        "setup": {
            "model": format!("models/{model}"),
            "generation_config": {
                "response_modalities": ["AUDIO"],
                "speech_config": {
                    "voice_config": {
                        "prebuilt_voice_config": { "voice_name": voice }
                    }
                }
            },
            "system_instruction": {
                "parts": [{ "text": system_prompt }]
            },
            "tools": tools
        }
    })
}

/// One chunk of upstream microphone audio (16-bit PCM, base64 on the wire).
pub fn realtime_audio_message(pcm: &[u8], sample_rate: u32) -> Value {
    json!({
        "realtime_input": {
            "media_chunks": [{
                "data": BASE64.encode(pcm),
                "mime_type": format!("audio/pcm;rate={sample_rate}")
            }]
        }
    })
}

/// Tool result sent back into the session. String payloads are wrapped in an
/// object, since the remote side expects a structured response.
pub fn tool_response_message(result: &ToolCallResult) -> Value {
    let response = match &result.status {
        ToolStatus::Success => match &result.payload {
            Value::String(text) => json!({ "result": text }),
            Value::Object(_) => result.payload.clone(),
            other => json!({ "result": other.to_string() }),
        },
        ToolStatus::Error => json!({ "error": result.payload.clone() }),
    };

    json!({
        "tool_response": {
            "function_responses": [{
                "id": result.call_id,
                "name": result.tool_name,
                "response": response
            }]
        }
    })
}

#[derive(Debug, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "setupComplete")]
    pub setup_complete: Option<Value>,
    #[serde(rename = "serverContent")]
    pub server_content: Option<ServerContent>,
    #[serde(rename = "toolCall")]
    pub tool_call: Option<ToolCallPayload>,
}

#[derive(Debug, Deserialize)]
pub struct ServerContent {
    #[serde(rename = "modelTurn")]
    pub model_turn: Option<ModelTurn>,
    #[serde(rename = "turnComplete", default)]
    pub turn_complete: bool,
}

#[derive(Debug, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
pub struct Part {
    #[serde(rename = "inlineData")]
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallPayload {
    #[serde(rename = "functionCalls", default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionCall {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Events the session surfaces to the orchestrator.
#[derive(Debug)]
pub enum SessionEvent {
    /// 16-bit PCM at the model's output rate.
    Audio(Vec<u8>),
    /// Transcription fragments, logged only.
    Text(String),
    ToolCall(ToolCallRequest),
    TurnComplete,
    Error(super::SessionError),
}

/// Parse one inbound text message into its events. Unknown fields are
/// ignored; a single message can carry audio parts, text parts, a turn-end
/// marker and tool calls at once.
pub fn parse_server_message(raw: &str) -> Result<Vec<SessionEvent>, String> {
    let message: ServerMessage =
        serde_json::from_str(raw).map_err(|e| format!("invalid server message: {e}"))?;

    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    if inline.mime_type.starts_with("audio/") {
                        let pcm = BASE64
                            .decode(&inline.data)
                            .map_err(|e| format!("invalid audio payload: {e}"))?;
                        events.push(SessionEvent::Audio(pcm));
                    }
                }
                if let Some(text) = part.text {
                    events.push(SessionEvent::Text(text));
                }
            }
        }
        if content.turn_complete {
            events.push(SessionEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        for call in tool_call.function_calls {
            events.push(SessionEvent::ToolCall(ToolCallRequest {
                call_id: call.id.unwrap_or_default(),
                tool_name: call.name,
                arguments: call.args,
            }));
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let declarations = vec![json!({
            "name": "create_event",
            "description": "Create a calendar event",
            "parameters": { "type": "object", "properties": {} }
        })];
        let msg = setup_message("test-model", "Aoede", "be helpful", &declarations);

        assert_eq!(msg["setup"]["model"], "models/test-model");
        assert_eq!(
            msg["setup"]["generation_config"]["response_modalities"][0],
            "AUDIO"
        );
        assert_eq!(
            msg["setup"]["tools"][0]["function_declarations"][0]["name"],
            "create_event"
        );
    }

    #[test]
    fn test_setup_message_without_tools() {
        let msg = setup_message("test-model", "Aoede", "be helpful", &[]);
        assert_eq!(msg["setup"]["tools"], json!([]));
    }

    #[test]
    fn test_realtime_audio_round_trips_base64() {
        let pcm = vec![0x01, 0x02, 0x03, 0x04];
        let msg = realtime_audio_message(&pcm, 16_000);

        let chunk = &msg["realtime_input"]["media_chunks"][0];
        assert_eq!(chunk["mime_type"], "audio/pcm;rate=16000");
        let decoded = BASE64.decode(chunk["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn test_parse_audio_and_turn_complete() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": BASE64.encode([1u8, 2, 3]) } },
                        { "text": "hello" }
                    ]
                },
                "turnComplete": true
            }
        })
        .to_string();

        let events = parse_server_message(&raw).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SessionEvent::Audio(pcm) if pcm == &vec![1, 2, 3]));
        assert!(matches!(&events[1], SessionEvent::Text(t) if t == "hello"));
        assert!(matches!(events[2], SessionEvent::TurnComplete));
    }

    #[test]
    fn test_parse_tool_call() {
        let raw = json!({
            "toolCall": {
                "functionCalls": [{
                    "id": "call-7",
                    "name": "create_event",
                    "args": { "title": "Dentist" }
                }]
            }
        })
        .to_string();

        let events = parse_server_message(&raw).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::ToolCall(request) => {
                assert_eq!(request.call_id, "call-7");
                assert_eq!(request.tool_name, "create_event");
                assert_eq!(request.arguments["title"], "Dentist");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ignores_non_audio_inline_data() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{ "inlineData": { "mimeType": "image/png", "data": "aGk=" } }]
                }
            }
        })
        .to_string();

        let events = parse_server_message(&raw).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn test_tool_response_wraps_string_payload() {
        let result = ToolCallResult::success("call-1", "get_upcoming_events", json!("no events"));
        let msg = tool_response_message(&result);

        let response = &msg["tool_response"]["function_responses"][0];
        assert_eq!(response["id"], "call-1");
        assert_eq!(response["response"]["result"], "no events");
    }

    #[test]
    fn test_tool_response_passes_objects_through() {
        let result = ToolCallResult::success("call-2", "get_upcoming_events", json!({"count": 2}));
        let msg = tool_response_message(&result);
        assert_eq!(
            msg["tool_response"]["function_responses"][0]["response"]["count"],
            2
        );
    }

    #[test]
    fn test_tool_response_error_payload() {
        let result = ToolCallResult::error("call-3", "create_event", "missing field");
        let msg = tool_response_message(&result);
        assert_eq!(
            msg["tool_response"]["function_responses"][0]["response"]["error"],
            "missing field"
        );
    }
}
