pub mod protocol;

use crate::config::LiveConfig;
use crate::tools::ToolCallResult;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

pub use protocol::SessionEvent;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("session setup failed: {0}")]
    Handshake(String),

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("stream error: {0}")]
    Transport(String),

    #[error("invalid session URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("tool result for unknown or already resolved call: {0}")]
    UnknownCall(String),

    #[error("session is closed")]
    Closed,
}

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One duplex streaming conversation.
///
/// Created on wakeword activation, destroyed when the conversation ends; no
/// state survives across sessions. A reader task turns inbound frames into
/// [`SessionEvent`]s, a writer task drains the ordered outbound queue, and
/// both stop when the session's cancellation token fires.
pub struct LiveSession {
    outbound: mpsc::Sender<String>,
    events: mpsc::Receiver<SessionEvent>,
    pending_calls: HashSet<String>,
    input_sample_rate: u32,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl LiveSession {
    /// Connect and run the setup handshake. Connection and authentication
    /// failures surface to the caller; there is no retry at this layer.
    pub async fn open(
        config: &LiveConfig,
        system_prompt: &str,
        tool_declarations: &[Value],
    ) -> Result<Self, SessionError> {
        let mut url = Url::parse(&config.ws_url)?;
        url.query_pairs_mut().append_pair("key", config.api_key());

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();
        log::info!("Connected to conversation backend");

        let setup = protocol::setup_message(
            &config.model,
            &config.voice,
            system_prompt,
            tool_declarations,
        );
        write
            .send(Message::Text(setup.to_string().into()))
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        // Wait for the setup acknowledgment before any audio flows.
        loop {
            let msg = tokio::time::timeout(SETUP_TIMEOUT, read.next())
                .await
                .map_err(|_| {
                    SessionError::Handshake("timed out waiting for setup acknowledgment".to_string())
                })?;

            match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<protocol::ServerMessage>(text.as_str()) {
                        Ok(message) if message.setup_complete.is_some() => {
                            log::info!("Session setup complete");
                            break;
                        }
                        Ok(_) => log::warn!("Unexpected message during session setup"),
                        Err(e) => log::warn!("Unparseable message during session setup: {e}"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(SessionError::Handshake(format!(
                        "connection closed during setup: {frame:?}"
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SessionError::Handshake(e.to_string())),
                None => {
                    return Err(SessionError::Handshake(
                        "connection closed during setup".to_string(),
                    ));
                }
            }
        }

        let cancel = CancellationToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(256);

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    payload = outbound_rx.recv() => match payload {
                        Some(payload) => {
                            if let Err(e) = write.send(Message::Text(payload.into())).await {
                                log::warn!("Session write failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
            log::debug!("Session writer exiting");
        });

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match protocol::parse_server_message(text.as_str()) {
                                Ok(events) => {
                                    for event in events {
                                        if events_tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                // Keep the stream alive on a bad message.
                                Err(e) => log::warn!("Skipping malformed server message: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Remote closed the session: {frame:?}");
                            let _ = events_tx.send(SessionEvent::Error(SessionError::ConnectionClosed)).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = events_tx.send(SessionEvent::Error(SessionError::Transport(e.to_string()))).await;
                            break;
                        }
                        None => {
                            let _ = events_tx.send(SessionEvent::Error(SessionError::ConnectionClosed)).await;
                            break;
                        }
                    }
                }
            }
            log::debug!("Session reader exiting");
        });

        Ok(Self {
            outbound: outbound_tx,
            events: events_rx,
            pending_calls: HashSet::new(),
            input_sample_rate: config.input_sample_rate,
            cancel,
            tasks: vec![writer, reader],
            closed: false,
        })
    }

    /// Next event from the model, `None` once the stream has ended. Tool
    /// calls are recorded as pending until their result is sent.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.events.recv().await;
        if let Some(SessionEvent::ToolCall(request)) = &event {
            self.pending_calls.insert(request.call_id.clone());
        }
        event
    }

    /// Forward one chunk of microphone PCM. Fire-and-forget: chunks enter the
    /// ordered outbound queue; under backpressure the chunk is dropped and the
    /// loss logged rather than stalling the capture path.
    pub fn send_audio(&self, pcm: &[u8]) {
        if self.closed {
            return;
        }
        let message = protocol::realtime_audio_message(pcm, self.input_sample_rate);
        match self.outbound.try_send(message.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Session outbound queue full, dropping audio chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Session outbound queue closed, dropping audio chunk");
            }
        }
    }

    /// Send the result for a previously observed tool call. Each call id is
    /// resolved exactly once; a second resolution (or one for a call this
    /// session never issued) is an error.
    pub async fn send_tool_result(&mut self, result: ToolCallResult) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if !self.pending_calls.remove(&result.call_id) {
            return Err(SessionError::UnknownCall(result.call_id));
        }

        let message = protocol::tool_response_message(&result);
        self.outbound
            .send(message.to_string())
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Number of tool calls observed but not yet resolved.
    pub fn pending_call_count(&self) -> usize {
        self.pending_calls.len()
    }

    /// Tear the session down. Idempotent and safe from error paths: pending
    /// tool calls are discarded, both I/O tasks are unblocked via the
    /// cancellation token, and the connection is released.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.pending_calls.is_empty() {
            log::info!(
                "Discarding {} unresolved tool call(s) at session close",
                self.pending_calls.len()
            );
            self.pending_calls.clear();
        }

        self.cancel.cancel();
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        log::info!("Session closed");
    }

    /// Session wired to plain channels instead of a socket, for tests of the
    /// orchestration logic.
    #[cfg(test)]
    pub(crate) fn from_parts(
        input_sample_rate: u32,
    ) -> (Self, mpsc::Receiver<String>, mpsc::Sender<SessionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let session = Self {
            outbound: outbound_tx,
            events: events_rx,
            pending_calls: HashSet::new(),
            input_sample_rate,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            closed: false,
        };
        (session, outbound_rx, events_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolCallRequest;
    use serde_json::json;

    fn tool_call(id: &str) -> SessionEvent {
        SessionEvent::ToolCall(ToolCallRequest {
            call_id: id.to_string(),
            tool_name: "get_upcoming_events".to_string(),
            arguments: json!({}),
        })
    }

    #[tokio::test]
    async fn test_audio_chunks_preserve_order() {
        let (session, mut outbound, _events) = LiveSession::from_parts(16_000);

        for i in 0..5u8 {
            session.send_audio(&[i, 0]);
        }

        for i in 0..5u8 {
            let raw = outbound.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            let data = value["realtime_input"]["media_chunks"][0]["data"]
                .as_str()
                .unwrap()
                .to_string();
            let expected = {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                STANDARD.encode([i, 0])
            };
            assert_eq!(data, expected, "chunk {i} out of order");
        }
    }

    #[tokio::test]
    async fn test_tool_result_resolved_exactly_once() {
        let (mut session, mut outbound, events) = LiveSession::from_parts(16_000);

        events.send(tool_call("call-1")).await.unwrap();
        let event = session.next_event().await.unwrap();
        assert!(matches!(event, SessionEvent::ToolCall(_)));
        assert_eq!(session.pending_call_count(), 1);

        let result = ToolCallResult::success("call-1", "get_upcoming_events", json!("ok"));
        session.send_tool_result(result).await.unwrap();
        assert_eq!(session.pending_call_count(), 0);
        assert!(outbound.recv().await.is_some());

        // Second resolution of the same call id is rejected.
        let duplicate = ToolCallResult::success("call-1", "get_upcoming_events", json!("again"));
        let err = session.send_tool_result(duplicate).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownCall(_)));
    }

    #[tokio::test]
    async fn test_result_without_matching_request_rejected() {
        let (mut session, _outbound, _events) = LiveSession::from_parts(16_000);

        let result = ToolCallResult::success("never-issued", "get_upcoming_events", json!("ok"));
        let err = session.send_tool_result(result).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownCall(_)));
    }

    #[tokio::test]
    async fn test_close_discards_pending_calls() {
        let (mut session, _outbound, events) = LiveSession::from_parts(16_000);

        for id in ["a", "b", "c"] {
            events.send(tool_call(id)).await.unwrap();
            session.next_event().await.unwrap();
        }
        assert_eq!(session.pending_call_count(), 3);

        session.close().await;
        assert_eq!(session.pending_call_count(), 0);

        // Results after close are rejected, not panics.
        let late = ToolCallResult::success("a", "get_upcoming_events", json!("late"));
        assert!(matches!(
            session.send_tool_result(late).await.unwrap_err(),
            SessionError::Closed
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, _outbound, _events) = LiveSession::from_parts(16_000);
        session.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_send_audio_after_close_is_noop() {
        let (mut session, mut outbound, _events) = LiveSession::from_parts(16_000);
        session.close().await;
        session.send_audio(&[1, 2]);
        assert!(outbound.try_recv().is_err());
    }
}
