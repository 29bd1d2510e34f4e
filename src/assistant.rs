use crate::audio::{
    AudioCapture, AudioCaptureConfig, AudioFrame, AudioPlayback, AudioPlaybackConfig, Cue,
};
use crate::config::Config;
use crate::error::Result;
use crate::session::{LiveSession, SessionEvent};
use crate::tools::{calendar, control::EndConversationTool, ToolCallResult, ToolRegistry};
use crate::vad::SpeechGate;
use crate::wakeword::{RustpotterEngine, WakewordDetector, WakewordError, WakewordEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::Display;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// The orchestrator's single conversation state. Owned by [`Assistant`] and
/// mutated only on its event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConversationState {
    Idle,
    Listening,
    Active,
    AwaitingFollowUp,
    ShuttingDown,
}

/// Commands delivered into the orchestrator's event loop, e.g. from the
/// `end_conversation` tool.
#[derive(Debug)]
pub enum AssistantCommand {
    EndConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum EndReason {
    Requested,
    FollowUpTimeout,
    IdleTimeout,
    StreamError,
    Shutdown,
}

/// What the wakeword detection task reports to the orchestrator.
enum WakewordSignal {
    Event(WakewordEvent),
    /// Engine failure; the listening pipeline cannot continue.
    Fatal(WakewordError),
}

/// Conversation policy state: the state value itself, the follow-up window
/// and the inactivity backstop. All transition decisions live here so the
/// event loop stays a thin dispatcher.
struct Conversation {
    state: ConversationState,
    follow_up_window: Duration,
    idle_timeout: Duration,
    follow_up_deadline: Option<Instant>,
    last_activity: Instant,
}

impl Conversation {
    fn new(follow_up_window: Duration, idle_timeout: Duration) -> Self {
        Self {
            state: ConversationState::Idle,
            follow_up_window,
            idle_timeout,
            follow_up_deadline: None,
            last_activity: Instant::now(),
        }
    }

    fn state(&self) -> ConversationState {
        self.state
    }

    fn listen(&mut self) {
        self.state = ConversationState::Listening;
        self.follow_up_deadline = None;
    }

    /// Whether a wakeword event starts a conversation. Events in any other
    /// state are ignored, so a trigger mid-conversation never opens a second
    /// session.
    fn on_wakeword(&self) -> bool {
        self.state == ConversationState::Listening
    }

    fn activate(&mut self) {
        self.state = ConversationState::Active;
        self.follow_up_deadline = None;
        self.last_activity = Instant::now();
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Local speech activity. Resumes Active from the follow-up window;
    /// returns true when it did.
    fn on_speech(&mut self) -> bool {
        self.last_activity = Instant::now();
        if self.state == ConversationState::AwaitingFollowUp {
            self.state = ConversationState::Active;
            self.follow_up_deadline = None;
            true
        } else {
            false
        }
    }

    /// The model finished its turn; arm the follow-up window when Active.
    /// Returns true when the window was armed.
    fn on_turn_complete(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        if self.state == ConversationState::Active {
            self.state = ConversationState::AwaitingFollowUp;
            self.follow_up_deadline = Some(now + self.follow_up_window);
            true
        } else {
            false
        }
    }

    fn follow_up_deadline(&self) -> Option<Instant> {
        if self.state == ConversationState::AwaitingFollowUp {
            self.follow_up_deadline
        } else {
            None
        }
    }

    /// Check the follow-up window. Idempotent against the race with a
    /// concurrently arriving speech event: once either side wins, the other
    /// is a no-op.
    fn follow_up_expired(&mut self, now: Instant) -> bool {
        match (self.state, self.follow_up_deadline) {
            (ConversationState::AwaitingFollowUp, Some(deadline)) if now >= deadline => {
                self.follow_up_deadline = None;
                true
            }
            _ => false,
        }
    }

    fn idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > self.idle_timeout
    }

    fn shutdown(&mut self) {
        self.state = ConversationState::ShuttingDown;
        self.follow_up_deadline = None;
    }
}

/// The assistant core: listens for the wakeword, runs conversations against
/// the streaming backend, and routes model audio and tool calls.
pub struct Assistant {
    config: Config,
    detector: Option<WakewordDetector>,
    gate: SpeechGate,
    capture: AudioCapture,
    playback: AudioPlayback,
    registry: Arc<ToolRegistry>,
    commands_rx: mpsc::UnboundedReceiver<AssistantCommand>,
    conversation: Conversation,
    activation_cue: Cue,
    deactivation_cue: Cue,
}

impl Assistant {
    pub fn new(mut config: Config) -> Result<Self> {
        let engine = RustpotterEngine::new(&config.wakeword, config.audio.sample_rate)?;
        let detector = WakewordDetector::new(Box::new(engine), config.wakeword.refractory);

        let gate = SpeechGate::new(
            config.audio.sample_rate,
            config.audio.chunk_size,
            config.assistant.vad_threshold,
        )?;

        let capture = AudioCapture::start(AudioCaptureConfig {
            device_name: config.audio.input_device.clone(),
            sample_rate: config.audio.sample_rate,
            chunk_size: config.audio.chunk_size,
            queue_capacity: config.audio.queue_capacity,
        })?;

        let playback = AudioPlayback::start(AudioPlaybackConfig {
            device_name: config.audio.output_device.clone(),
            sample_rate: config.audio.playback_sample_rate,
            ..AudioPlaybackConfig::default()
        })?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut registry = ToolRegistry::new();
        if let Some(calendar_config) = config.calendar.take() {
            let client = Arc::new(calendar::CalendarClient::new(calendar_config));
            calendar::register_calendar_tools(&mut registry, client);
            log::info!("✓ Calendar connected");
        }
        registry.register(Arc::new(EndConversationTool::new(commands_tx)));
        log::info!("✓ {} tool(s) registered", registry.len());

        let rate = config.audio.playback_sample_rate;
        let activation_cue = load_cue(
            &config
                .assistant
                .sounds_dir
                .join(&config.assistant.activation_sound),
            rate,
            880.0,
        );
        let deactivation_cue = load_cue(
            &config
                .assistant
                .sounds_dir
                .join(&config.assistant.deactivation_sound),
            rate,
            440.0,
        );

        let conversation = Conversation::new(
            config.assistant.follow_up_window,
            config.assistant.conversation_timeout,
        );

        Ok(Self {
            config,
            detector: Some(detector),
            gate,
            capture,
            playback,
            registry: Arc::new(registry),
            commands_rx,
            conversation,
            activation_cue,
            deactivation_cue,
        })
    }

    /// Main loop: passive wakeword listening until shutdown. Wakeword engine
    /// failures abort the run instead of silently dropping out of listening.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        log::info!("==================================================");
        log::info!("🤖 {} started", self.config.assistant.name);
        log::info!(
            "   Follow-up window: {}s, timeout: {}s",
            self.config.assistant.follow_up_window.as_secs(),
            self.config.assistant.conversation_timeout.as_secs()
        );
        log::info!("==================================================");

        let Some(detector) = self.detector.take() else {
            return Err(WakewordError::Processing("assistant already ran".to_string()).into());
        };
        let mut wake_rx = spawn_detection(detector, self.capture.subscribe(), shutdown.clone());

        self.conversation.listen();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = wake_rx.recv() => match signal {
                    Some(WakewordSignal::Event(event)) => {
                        if self.conversation.on_wakeword() {
                            log::info!("Activating (confidence: {:.2})", event.confidence);
                            self.run_conversation(&mut wake_rx, &shutdown).await?;
                        } else {
                            log::debug!(
                                "Wakeword ignored in state {}",
                                self.conversation.state()
                            );
                        }
                    }
                    Some(WakewordSignal::Fatal(e)) => return Err(e.into()),
                    None => break,
                }
            }
        }

        self.conversation.shutdown();
        log::info!("Shutting down, draining audio pipelines");
        self.playback.interrupt();
        self.capture.stop();
        self.playback.stop();
        Ok(())
    }

    /// One conversation: open a session, stream audio both ways, dispatch
    /// tool calls, then return to listening. Only wakeword-engine failures
    /// propagate; session-level errors degrade back to listening.
    async fn run_conversation(
        &mut self,
        wake_rx: &mut mpsc::Receiver<WakewordSignal>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        self.playback.play_cue(&self.activation_cue);
        let mut frames = self.capture.subscribe();

        let declarations = self.registry.declarations();
        let mut session = match LiveSession::open(
            &self.config.live,
            &self.config.assistant.system_prompt,
            &declarations,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                log::error!("Failed to open session: {e}");
                self.playback.play_cue(&self.deactivation_cue);
                self.conversation.listen();
                return Ok(());
            }
        };

        self.conversation.activate();
        log::info!("🎙️ Conversation started");

        // Commands left over from a previous conversation must not end this one.
        while self.commands_rx.try_recv().is_ok() {}

        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<ToolCallResult>();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut fatal: Option<crate::error::AssistantError> = None;
        let mut end_reason = EndReason::StreamError;

        loop {
            let follow_up = self.conversation.follow_up_deadline();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    end_reason = EndReason::Shutdown;
                    break;
                }

                signal = wake_rx.recv() => match signal {
                    // No re-trigger mid-conversation.
                    Some(WakewordSignal::Event(_)) => {
                        log::debug!("Wakeword ignored during conversation");
                    }
                    Some(WakewordSignal::Fatal(e)) => {
                        fatal = Some(e.into());
                        break;
                    }
                    None => {
                        end_reason = EndReason::Shutdown;
                        break;
                    }
                },

                result = frames.recv() => match result {
                    Ok(frame) => {
                        if self.gate.is_speech(&frame.samples) {
                            if self.playback.is_active() {
                                log::info!("🗣 Barge-in, interrupting playback");
                                self.playback.interrupt();
                            }
                            if self.conversation.on_speech() {
                                log::info!("Follow-up speech, conversation continues");
                            }
                        }

                        if self.conversation.state() == ConversationState::Active {
                            session.send_audio(&frame.to_pcm_bytes());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Capture overflow during conversation, dropped {n} frame(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        fatal = Some(crate::audio::AudioError::NotRunning.into());
                        break;
                    }
                },

                event = session.next_event() => match event {
                    Some(SessionEvent::Audio(pcm)) => {
                        self.conversation.touch();
                        if let Err(e) = self.playback.enqueue(&pcm) {
                            log::warn!("Dropping model audio: {e}");
                        }
                    }
                    Some(SessionEvent::Text(text)) => {
                        self.conversation.touch();
                        log::debug!("Model text: {text}");
                    }
                    Some(SessionEvent::ToolCall(request)) => {
                        self.conversation.touch();
                        self.registry.dispatch(request, results_tx.clone());
                    }
                    Some(SessionEvent::TurnComplete) => {
                        if self.conversation.on_turn_complete(Instant::now()) {
                            log::info!(
                                "Turn complete, awaiting follow-up for {}s",
                                self.config.assistant.follow_up_window.as_secs()
                            );
                        }
                    }
                    Some(SessionEvent::Error(e)) => {
                        log::error!("Session error: {e}");
                        end_reason = EndReason::StreamError;
                        break;
                    }
                    None => {
                        log::error!("Session event stream ended unexpectedly");
                        end_reason = EndReason::StreamError;
                        break;
                    }
                },

                Some(result) = results_rx.recv() => {
                    if let Err(e) = session.send_tool_result(result).await {
                        log::warn!("Failed to send tool result: {e}");
                    }
                }

                Some(command) = self.commands_rx.recv() => match command {
                    AssistantCommand::EndConversation => {
                        end_reason = EndReason::Requested;
                        break;
                    }
                },

                _ = sleep_until_deadline(follow_up), if follow_up.is_some() => {
                    if self.conversation.follow_up_expired(Instant::now()) {
                        end_reason = EndReason::FollowUpTimeout;
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if self.conversation.idle_expired(Instant::now()) {
                        log::info!(
                            "⏱ No activity for {}s",
                            self.config.assistant.conversation_timeout.as_secs()
                        );
                        end_reason = EndReason::IdleTimeout;
                        break;
                    }
                }
            }
        }

        session.close().await;
        self.playback.interrupt();

        if fatal.is_some() || end_reason == EndReason::StreamError {
            log::error!("🔚 Conversation ended after stream error");
        } else {
            log::info!("🔚 Conversation ended ({end_reason})");
        }
        self.playback.play_cue(&self.deactivation_cue);
        self.conversation.listen();

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs the wakeword detector as its own execution unit: capture frames in,
/// wakeword signals out. The orchestrator decides what a signal means in the
/// current state.
fn spawn_detection(
    mut detector: WakewordDetector,
    mut frames: broadcast::Receiver<AudioFrame>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<WakewordSignal> {
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = frames.recv() => match result {
                    Ok(frame) => match detector.process_frame(&frame.samples) {
                        Ok(Some(event)) => {
                            if tx.send(WakewordSignal::Event(event)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(WakewordSignal::Fatal(e)).await;
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Wakeword pipeline overflow, dropped {n} frame(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        log::debug!("Wakeword detection task exiting");
    });

    rx
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

fn load_cue(path: &Path, sample_rate: u32, fallback_freq: f32) -> Cue {
    match Cue::from_wav(path, sample_rate) {
        Ok(cue) => cue,
        Err(e) => {
            log::warn!("Cue sound unavailable ({e}), using synthesized beep");
            Cue::beep(fallback_freq, 0.15, sample_rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(follow_up_secs: u64, idle_secs: u64) -> Conversation {
        let mut conversation = Conversation::new(
            Duration::from_secs(follow_up_secs),
            Duration::from_secs(idle_secs),
        );
        conversation.listen();
        conversation
    }

    #[test]
    fn test_wakeword_only_activates_from_listening() {
        let mut conv = conversation(5, 30);
        assert!(conv.on_wakeword());
        conv.activate();

        // Active: further wakeword events are ignored, state unchanged.
        assert!(!conv.on_wakeword());
        assert_eq!(conv.state(), ConversationState::Active);

        conv.on_turn_complete(Instant::now());
        assert!(!conv.on_wakeword());
        assert_eq!(conv.state(), ConversationState::AwaitingFollowUp);
    }

    #[test]
    fn test_turn_complete_arms_follow_up_window() {
        let mut conv = conversation(5, 30);
        conv.activate();

        let now = Instant::now();
        assert!(conv.on_turn_complete(now));
        assert_eq!(conv.state(), ConversationState::AwaitingFollowUp);
        assert_eq!(conv.follow_up_deadline(), Some(now + Duration::from_secs(5)));

        // A second turn-complete while already waiting changes nothing.
        assert!(!conv.on_turn_complete(now + Duration::from_secs(1)));
        assert_eq!(conv.follow_up_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_speech_cancels_follow_up_timer() {
        let mut conv = conversation(5, 30);
        conv.activate();

        let now = Instant::now();
        conv.on_turn_complete(now);
        assert!(conv.on_speech());
        assert_eq!(conv.state(), ConversationState::Active);

        // Cancellation and expiry are mutually exclusive: the timer that was
        // cancelled can no longer fire.
        assert!(!conv.follow_up_expired(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_follow_up_expiry_is_idempotent() {
        let mut conv = conversation(5, 30);
        conv.activate();

        let now = Instant::now();
        conv.on_turn_complete(now);
        assert!(!conv.follow_up_expired(now + Duration::from_secs(4)));
        assert!(conv.follow_up_expired(now + Duration::from_secs(5)));
        // Losing side of the race is a no-op.
        assert!(!conv.follow_up_expired(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_speech_in_active_does_not_resume() {
        let mut conv = conversation(5, 30);
        conv.activate();
        assert!(!conv.on_speech());
        assert_eq!(conv.state(), ConversationState::Active);
    }

    #[test]
    fn test_conversation_scenario_walkthrough() {
        // Wakeword at t=0, turn ends at t=2, speech at t=4 (within the 5s
        // window), turn ends at t=6, silence until expiry at t=11.
        let mut conv = conversation(5, 30);
        let t0 = Instant::now();

        assert!(conv.on_wakeword());
        conv.activate();
        assert_eq!(conv.state(), ConversationState::Active);

        conv.on_turn_complete(t0 + Duration::from_secs(2));
        assert_eq!(conv.state(), ConversationState::AwaitingFollowUp);

        assert!(conv.on_speech());
        assert_eq!(conv.state(), ConversationState::Active);

        conv.on_turn_complete(t0 + Duration::from_secs(6));
        assert_eq!(conv.state(), ConversationState::AwaitingFollowUp);

        assert!(!conv.follow_up_expired(t0 + Duration::from_secs(10)));
        assert!(conv.follow_up_expired(t0 + Duration::from_secs(11)));

        conv.listen();
        assert_eq!(conv.state(), ConversationState::Listening);
    }

    #[test]
    fn test_idle_timeout_backstop() {
        let mut conv = conversation(5, 30);
        conv.activate();

        let now = Instant::now();
        assert!(!conv.idle_expired(now + Duration::from_secs(29)));
        assert!(conv.idle_expired(now + Duration::from_secs(31)));

        // Any activity pushes the deadline out.
        conv.touch();
        assert!(!conv.idle_expired(Instant::now() + Duration::from_secs(29)));
    }

    #[test]
    fn test_listen_clears_follow_up_state() {
        let mut conv = conversation(5, 30);
        conv.activate();
        conv.on_turn_complete(Instant::now());

        conv.listen();
        assert_eq!(conv.state(), ConversationState::Listening);
        assert_eq!(conv.follow_up_deadline(), None);
    }

    #[test]
    fn test_shutdown_from_any_state() {
        for activate_first in [false, true] {
            let mut conv = conversation(5, 30);
            if activate_first {
                conv.activate();
            }
            conv.shutdown();
            assert_eq!(conv.state(), ConversationState::ShuttingDown);
        }
    }
}
