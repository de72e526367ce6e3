//! Voice controller — push-to-talk turns from microphone to spoken answer.
//!
//! ```text
//! press()   → [interrupt running turn] → Recorder::start        RECORDING
//! release() → Recorder::stop → Transcriber → cue → Agent         PROCESSING
//!           → response (→ Speaker)                               (SPEAKING)
//!           → READY | ERROR
//! ```
//!
//! Every turn gets a number and a cancellation token. Only the current turn
//! may touch the published status, so a superseded turn's late results are
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use starfleet_core::types::{VoiceEvent, VoiceState, VoiceStatus};
use starfleet_core::{Error, Result};

use crate::agent::Agent;
use crate::config::Settings;
use crate::llm::ChatClient;
use crate::player::AudioPlayer;
use crate::recorder::Recorder;
use crate::stt::Transcriber;
use crate::tools::ToolDispatch;
use crate::tts::{SpeechClient, Speaker};

const EVENT_CAPACITY: usize = 64;

/// Cloneable handle; all clones drive the same controller.
#[derive(Clone)]
pub struct VoiceController {
    inner: Arc<Inner>,
}

struct ActiveTurn {
    turn: u64,
    cancel: CancellationToken,
}

struct Inner {
    recorder: Recorder,
    transcriber: Transcriber,
    agent: Agent,
    player: AudioPlayer,
    speaker: Option<Speaker>,
    status_tx: watch::Sender<VoiceStatus>,
    events_tx: broadcast::Sender<VoiceEvent>,
    active: Mutex<Option<ActiveTurn>>,
    turns: AtomicU64,
}

impl VoiceController {
    pub fn new(
        recorder: Recorder,
        transcriber: Transcriber,
        agent: Agent,
        player: AudioPlayer,
        speaker: Option<Speaker>,
    ) -> Self {
        let (status_tx, _) = watch::channel(VoiceStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                recorder,
                transcriber,
                agent,
                player,
                speaker,
                status_tx,
                events_tx,
                active: Mutex::new(None),
                turns: AtomicU64::new(0),
            }),
        }
    }

    /// Wire up the default microphone, OpenAI clients and audio output.
    pub fn from_settings(settings: &Settings, tools: Arc<dyn ToolDispatch>) -> Result<Self> {
        let model = Arc::new(ChatClient::new(settings.openai.clone())?);
        let agent = Agent::new(model, tools, settings.agent.clone());
        let player = AudioPlayer::new(settings.audio.working_sound.clone());
        let speaker = if settings.audio.speak_responses {
            Some(Speaker::new(
                SpeechClient::new(settings.openai.clone())?,
                player.clone(),
            ))
        } else {
            None
        };
        Ok(Self::new(
            Recorder::new(settings.audio.max_record_secs),
            Transcriber::new(settings.openai.clone())?,
            agent,
            player,
            speaker,
        ))
    }

    pub fn status(&self) -> VoiceStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<VoiceStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn player(&self) -> &AudioPlayer {
        &self.inner.player
    }

    /// Microphone level while recording.
    pub fn level(&self) -> f32 {
        self.inner.recorder.level()
    }

    /// Start recording, interrupting any turn still processing or speaking.
    pub async fn press(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.recorder.is_recording() {
            return Err(Error::Busy);
        }
        inner.interrupt();

        match inner.recorder.start().await {
            Ok(()) => {}
            // cancelled while the microphone was opening
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                error!("failed to start recording: {e}");
                inner.set_error(&e);
                return Err(e);
            }
        }
        inner.status_tx.send_modify(|s| {
            s.state = VoiceState::Recording;
            s.transcript = None;
            s.response = None;
            s.error = None;
        });
        inner.emit(VoiceEvent::State {
            state: VoiceState::Recording,
        });
        Ok(())
    }

    /// Stop recording and process the utterance in the background.
    /// Returns the turn number.
    pub async fn release(&self) -> Result<u64> {
        let inner = &self.inner;
        if !inner.recorder.is_recording() {
            let e = Error::NoRecording;
            inner.set_error(&e);
            return Err(e);
        }

        let (turn, cancel) = inner.begin_turn();
        let samples = match inner.recorder.stop().await {
            Ok(samples) => samples,
            Err(e) => {
                let failed: Result<String> = Err(e);
                inner.finish(turn, &failed);
                return failed.map(|_| turn);
            }
        };

        let task_inner = inner.clone();
        tokio::spawn(async move {
            let result = task_inner.voice_turn(turn, &samples, &cancel).await;
            task_inner.finish(turn, &result);
        });
        Ok(turn)
    }

    /// Run a typed command through the same pipeline. Returns the turn number.
    pub fn submit_text(&self, command: &str) -> Result<u64> {
        let command = command.trim().to_string();
        if command.is_empty() {
            return Err(Error::Model("empty command".into()));
        }
        let inner = &self.inner;
        inner.recorder.discard();
        let (turn, cancel) = inner.begin_turn();
        inner.publish_transcript(turn, &command);

        let task_inner = inner.clone();
        tokio::spawn(async move {
            let result = task_inner.command_turn(turn, &command, &cancel).await;
            task_inner.finish(turn, &result);
        });
        Ok(turn)
    }

    /// Abandon whatever is happening and return to READY.
    pub fn cancel(&self) {
        let inner = &self.inner;
        inner.interrupt();
        inner.recorder.discard();
        inner.status_tx.send_modify(|s| {
            s.state = VoiceState::Ready;
            s.error = None;
        });
        inner.emit(VoiceEvent::State {
            state: VoiceState::Ready,
        });
        info!("cancelled");
    }

    /// Wait until `turn` has finished or been superseded.
    pub async fn wait_turn(&self, turn: u64) -> VoiceStatus {
        let mut rx = self.subscribe_status();
        let done = rx
            .wait_for(|s| s.turn != turn || !s.state.is_busy())
            .await
            .map(|s| s.clone());
        done.unwrap_or_else(|_| self.status())
    }

    /// Stop recording, audio and any running turn. Used on shutdown.
    pub fn shutdown(&self) {
        self.inner.interrupt();
        self.inner.recorder.discard();
    }
}

impl Inner {
    fn emit(&self, event: VoiceEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn is_current(&self, turn: u64) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|a| a.turn == turn)
    }

    /// Cancel the running turn, if any, and silence the player.
    fn interrupt(&self) {
        let previous = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(active) = previous {
            debug!(turn = active.turn, "interrupting turn");
            active.cancel.cancel();
        }
        self.player.stop();
    }

    fn begin_turn(&self) -> (u64, CancellationToken) {
        self.interrupt();
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveTurn {
            turn,
            cancel: cancel.clone(),
        });
        self.status_tx.send_modify(|s| {
            s.state = VoiceState::Processing;
            s.turn = turn;
            s.transcript = None;
            s.response = None;
            s.error = None;
        });
        self.emit(VoiceEvent::State {
            state: VoiceState::Processing,
        });
        (turn, cancel)
    }

    /// Apply `f` to the status only while `turn` is current.
    fn update_turn(&self, turn: u64, f: impl FnOnce(&mut VoiceStatus)) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.as_ref().is_some_and(|a| a.turn == turn) {
            return false;
        }
        self.status_tx.send_modify(f);
        true
    }

    fn publish_transcript(&self, turn: u64, text: &str) {
        if self.update_turn(turn, |s| s.transcript = Some(text.to_string())) {
            info!("Command: {text}");
            self.emit(VoiceEvent::Transcript {
                text: text.to_string(),
            });
        }
    }

    async fn voice_turn(&self, turn: u64, samples: &[i16], cancel: &CancellationToken) -> Result<String> {
        let transcript = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            t = self.transcriber.transcribe_samples(samples) => t?,
        };
        if transcript.text.is_empty() {
            return Err(Error::Transcription("no speech detected, please try again".into()));
        }
        self.publish_transcript(turn, &transcript.text);
        self.command_turn(turn, &transcript.text, cancel).await
    }

    async fn command_turn(&self, turn: u64, command: &str, cancel: &CancellationToken) -> Result<String> {
        self.player.play_cue();

        let report = self
            .agent
            .run_turn(command, cancel.clone(), |event| {
                if self.is_current(turn) {
                    self.emit(event);
                }
            })
            .await?;
        let response = report.response;

        if self.update_turn(turn, |s| s.response = Some(response.clone())) {
            self.emit(VoiceEvent::Response {
                text: response.clone(),
            });
        }

        if let Some(speaker) = &self.speaker {
            if self.update_turn(turn, |s| s.state = VoiceState::Speaking) {
                self.emit(VoiceEvent::State {
                    state: VoiceState::Speaking,
                });
            }
            match speaker.speak(&response, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                // the answer is already on screen
                Err(e) => warn!("could not speak response: {e}"),
            }
        }
        Ok(response)
    }

    fn finish(&self, turn: u64, result: &Result<String>) {
        let current = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.as_ref().is_some_and(|a| a.turn == turn) {
                *active = None;
                true
            } else {
                false
            }
        };
        if !current {
            debug!(turn, "discarding result of superseded turn");
            return;
        }

        match result {
            Ok(_) | Err(Error::Cancelled) => {
                self.status_tx.send_modify(|s| s.state = VoiceState::Ready);
                self.emit(VoiceEvent::State {
                    state: VoiceState::Ready,
                });
            }
            Err(e) => {
                error!(turn, "turn failed: {e}");
                self.set_error(e);
            }
        }
    }

    fn set_error(&self, e: &Error) {
        let message = e.to_string();
        self.status_tx.send_modify(|s| {
            s.state = VoiceState::Error;
            s.error = Some(message.clone());
        });
        self.emit(VoiceEvent::Error { message });
        self.emit(VoiceEvent::State {
            state: VoiceState::Error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, OpenAiConfig};
    use crate::llm::{ChatMessage, ChatModel, ToolDefinition};
    use crate::recorder::SampleSource;
    use async_trait::async_trait;
    use axum::Router;
    use axum::routing::post;
    use serde_json::Value;
    use starfleet_core::types::PlayerState;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Answers "Echo: <command>", "fail" errors, "hang" never returns.
    #[derive(Default)]
    struct EchoModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn complete(&self, messages: &[ChatMessage], _: &[ToolDefinition]) -> Result<ChatMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let command = messages.last().map(|m| m.text().to_string()).unwrap_or_default();
            match command.as_str() {
                "fail" => Err(Error::Model("chat API error (500): boom".into())),
                "hang" => std::future::pending().await,
                _ => Ok(ChatMessage::assistant(format!("Echo: {command}"))),
            }
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatch for NoTools {
        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
        async fn call(&self, name: &str, _: Value) -> Result<String> {
            Err(Error::Tool(format!("unknown tool: {name}")))
        }
    }

    type Mic = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<i16>>>>>;

    fn build(
        transcriber: Transcriber,
        mic: Mic,
        model: Arc<EchoModel>,
        speech: Option<SpeechClient>,
    ) -> VoiceController {
        let recorder = Recorder::with_source(30, move || {
            let (tx, rx) = mpsc::unbounded_channel();
            mic.lock().unwrap().push(tx);
            Ok(Box::new(rx) as Box<dyn SampleSource>)
        });
        let agent = Agent::new(model, Arc::new(NoTools), AgentConfig::default());
        let player = AudioPlayer::new(None);
        let speaker = speech.map(|client| Speaker::new(client, player.clone()));
        VoiceController::new(recorder, transcriber, agent, player, speaker)
    }

    fn controller_with(transcriber: Transcriber, mic: Mic) -> VoiceController {
        build(transcriber, mic, Arc::default(), None)
    }

    /// Serve `app` locally and point an OpenAI config at it.
    async fn mock_openai(app: Router) -> OpenAiConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        OpenAiConfig {
            api_key: Some("sk-test".into()),
            base_url: format!("http://{addr}/v1"),
            ..OpenAiConfig::default()
        }
    }

    fn offline_transcriber() -> Transcriber {
        Transcriber::new(OpenAiConfig {
            api_key: Some("sk-test".into()),
            base_url: "http://127.0.0.1:9".into(),
            ..OpenAiConfig::default()
        })
        .unwrap()
    }

    fn controller() -> VoiceController {
        controller_with(offline_transcriber(), Arc::default())
    }

    async fn until_state(controller: &VoiceController, state: VoiceState) -> VoiceStatus {
        let mut rx = controller.subscribe_status();
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .unwrap()
            .clone();
        status
    }

    #[tokio::test]
    async fn typed_command_reaches_ready_with_response() {
        let controller = controller();
        let mut events = controller.subscribe_events();

        let turn = controller.submit_text("  system status  ").unwrap();
        let status = controller.wait_turn(turn).await;

        assert_eq!(status.state, VoiceState::Ready);
        assert_eq!(status.turn, turn);
        assert_eq!(status.transcript.as_deref(), Some("system status"));
        assert_eq!(status.response.as_deref(), Some("Echo: system status"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                VoiceEvent::State { state: VoiceState::Processing },
                VoiceEvent::Transcript { text: "system status".into() },
                VoiceEvent::Response { text: "Echo: system status".into() },
                VoiceEvent::State { state: VoiceState::Ready },
            ]
        );
    }

    #[tokio::test]
    async fn model_failure_sets_error_state() {
        let controller = controller();
        let turn = controller.submit_text("fail").unwrap();
        let status = controller.wait_turn(turn).await;
        assert_eq!(status.state, VoiceState::Error);
        assert!(status.error.unwrap().contains("boom"));

        // a new command is accepted after an error
        let turn = controller.submit_text("again").unwrap();
        assert_eq!(controller.wait_turn(turn).await.state, VoiceState::Ready);
    }

    #[tokio::test]
    async fn release_without_press_is_an_error() {
        let controller = controller();
        let err = controller.release().await.unwrap_err();
        assert!(matches!(err, Error::NoRecording));
        let status = controller.status();
        assert_eq!(status.state, VoiceState::Error);
        assert_eq!(status.error.as_deref(), Some("no recording in progress"));
    }

    #[tokio::test]
    async fn double_press_is_busy() {
        let controller = controller();
        controller.press().await.unwrap();
        assert_eq!(controller.status().state, VoiceState::Recording);
        assert!(matches!(controller.press().await, Err(Error::Busy)));
        controller.cancel();
        assert_eq!(controller.status().state, VoiceState::Ready);
    }

    #[tokio::test]
    async fn silent_take_reports_empty_recording() {
        let controller = controller();
        controller.press().await.unwrap();
        let err = controller.release().await.unwrap_err();
        assert!(matches!(err, Error::EmptyRecording));
        assert_eq!(controller.status().state, VoiceState::Error);
    }

    #[tokio::test]
    async fn cancel_abandons_a_hung_turn() {
        let controller = controller();
        let turn = controller.submit_text("hang").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.status().state, VoiceState::Processing);

        controller.cancel();
        let status = controller.wait_turn(turn).await;
        assert_eq!(status.state, VoiceState::Ready);
        assert!(status.response.is_none());
    }

    #[tokio::test]
    async fn press_interrupts_processing_turn() {
        let controller = controller();
        let turn = controller.submit_text("hang").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.press().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = controller.status();
        // the cancelled turn must not overwrite the new recording state
        assert_eq!(status.state, VoiceState::Recording);
        assert_eq!(status.turn, turn);
        controller.cancel();
    }

    #[tokio::test]
    async fn new_command_supersedes_running_one() {
        let controller = controller();
        let first = controller.submit_text("hang").unwrap();
        let second = controller.submit_text("ping").unwrap();
        assert!(second > first);
        let status = controller.wait_turn(second).await;
        assert_eq!(status.response.as_deref(), Some("Echo: ping"));
        assert_eq!(status.state, VoiceState::Ready);
    }

    #[tokio::test]
    async fn voice_turn_transcribes_then_answers() {
        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|| async { "What is the uptime?\n" }),
        );
        let transcriber = Transcriber::new(mock_openai(app).await).unwrap();

        let mic = Arc::new(Mutex::new(Vec::new()));
        let controller = controller_with(transcriber, mic.clone());
        controller.press().await.unwrap();
        mic.lock().unwrap()[0].send(vec![500; 3200]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let turn = controller.release().await.unwrap();
        let status = controller.wait_turn(turn).await;
        assert_eq!(status.transcript.as_deref(), Some("What is the uptime?"));
        assert_eq!(status.response.as_deref(), Some("Echo: What is the uptime?"));
        assert_eq!(until_state(&controller, VoiceState::Ready).await.turn, turn);
    }

    #[tokio::test]
    async fn blank_transcript_never_reaches_the_model() {
        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|| async { "[BLANK_AUDIO]\n" }),
        );
        let transcriber = Transcriber::new(mock_openai(app).await).unwrap();
        let model = Arc::new(EchoModel::default());
        let mic: Mic = Arc::default();
        let controller = build(transcriber, mic.clone(), model.clone(), None);

        controller.press().await.unwrap();
        mic.lock().unwrap()[0].send(vec![200; 1600]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let turn = controller.release().await.unwrap();
        let status = controller.wait_turn(turn).await;
        assert_eq!(status.state, VoiceState::Error);
        assert!(status.error.unwrap().contains("no speech detected"));
        assert!(status.transcript.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn press_interrupts_a_speaking_turn() {
        let app = Router::new().route(
            "/v1/audio/speech",
            post(|| async { std::future::pending::<Vec<u8>>().await }),
        );
        let speech = SpeechClient::new(mock_openai(app).await).unwrap();
        let controller = build(offline_transcriber(), Arc::default(), Arc::default(), Some(speech));
        let mut events = controller.subscribe_events();

        let turn = controller.submit_text("red alert").unwrap();
        let speaking = until_state(&controller, VoiceState::Speaking).await;
        assert_eq!(speaking.turn, turn);
        assert_eq!(speaking.response.as_deref(), Some("Echo: red alert"));

        controller.press().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the cancelled turn must not report READY over the new recording
        let status = controller.status();
        assert_eq!(status.state, VoiceState::Recording);
        assert!(status.response.is_none());
        assert_eq!(controller.player().state(), PlayerState::Idle);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let VoiceEvent::State { state } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![VoiceState::Processing, VoiceState::Speaking, VoiceState::Recording]
        );
        controller.cancel();
    }

    #[tokio::test]
    async fn spoken_turn_returns_to_ready() {
        let app = Router::new().route("/v1/audio/speech", post(|| async { Vec::<u8>::new() }));
        let speech = SpeechClient::new(mock_openai(app).await).unwrap();
        let controller = build(offline_transcriber(), Arc::default(), Arc::default(), Some(speech));
        let mut events = controller.subscribe_events();

        let turn = controller.submit_text("status").unwrap();
        let status = controller.wait_turn(turn).await;
        assert_eq!(status.state, VoiceState::Ready);
        assert_eq!(status.response.as_deref(), Some("Echo: status"));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let VoiceEvent::State { state } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![VoiceState::Processing, VoiceState::Speaking, VoiceState::Ready]
        );
    }
}
