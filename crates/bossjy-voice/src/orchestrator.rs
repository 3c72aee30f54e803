//! Conversation Orchestrator - the turn-taking state machine
//!
//! Everything that happens to the pipeline (UI commands, recognizer events,
//! generator replies, playback outcomes, timers) arrives as an [`Input`] on one
//! ordered channel. A single loop consumes it and is the only place that mutates
//! [`PipelineState`] or the [`ConversationSession`]. Slow work (generation,
//! synthesis, timers) runs in spawned tasks that report back through the same
//! channel, tagged with an id so late results from superseded work are dropped.
//! Opening and closing the microphone block, so they run in order on a
//! capture-control thread and the result of an open comes back as an input too.
//!
//! ```text
//!   Idle ──start──▶ Listening ──final──▶ Thinking ──reply──▶ Speaking
//!    ▲                 ▲  ▲                 │                   │
//!    │                 │  └──── error ──────┘                   │
//!    │                 └──── finished (+settle) / barge-in ─────┘
//!    └──── stop / reset (from any state)
//! ```

use crate::audio::{AudioCaptureSource, CaptureHandle};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, VoiceError, VoiceResult};
use crate::generator::{GeneratedResponse, ResponseGenerator, ResponseRequest};
use crate::interruption::InterruptionController;
use crate::playback::{PlaybackHandle, PlaybackSlot};
use crate::recognizer::{RecognizerEvent, SpeechRecognizer};
use crate::session::{ConversationSession, Message, Utterance};
use crate::speech_text::{detect_emotion, Emotion};
use crate::synthesis::{SpeechOptions, SpeechSynthesizer, SynthesisOutcome};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Idle => "idle",
            PipelineState::Listening => "listening",
            PipelineState::Thinking => "thinking",
            PipelineState::Speaking => "speaking",
        })
    }
}

/// Commands accepted at the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    /// Stop listening and speaking; history is kept.
    Stop,
    /// Stop and start a fresh session.
    Reset,
    /// Stop and end the orchestrator loop.
    Shutdown,
}

/// Events published at the UI boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    Utterance {
        utterance: Utterance,
    },
    MessageAppended {
        message: Message,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Read-only copy of the session, republished after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub turn_count: u64,
    pub messages: Vec<Message>,
}

impl SessionSnapshot {
    fn of(session: &ConversationSession) -> Self {
        Self {
            session_id: session.session_id().to_string(),
            turn_count: session.turn_count(),
            messages: session.history(),
        }
    }
}

enum Input {
    Command(Command),
    CaptureReady { attempt: u64, result: VoiceResult<CaptureHandle> },
    Recognizer { generation: u64, event: RecognizerEvent },
    RecognizerClosed { generation: u64 },
    Response { turn: u64, result: VoiceResult<GeneratedResponse> },
    Playback { id: u64, outcome: SynthesisOutcome },
    SettleElapsed { id: u64 },
    RestartRecognizer { id: u64 },
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    inbound: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<UiEvent>,
    state: watch::Receiver<PipelineState>,
    session: watch::Receiver<SessionSnapshot>,
    floor: PlaybackSlot,
}

impl OrchestratorHandle {
    pub fn send(&self, command: Command) -> VoiceResult<()> {
        self.inbound
            .send(Input::Command(command))
            .map_err(|_| VoiceError::ChannelClosed("orchestrator stopped".to_string()))
    }

    pub fn start(&self) -> VoiceResult<()> {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> VoiceResult<()> {
        self.send(Command::Stop)
    }

    pub fn reset(&self) -> VoiceResult<()> {
        self.send(Command::Reset)
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(Command::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.clone()
    }

    /// 0 or 1.
    pub fn active_playbacks(&self) -> usize {
        self.floor.active_count()
    }
}

struct Timer {
    id: u64,
    cancel: CancellationToken,
}

enum CaptureOp {
    Acquire { attempt: u64 },
    Release,
}

/// Owns the capture source. Ops run in the order they were sent, and the
/// device is released once the orchestrator goes away.
fn capture_control(
    mut capture: AudioCaptureSource,
    ops: std_mpsc::Receiver<CaptureOp>,
    inbound: mpsc::UnboundedSender<Input>,
) {
    for op in ops {
        match op {
            CaptureOp::Acquire { attempt } => {
                let result = capture.acquire();
                let _ = inbound.send(Input::CaptureReady { attempt, result });
            }
            CaptureOp::Release => capture.release(),
        }
    }
    capture.release();
    debug!("capture control exited");
}

pub struct ConversationOrchestrator {
    config: OrchestratorConfig,
    capture_ops: std_mpsc::Sender<CaptureOp>,
    /// Attempt id of a microphone open still in flight
    acquiring: Option<u64>,
    capture_handle: Option<CaptureHandle>,
    recognizer: Box<dyn SpeechRecognizer>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: SpeechSynthesizer,

    session: ConversationSession,
    state: watch::Sender<PipelineState>,
    session_tx: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<UiEvent>,
    floor: PlaybackSlot,
    interruption: InterruptionController,

    inbound_tx: mpsc::UnboundedSender<Input>,
    inbound_rx: mpsc::UnboundedReceiver<Input>,

    /// Bumped on every recognizer start/stop; events from older runs are dropped
    generation: u64,
    forwarder: Option<JoinHandle<()>>,
    pending_turn: Option<Timer>,
    speaking: Option<PlaybackHandle>,
    settle: Option<Timer>,
    restart: Option<Timer>,
    next_id: u64,
    /// Finals heard while busy; each starts a later turn of its own
    queued: VecDeque<Utterance>,
}

impl ConversationOrchestrator {
    /// Fails only if the capture-control thread cannot be spawned.
    pub fn new(
        config: OrchestratorConfig,
        capture: AudioCaptureSource,
        recognizer: Box<dyn SpeechRecognizer>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: SpeechSynthesizer,
    ) -> VoiceResult<(Self, OrchestratorHandle)> {
        let session = ConversationSession::new(config.history_limit);
        let (state, state_rx) = watch::channel(PipelineState::Idle);
        let (session_tx, session_rx) = watch::channel(SessionSnapshot::of(&session));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let floor = PlaybackSlot::new();
        let interruption = InterruptionController::new(floor.clone(), state_rx.clone());

        let (capture_ops, ops_rx) = std_mpsc::channel();
        let control_tx = inbound_tx.clone();
        std::thread::Builder::new()
            .name("bossjy-capture-control".to_string())
            .spawn(move || capture_control(capture, ops_rx, control_tx))?;

        let handle = OrchestratorHandle {
            inbound: inbound_tx.clone(),
            events: events.clone(),
            state: state_rx,
            session: session_rx,
            floor: floor.clone(),
        };
        let orchestrator = Self {
            config,
            capture_ops,
            acquiring: None,
            capture_handle: None,
            recognizer,
            generator,
            synthesizer,
            session,
            state,
            session_tx,
            events,
            floor,
            interruption,
            inbound_tx,
            inbound_rx,
            generation: 0,
            forwarder: None,
            pending_turn: None,
            speaking: None,
            settle: None,
            restart: None,
            next_id: 0,
            queued: VecDeque::new(),
        };
        Ok((orchestrator, handle))
    }

    /// Run until a `Shutdown` command. Devices are released on the way out.
    pub async fn run(mut self) {
        info!("🎭 Conversation orchestrator running");
        while let Some(input) = self.inbound_rx.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        self.teardown();
        info!("🛑 Conversation orchestrator stopped");
    }

    fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn set_state(&mut self, to: PipelineState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!("🔄 {} → {}", from, to);
            self.emit(UiEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: UiEvent) {
        // Nobody subscribed is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, err: &VoiceError) {
        error!("{}", err);
        self.emit(UiEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn append(&mut self, message: Message) {
        let appended = self.session.append(message).clone();
        self.session_tx.send_replace(SessionSnapshot::of(&self.session));
        self.emit(UiEvent::MessageAppended { message: appended });
    }

    /// Returns `false` when the loop should end.
    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Start) => self.on_start(),
            Input::Command(Command::Stop) => {
                info!("⏹️ Stop requested");
                self.teardown();
            }
            Input::Command(Command::Reset) => {
                info!("♻️ Reset requested");
                self.teardown();
                self.session = ConversationSession::new(self.config.history_limit);
                self.session_tx.send_replace(SessionSnapshot::of(&self.session));
            }
            Input::Command(Command::Shutdown) => return false,
            Input::CaptureReady { attempt, result } => self.on_capture_ready(attempt, result),
            Input::Recognizer { generation, event } if generation == self.generation => {
                self.on_recognizer_event(event)
            }
            Input::Recognizer { .. } => debug!("dropping event from a stopped recognizer"),
            Input::RecognizerClosed { generation } if generation == self.generation => {
                warn!("recognizer stream ended unexpectedly");
                self.stop_recognizer();
                self.schedule_restart();
            }
            Input::RecognizerClosed { .. } => {}
            Input::Response { turn, result } => self.on_response(turn, result),
            Input::Playback { id, outcome } => self.on_playback(id, outcome),
            Input::SettleElapsed { id } => self.on_settle_elapsed(id),
            Input::RestartRecognizer { id } => self.on_restart(id),
        }
        true
    }

    fn on_start(&mut self) {
        if self.state() != PipelineState::Idle {
            debug!("start ignored in {}", self.state());
            return;
        }
        if self.acquiring.is_some() {
            debug!("start ignored, microphone already opening");
            return;
        }
        let attempt = self.next_id();
        if self.capture_ops.send(CaptureOp::Acquire { attempt }).is_err() {
            self.emit_error(&VoiceError::ChannelClosed("capture control".to_string()));
            return;
        }
        debug!("🎤 Opening microphone (attempt #{})", attempt);
        self.acquiring = Some(attempt);
    }

    fn on_capture_ready(&mut self, attempt: u64, result: VoiceResult<CaptureHandle>) {
        if self.acquiring != Some(attempt) {
            // Stopped while opening; the release queued behind this open closes it
            debug!("dropping microphone from abandoned start #{}", attempt);
            return;
        }
        self.acquiring = None;
        match result {
            Ok(handle) => self.capture_handle = Some(handle),
            Err(e) => {
                // Stay idle; the user can retry once the device is back
                self.emit_error(&e);
                return;
            }
        }
        let started = self.start_recognizer();
        self.set_state(PipelineState::Listening);
        if let Err(e) = started {
            self.emit_error(&e);
            self.schedule_restart();
        }
    }

    fn start_recognizer(&mut self) -> VoiceResult<()> {
        let capture = self
            .capture_handle
            .as_ref()
            .ok_or_else(|| VoiceError::Recognition("no capture to listen to".to_string()))?;
        self.generation += 1;
        let generation = self.generation;
        let mut stream = self
            .recognizer
            .start(capture.subscribe())
            .map_err(|e| match e {
                VoiceError::Recognition(_) | VoiceError::Vad(_) => e,
                other => VoiceError::Recognition(other.to_string()),
            })?;

        let tx = self.inbound_tx.clone();
        let interruption = self.interruption.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                interruption.observe(&event);
                if tx.send(Input::Recognizer { generation, event }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::RecognizerClosed { generation });
        }));
        Ok(())
    }

    fn stop_recognizer(&mut self) {
        self.recognizer.stop();
        self.generation += 1;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    fn schedule_restart(&mut self) {
        let id = self.next_id();
        let cancel = CancellationToken::new();
        spawn_timer(
            self.inbound_tx.clone(),
            self.config.restart_delay(),
            cancel.clone(),
            Input::RestartRecognizer { id },
        );
        if let Some(old) = self.restart.replace(Timer { id, cancel }) {
            old.cancel.cancel();
        }
    }

    fn on_restart(&mut self, id: u64) {
        if self.restart.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        self.restart = None;
        if self.state() == PipelineState::Idle || self.settle.is_some() {
            return;
        }
        info!("🔁 Restarting recognizer");
        if let Err(e) = self.start_recognizer() {
            self.emit_error(&e);
            self.schedule_restart();
        }
    }

    fn on_recognizer_event(&mut self, event: RecognizerEvent) {
        match event {
            RecognizerEvent::Utterance(utterance) => self.on_utterance(utterance),
            RecognizerEvent::Error(reason) => {
                self.emit_error(&VoiceError::Recognition(reason));
                // The session and any turn in flight are left alone
                self.stop_recognizer();
                if let Err(e) = self.start_recognizer() {
                    self.emit_error(&e);
                    self.schedule_restart();
                }
            }
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        self.emit(UiEvent::Utterance {
            utterance: utterance.clone(),
        });
        let is_turn = utterance.is_final && !utterance.text.trim().is_empty();

        match self.state() {
            PipelineState::Speaking => {
                // The controller has normally cancelled already; this covers the race
                if let Some(handle) = self.speaking.take() {
                    handle.cancel();
                    self.floor.release(handle.id());
                }
                self.set_state(PipelineState::Listening);
                if is_turn {
                    self.queued.push_back(utterance);
                }
                self.drain_queue();
            }
            PipelineState::Thinking => {
                if is_turn {
                    debug!("queued \"{}\" for the next turn", utterance.text);
                    self.queued.push_back(utterance);
                }
            }
            PipelineState::Listening => {
                if is_turn {
                    if self.settle.is_some() {
                        self.queued.push_back(utterance);
                    } else {
                        self.begin_turn(utterance.text);
                    }
                }
            }
            PipelineState::Idle => {}
        }
    }

    fn drain_queue(&mut self) {
        if self.state() != PipelineState::Listening || self.settle.is_some() {
            return;
        }
        if let Some(next) = self.queued.pop_front() {
            self.begin_turn(next.text);
        }
    }

    fn begin_turn(&mut self, text: String) {
        let recent_history = self.session.history();
        self.append(Message::user(text.clone()));
        self.set_state(PipelineState::Thinking);

        let turn = self.next_id();
        let cancel = CancellationToken::new();
        let request = ResponseRequest {
            session_id: self.session.session_id().to_string(),
            user_text: text,
            recent_history,
        };
        let generator = self.generator.clone();
        let tx = self.inbound_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = generator.generate(request) => {
                    let _ = tx.send(Input::Response { turn, result });
                }
                _ = token.cancelled() => {}
            }
        });
        if let Some(old) = self.pending_turn.replace(Timer { id: turn, cancel }) {
            old.cancel.cancel();
        }
    }

    fn on_response(&mut self, turn: u64, result: VoiceResult<GeneratedResponse>) {
        if self.pending_turn.as_ref().map(|t| t.id) != Some(turn) {
            debug!("dropping reply for abandoned turn {}", turn);
            return;
        }
        self.pending_turn = None;
        if self.state() != PipelineState::Thinking {
            return;
        }

        match result {
            Ok(r) if !r.assistant_text.trim().is_empty() => self.speak(r),
            Ok(_) => self.abort_turn(VoiceError::ResponseGeneration("empty reply".to_string())),
            Err(e) => self.abort_turn(e),
        }
    }

    fn abort_turn(&mut self, err: VoiceError) {
        self.emit_error(&err);
        self.set_state(PipelineState::Listening);
        self.drain_queue();
    }

    fn speak(&mut self, response: GeneratedResponse) {
        let text = response.assistant_text.trim().to_string();
        let emotion = response
            .emotion_tag
            .as_deref()
            .map(Emotion::from_tag)
            .unwrap_or_else(|| detect_emotion(&text));
        let tag = response
            .emotion_tag
            .unwrap_or_else(|| emotion.as_str().to_string());
        self.append(Message::assistant(text.clone(), Some(tag)));

        let handle = self.floor.begin();
        // Speaking must be visible to the interruption controller before audio starts
        self.set_state(PipelineState::Speaking);

        let id = handle.id();
        let token = handle.token();
        let synthesizer = self.synthesizer.clone();
        let tx = self.inbound_tx.clone();
        let options = SpeechOptions::with_emotion(emotion);
        tokio::spawn(async move {
            let outcome = synthesizer.speak(&text, &options, &token).await;
            let _ = tx.send(Input::Playback { id, outcome });
        });
        self.speaking = Some(handle);
    }

    fn on_playback(&mut self, id: u64, outcome: SynthesisOutcome) {
        if self.speaking.as_ref().map(|h| h.id()) != Some(id) {
            debug!("playback #{} already superseded", id);
            return;
        }
        let Some(handle) = self.speaking.take() else {
            return;
        };
        self.floor.release(id);

        match outcome {
            SynthesisOutcome::Completed { backend, failures } => {
                if !failures.is_empty() {
                    info!("spoke via {} after {} failed backend(s)", backend, failures.len());
                }
                if handle.complete() {
                    self.set_state(PipelineState::Listening);
                    self.begin_settle();
                } else {
                    // Cancelled by barge-in just as the audio ran out
                    self.set_state(PipelineState::Listening);
                    self.drain_queue();
                }
            }
            SynthesisOutcome::Cancelled { .. } => {
                handle.cancel();
                self.set_state(PipelineState::Listening);
                self.drain_queue();
            }
            outcome @ SynthesisOutcome::AllFailed(_) => {
                handle.cancel();
                if let Some(err) = outcome.into_error() {
                    self.emit_error(&err);
                }
                self.set_state(PipelineState::Listening);
                self.drain_queue();
            }
        }
    }

    /// Mute recognition briefly so the tail of our own audio is not heard as the user.
    fn begin_settle(&mut self) {
        self.stop_recognizer();
        let id = self.next_id();
        let cancel = CancellationToken::new();
        spawn_timer(
            self.inbound_tx.clone(),
            self.config.settle_delay(),
            cancel.clone(),
            Input::SettleElapsed { id },
        );
        if let Some(old) = self.settle.replace(Timer { id, cancel }) {
            old.cancel.cancel();
        }
    }

    fn on_settle_elapsed(&mut self, id: u64) {
        if self.settle.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        self.settle = None;
        if self.state() != PipelineState::Listening {
            return;
        }
        debug!("settle delay over, listening again");
        if let Err(e) = self.start_recognizer() {
            self.emit_error(&e);
            self.schedule_restart();
        }
        self.drain_queue();
    }

    /// Cancel everything in flight and release the microphone.
    fn teardown(&mut self) {
        if let Some(handle) = self.speaking.take() {
            handle.cancel();
        }
        self.floor.clear();
        for timer in [self.pending_turn.take(), self.settle.take(), self.restart.take()]
            .into_iter()
            .flatten()
        {
            timer.cancel.cancel();
        }
        self.stop_recognizer();
        self.acquiring = None;
        self.capture_handle = None;
        let _ = self.capture_ops.send(CaptureOp::Release);
        self.queued.clear();
        self.set_state(PipelineState::Idle);
    }
}

fn spawn_timer(
    tx: mpsc::UnboundedSender<Input>,
    delay: Duration,
    cancel: CancellationToken,
    input: Input,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = tx.send(input);
            }
            _ = cancel.cancelled() => {}
        }
    });
}
