//! Scriptable stand-ins for the microphone, recognizer, generator and TTS backends.

#![allow(dead_code)]

use async_trait::async_trait;
use bossjy_voice::audio::{CaptureSink, CaptureStream};
use bossjy_voice::config::{CaptureConfig, OrchestratorConfig};
use bossjy_voice::recognizer::RecognitionSender;
use bossjy_voice::{
    AudioCaptureSource, AudioOutput, AudioStream, BackendKind, ConversationOrchestrator,
    GeneratedResponse, MicrophoneDevice, OrchestratorHandle, PipelineState, PlaybackEnd,
    RecognitionStream, RecognizerEvent, ResponseGenerator, ResponseRequest, SpeechOptions,
    SpeechRecognizer, SpeechSynthesizer, SynthesisBackend, UiEvent, Utterance, VoiceError,
    VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ---------------------------------------------------------------------------
// Microphone

#[derive(Default)]
pub struct FakeMicrophone {
    pub opened: AtomicUsize,
    pub stopped: Arc<AtomicUsize>,
    pub unavailable: AtomicBool,
    /// How long `open` blocks, like a slow audio driver.
    pub open_delay_ms: AtomicU64,
}

struct FakeStream(Arc<AtomicUsize>);

impl CaptureStream for FakeStream {
    fn stop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl MicrophoneDevice for FakeMicrophone {
    fn open(&self, _: &CaptureConfig, sink: CaptureSink) -> VoiceResult<Box<dyn CaptureStream>> {
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable("no input device".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        sink.push(vec![0.0; 480]);
        Ok(Box::new(FakeStream(self.stopped.clone())))
    }
}

impl FakeMicrophone {
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) > self.stopped.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Recognizer

#[derive(Default)]
struct ScriptState {
    sender: Option<RecognitionSender>,
    starts: usize,
    stops: usize,
    /// Calls to `start`, including refused ones.
    attempts: usize,
    /// Refuse this many upcoming starts.
    refuse: usize,
}

/// Test-side control of a [`ScriptedRecognizer`].
#[derive(Clone, Default)]
pub struct RecognizerScript {
    state: Arc<Mutex<ScriptState>>,
}

impl RecognizerScript {
    pub fn recognizer(&self) -> Box<dyn SpeechRecognizer> {
        Box::new(ScriptedRecognizer(self.clone()))
    }

    fn send(&self, event: RecognizerEvent) -> bool {
        let state = self.state.lock().unwrap();
        match &state.sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn partial(&self, text: &str) -> bool {
        self.send(RecognizerEvent::Utterance(Utterance::partial(text, 0.5)))
    }

    pub fn final_text(&self, text: &str) -> bool {
        self.send(RecognizerEvent::Utterance(Utterance::finished(text, 0.9)))
    }

    /// Report an error and end the current stream, like a real recognizer.
    pub fn fail(&self, reason: &str) -> bool {
        let sent = self.send(RecognizerEvent::Error(reason.to_string()));
        self.state.lock().unwrap().sender = None;
        sent
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().sender.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn refuse_next_starts(&self, n: usize) {
        self.state.lock().unwrap().refuse = n;
    }

    pub async fn wait_running(&self) {
        timeout(WAIT, async {
            while !self.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recognizer never started");
    }
}

struct ScriptedRecognizer(RecognizerScript);

impl SpeechRecognizer for ScriptedRecognizer {
    fn start(&mut self, _audio: AudioStream) -> VoiceResult<RecognitionStream> {
        let (tx, stream) = RecognitionStream::channel();
        let mut state = self.0.state.lock().unwrap();
        state.attempts += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(VoiceError::Recognition("recognizer busy".to_string()));
        }
        state.sender = Some(tx);
        state.starts += 1;
        Ok(stream)
    }

    fn stop(&mut self) {
        let mut state = self.0.state.lock().unwrap();
        state.sender = None;
        state.stops += 1;
    }
}

// ---------------------------------------------------------------------------
// Response generator

#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<VoiceResult<GeneratedResponse>>>,
    pub requests: Mutex<Vec<ResponseRequest>>,
    pub delay: Duration,
}

impl ScriptedGenerator {
    pub fn replying(replies: Vec<VoiceResult<GeneratedResponse>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<ResponseRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, request: ResponseRequest) -> VoiceResult<GeneratedResponse> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(GeneratedResponse::text("好的")))
    }
}

// ---------------------------------------------------------------------------
// Synthesis

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Finish,
    /// Keep "playing" until cancelled.
    Hang,
    /// Report `Finished` even when cancelled, like audio that ran out just as
    /// the stop arrived.
    FinishWhenCancelled,
    Fail,
}

pub struct FakeBackend {
    kind: BackendKind,
    behavior: Behavior,
    pub spoken: Mutex<Vec<String>>,
    pub cancelled: AtomicUsize,
}

impl FakeBackend {
    pub fn new(kind: BackendKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior,
            spoken: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn speak(
        &self,
        text: &str,
        _options: &SpeechOptions,
        cancel: &CancellationToken,
    ) -> VoiceResult<PlaybackEnd> {
        self.spoken.lock().unwrap().push(text.to_string());
        match self.behavior {
            Behavior::Finish => Ok(PlaybackEnd::Finished),
            Behavior::Hang => {
                cancel.cancelled().await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(PlaybackEnd::Cancelled)
            }
            Behavior::FinishWhenCancelled => {
                cancel.cancelled().await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(PlaybackEnd::Finished)
            }
            Behavior::Fail => Err(VoiceError::synthesis(self.kind, "scripted failure")),
        }
    }
}

/// Speaker that records what it was asked to play.
#[derive(Default)]
pub struct RecordingOutput {
    pub played: Mutex<Vec<usize>>,
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, audio: Vec<u8>, _cancel: CancellationToken) -> VoiceResult<PlaybackEnd> {
        self.played.lock().unwrap().push(audio.len());
        Ok(PlaybackEnd::Finished)
    }

    fn stop(&self) {}
}

// ---------------------------------------------------------------------------
// Harness

pub struct Harness {
    pub handle: OrchestratorHandle,
    pub events: broadcast::Receiver<UiEvent>,
    pub mic: Arc<FakeMicrophone>,
    pub script: RecognizerScript,
    pub generator: Arc<ScriptedGenerator>,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        settle_delay_ms: 30,
        restart_delay_ms: 30,
        ..OrchestratorConfig::default()
    }
}

/// Spawn an orchestrator wired to fakes. Call `handle.start()` to begin.
pub fn spawn(
    generator: ScriptedGenerator,
    backends: Vec<Arc<dyn SynthesisBackend>>,
) -> Harness {
    spawn_with(test_config(), Arc::new(FakeMicrophone::default()), generator, backends)
}

pub fn spawn_with(
    config: OrchestratorConfig,
    mic: Arc<FakeMicrophone>,
    generator: ScriptedGenerator,
    backends: Vec<Arc<dyn SynthesisBackend>>,
) -> Harness {
    init_tracing();
    let capture = AudioCaptureSource::new(mic.clone(), CaptureConfig::default());
    let script = RecognizerScript::default();
    let generator = Arc::new(generator);
    let (orchestrator, handle) = ConversationOrchestrator::new(
        config,
        capture,
        script.recognizer(),
        generator.clone(),
        SpeechSynthesizer::new(backends),
    )
    .expect("orchestrator");
    let events = handle.subscribe();
    tokio::spawn(orchestrator.run());
    Harness {
        handle,
        events,
        mic,
        script,
        generator,
    }
}

impl Harness {
    /// Start and wait until the recognizer is listening.
    pub async fn start(&mut self) {
        self.handle.start().unwrap();
        self.transition_to(PipelineState::Listening).await;
        self.script.wait_running().await;
    }

    /// Wait until the microphone has been closed.
    pub async fn wait_released(&self) {
        timeout(WAIT, async {
            while self.mic.is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("microphone never released");
    }

    pub async fn wait_state(&self, state: PipelineState) {
        let mut rx = self.handle.watch_state();
        timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
            .expect("orchestrator gone");
    }

    /// Next event matching `pred`, skipping others.
    pub async fn next_event(&mut self, pred: impl Fn(&UiEvent) -> bool) -> UiEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Wait for the transition into `to` and return where it came from.
    pub async fn transition_to(&mut self, to: PipelineState) -> PipelineState {
        match self
            .next_event(|e| matches!(e, UiEvent::StateChanged { to: t, .. } if *t == to))
            .await
        {
            UiEvent::StateChanged { from, .. } => from,
            _ => unreachable!(),
        }
    }

    /// Every event up to and including the first one matching `stop`.
    pub async fn collect_until(&mut self, stop: impl Fn(&UiEvent) -> bool) -> Vec<UiEvent> {
        let mut out = Vec::new();
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event stream closed");
                let done = stop(&event);
                out.push(event);
                if done {
                    return;
                }
            }
        })
        .await
        .expect("timed out collecting events");
        out
    }
}
