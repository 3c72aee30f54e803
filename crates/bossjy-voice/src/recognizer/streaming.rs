//! VAD-gated recognizer: a [`SpeechDetector`] finds turns, a [`Transcriber`] turns them into text.
//!
//! Two threads per stream. The detection thread reads the capture and tracks
//! turns; transcription runs on a second thread so a slow STT request never
//! holds up reading the microphone.

use super::transcriber::Transcriber;
use super::turn::{TurnEvent, TurnSettings, TurnTracker};
use super::vad::{SpeechDetector, VadDetector};
use super::{RecognitionSender, RecognitionStream, RecognizerEvent, SpeechRecognizer};
use crate::audio::AudioStream;
use crate::config::{CaptureConfig, RecognizerConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::session::Utterance;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interim results are emitted with a fixed low confidence.
const PARTIAL_CONFIDENCE: f32 = 0.5;

/// Builds the detector on the detection thread; WebRTC VAD is not `Send`.
pub type DetectorFactory = Arc<dyn Fn() -> VoiceResult<Box<dyn SpeechDetector>> + Send + Sync>;

pub struct VadRecognizer {
    transcriber: Arc<dyn Transcriber>,
    detector: DetectorFactory,
    recognizer: RecognizerConfig,
    capture: CaptureConfig,
    running: Option<CancellationToken>,
}

impl VadRecognizer {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        recognizer: RecognizerConfig,
        capture: CaptureConfig,
    ) -> Self {
        let (rate, mode, frame_len) = (capture.sample_rate, recognizer.vad_mode, capture.chunk_size);
        let detector: DetectorFactory = Arc::new(move || {
            let vad = VadDetector::new(rate, mode, frame_len)?;
            Ok(Box::new(vad) as Box<dyn SpeechDetector>)
        });
        Self {
            transcriber,
            detector,
            recognizer,
            capture,
            running: None,
        }
    }

    /// Replace the WebRTC VAD with another detector.
    pub fn with_detector<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> VoiceResult<Box<dyn SpeechDetector>> + Send + Sync + 'static,
    {
        self.detector = Arc::new(factory);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl SpeechRecognizer for VadRecognizer {
    fn start(&mut self, audio: AudioStream) -> VoiceResult<RecognitionStream> {
        self.stop();
        let (tx, stream) = RecognitionStream::channel();
        let cancel = CancellationToken::new();
        let (jobs_tx, jobs_rx) = std_mpsc::channel();
        let interim_busy = Arc::new(AtomicBool::new(false));

        let transcription = Transcription {
            transcriber: self.transcriber.clone(),
            sample_rate: self.capture.sample_rate,
            interim_busy: interim_busy.clone(),
            cancel: cancel.clone(),
            tx: tx.clone(),
        };
        std::thread::Builder::new()
            .name("bossjy-transcriber".to_string())
            .spawn(move || transcription.run(jobs_rx))
            .map_err(|e| VoiceError::Recognition(format!("transcriber thread: {}", e)))?;

        let detection = Detection {
            detector: self.detector.clone(),
            recognizer: self.recognizer.clone(),
            capture: self.capture.clone(),
            jobs: jobs_tx,
            interim_busy,
            cancel: cancel.clone(),
            tx,
        };
        if let Err(e) = std::thread::Builder::new()
            .name("bossjy-recognizer".to_string())
            .spawn(move || detection.run(audio))
        {
            cancel.cancel();
            return Err(VoiceError::Recognition(format!("recognizer thread: {}", e)));
        }
        info!("👂 Recognizer listening ({})", self.recognizer.language_tag);
        self.running = Some(cancel);
        Ok(stream)
    }

    fn stop(&mut self) {
        // The transcription thread may be inside an STT call; it notices the
        // cancellation afterwards and drops whatever it produced.
        if let Some(cancel) = self.running.take() {
            cancel.cancel();
            debug!("recognizer stopped");
        }
    }
}

impl Drop for VadRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Job {
    /// A turn opened.
    Onset,
    /// Audio of the open turn so far.
    Interim(Vec<f32>),
    /// The turn closed.
    Final { samples: Vec<f32>, confidence: f32 },
}

fn emit(cancel: &CancellationToken, tx: &RecognitionSender, event: RecognizerEvent) -> bool {
    !cancel.is_cancelled() && tx.send(event).is_ok()
}

/// Report `err` and end the stream.
fn fail(cancel: &CancellationToken, tx: &RecognitionSender, err: VoiceError) {
    warn!("recognizer failed: {}", err);
    emit(cancel, tx, RecognizerEvent::Error(err.to_string()));
    cancel.cancel();
}

struct Detection {
    detector: DetectorFactory,
    recognizer: RecognizerConfig,
    capture: CaptureConfig,
    jobs: std_mpsc::Sender<Job>,
    /// Set while an interim job is queued or being transcribed.
    interim_busy: Arc<AtomicBool>,
    cancel: CancellationToken,
    tx: RecognitionSender,
}

impl Detection {
    fn run(self, mut audio: AudioStream) {
        let mut detector = match (self.detector)() {
            Ok(detector) => detector,
            Err(e) => return fail(&self.cancel, &self.tx, e),
        };
        let sample_rate = self.capture.sample_rate;
        let frame = Duration::from_secs_f64(self.capture.chunk_size as f64 / sample_rate as f64);
        let mut tracker = TurnTracker::new(TurnSettings {
            frame,
            gap: self.recognizer.gap(),
            min_speech: self.recognizer.min_speech(),
            max_turn: self.recognizer.max_turn(),
        });
        let partial_interval = self.recognizer.partial_interval();
        let mut next_partial = partial_interval;

        loop {
            let chunk = match audio.blocking_recv_until(&self.cancel) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                // Audio is missing from the middle of whatever turn was open
                Err(e) => return fail(&self.cancel, &self.tx, e),
            };
            let is_speech = match detector.is_speech(&chunk.samples) {
                Ok(v) => v,
                Err(e) => return fail(&self.cancel, &self.tx, e),
            };
            let job = match tracker.feed(is_speech, &chunk.samples) {
                Some(TurnEvent::Started) => {
                    next_partial = partial_interval;
                    Some(Job::Onset)
                }
                Some(TurnEvent::Committed {
                    samples, confidence, ..
                }) => Some(Job::Final { samples, confidence }),
                Some(TurnEvent::Discarded { .. }) => None,
                None if tracker.in_turn()
                    && !partial_interval.is_zero()
                    && tracker.elapsed() >= next_partial =>
                {
                    next_partial = tracker.elapsed() + partial_interval;
                    // Skip this interim if the previous one is still in flight
                    (!self.interim_busy.swap(true, Ordering::AcqRel))
                        .then(|| Job::Interim(tracker.buffered().to_vec()))
                }
                None => None,
            };
            if let Some(job) = job {
                if self.jobs.send(job).is_err() {
                    break;
                }
            }
        }
        debug!("recognizer detection exited");
    }
}

struct Transcription {
    transcriber: Arc<dyn Transcriber>,
    sample_rate: u32,
    interim_busy: Arc<AtomicBool>,
    cancel: CancellationToken,
    tx: RecognitionSender,
}

impl Transcription {
    fn emit(&self, event: RecognizerEvent) -> bool {
        emit(&self.cancel, &self.tx, event)
    }

    /// Jobs arrive in capture order, so events for one turn never overtake
    /// the final of the turn before it.
    fn run(self, jobs: std_mpsc::Receiver<Job>) {
        let mut last_partial_len = 0usize;
        for job in jobs {
            if self.cancel.is_cancelled() {
                break;
            }
            let event = match job {
                Job::Onset => {
                    last_partial_len = 0;
                    // Early signal that the user is talking, before any text exists
                    Some(Utterance::partial("", 0.0))
                }
                Job::Interim(samples) => {
                    let result = self.transcriber.transcribe(&samples, self.sample_rate);
                    self.interim_busy.store(false, Ordering::Release);
                    match result {
                        // Interim text only ever grows within a turn
                        Ok(text) if !text.is_empty() && text.chars().count() >= last_partial_len => {
                            last_partial_len = text.chars().count();
                            Some(Utterance::partial(text, PARTIAL_CONFIDENCE))
                        }
                        Ok(_) => None,
                        Err(e) => return fail(&self.cancel, &self.tx, e),
                    }
                }
                Job::Final { samples, confidence } => {
                    match self.transcriber.transcribe(&samples, self.sample_rate) {
                        Ok(text) if text.is_empty() => {
                            debug!("turn transcribed to nothing, dropped");
                            None
                        }
                        Ok(text) => Some(Utterance::finished(text, confidence)),
                        Err(e) => return fail(&self.cancel, &self.tx, e),
                    }
                }
            };
            if let Some(utterance) = event {
                if !self.emit(RecognizerEvent::Utterance(utterance)) {
                    break;
                }
            }
        }
        debug!("recognizer transcription exited");
    }
}
