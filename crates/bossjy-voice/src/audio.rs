//! Audio capture and playback using CPAL and Rodio
//!
//! Neither `cpal::Stream` nor `rodio::OutputStream` is `Send`, so each lives on a
//! dedicated thread and is driven through channels. The rest of the pipeline only
//! sees [`CaptureHandle`], [`AudioStream`] and the [`AudioOutput`] trait.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunks buffered per subscriber before the slowest one starts lagging.
pub(crate) const CHUNK_BACKLOG: usize = 256;

/// Audio chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub timestamp: Instant,
}

/// Root-mean-square level of a chunk, 0.0 for silence.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Write end handed to a capture device. Fans chunks out to every subscriber and
/// publishes the current input level.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    chunks: broadcast::Sender<AudioChunk>,
    level: Arc<watch::Sender<f32>>,
}

impl CaptureSink {
    pub fn push(&self, samples: Vec<f32>) {
        self.level.send_replace(rms(&samples));
        // No receivers just means nobody is listening right now
        let _ = self.chunks.send(AudioChunk {
            samples,
            timestamp: Instant::now(),
        });
    }
}

/// A running capture. Dropping or stopping it releases the device.
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

/// Something that can open the microphone.
pub trait MicrophoneDevice: Send + Sync {
    fn open(&self, config: &CaptureConfig, sink: CaptureSink) -> VoiceResult<Box<dyn CaptureStream>>;
}

/// Default system input device via CPAL.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

struct CpalCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCapture {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(config: &CaptureConfig, sink: CaptureSink) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
    info!(
        "🎤 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    // Surfaces permission / busy-device failures before building the stream
    let default_config = device.default_input_config()?;
    debug!("default input config: {:?}", default_config);

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let chunk_size = config.chunk_size;
    let mut buffer = Vec::with_capacity(chunk_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                buffer.push(sample);
                if buffer.len() >= chunk_size {
                    sink.push(std::mem::replace(&mut buffer, Vec::with_capacity(chunk_size)));
                }
            }
        },
        move |err| warn!("Audio stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

impl MicrophoneDevice for CpalMicrophone {
    fn open(&self, config: &CaptureConfig, sink: CaptureSink) -> VoiceResult<Box<dyn CaptureStream>> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name("bossjy-capture".to_string())
            .spawn(move || match build_input_stream(&config, sink) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Parks until stop() or the handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("capture stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalCapture {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::DeviceUnavailable(
                    "capture thread exited before reporting".to_string(),
                ))
            }
        }
    }
}

/// Read end of a capture. Ends once the capture is released.
pub struct AudioStream {
    rx: broadcast::Receiver<AudioChunk>,
    released: CancellationToken,
}

impl AudioStream {
    pub async fn recv(&mut self) -> VoiceResult<Option<AudioChunk>> {
        self.recv_until(&CancellationToken::new()).await
    }

    /// Next chunk, or `None` when the capture is released or `cancel` fires.
    ///
    /// A subscriber that fell more than the backlog behind gets an error: the
    /// audio it missed is gone, so whatever it was assembling is incomplete.
    pub async fn recv_until(
        &mut self,
        cancel: &CancellationToken,
    ) -> VoiceResult<Option<AudioChunk>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            _ = self.released.cancelled() => Ok(None),
            res = self.rx.recv() => match res {
                Ok(chunk) => Ok(Some(chunk)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("audio subscriber lagged, {} chunks dropped", n);
                    Err(VoiceError::AudioStream(format!(
                        "subscriber fell behind, {} chunks dropped",
                        n
                    )))
                }
                Err(broadcast::error::RecvError::Closed) => Ok(None),
            },
        }
    }

    /// For consumers running on their own thread rather than the runtime.
    pub fn blocking_recv_until(
        &mut self,
        cancel: &CancellationToken,
    ) -> VoiceResult<Option<AudioChunk>> {
        futures::executor::block_on(self.recv_until(cancel))
    }
}

/// Shareable view of an active capture.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    id: u64,
    chunks: broadcast::Sender<AudioChunk>,
    level: watch::Receiver<f32>,
    released: CancellationToken,
}

impl CaptureHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self) -> AudioStream {
        AudioStream {
            rx: self.chunks.subscribe(),
            released: self.released.clone(),
        }
    }

    /// RMS level of the most recent chunk.
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }
}

struct ActiveCapture {
    handle: CaptureHandle,
    stream: Box<dyn CaptureStream>,
}

static NEXT_CAPTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Owns the microphone for the pipeline. At most one capture is open at a time.
pub struct AudioCaptureSource {
    device: Arc<dyn MicrophoneDevice>,
    config: CaptureConfig,
    active: Option<ActiveCapture>,
}

impl AudioCaptureSource {
    pub fn new(device: Arc<dyn MicrophoneDevice>, config: CaptureConfig) -> Self {
        Self {
            device,
            config,
            active: None,
        }
    }

    /// Open the device, or return the handle of the capture already open.
    pub fn acquire(&mut self) -> VoiceResult<CaptureHandle> {
        if let Some(active) = &self.active {
            return Ok(active.handle.clone());
        }
        info!(
            "🎤 Acquiring microphone ({}Hz, {} channel(s))",
            self.config.sample_rate, self.config.channels
        );
        let (chunks, _) = broadcast::channel(CHUNK_BACKLOG);
        let (level_tx, level_rx) = watch::channel(0.0_f32);
        let sink = CaptureSink {
            chunks: chunks.clone(),
            level: Arc::new(level_tx),
        };
        let stream = self.device.open(&self.config, sink)?;
        let handle = CaptureHandle {
            id: NEXT_CAPTURE_ID.fetch_add(1, Ordering::Relaxed),
            chunks,
            level: level_rx,
            released: CancellationToken::new(),
        };
        self.active = Some(ActiveCapture {
            handle: handle.clone(),
            stream,
        });
        info!("✅ Audio capture started");
        Ok(handle)
    }

    /// Close the device. No-op when nothing is open.
    pub fn release(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.handle.released.cancel();
            active.stream.stop();
            info!("⏹️ Audio capture released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn handle(&self) -> Option<CaptureHandle> {
        self.active.as_ref().map(|a| a.handle.clone())
    }
}

impl Drop for AudioCaptureSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// How a playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Finished,
    Cancelled,
}

/// Speaker abstraction used by synthesis backends that produce encoded audio.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play encoded audio (WAV/MP3) until it ends or `cancel` fires.
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> VoiceResult<PlaybackEnd>;

    /// Fall silent immediately.
    fn stop(&self);
}

enum SpeakerCommand {
    Play {
        id: u64,
        bytes: Vec<u8>,
        done: oneshot::Sender<VoiceResult<PlaybackEnd>>,
    },
    /// Stop playback `id`, or whatever is playing when `None`.
    Stop { id: Option<u64> },
}

/// Whether a stop aimed at `target` applies to the playback `playing`.
fn stop_applies(playing: u64, target: Option<u64>) -> bool {
    target.map_or(true, |id| id == playing)
}

/// Default output device via Rodio, owned by a dedicated thread.
pub struct SpeakerOutput {
    commands: std_mpsc::Sender<SpeakerCommand>,
    next_id: AtomicU64,
}

impl SpeakerOutput {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<SpeakerCommand>();
        std::thread::Builder::new()
            .name("bossjy-speaker".to_string())
            .spawn(move || speaker_loop(cmd_rx, ready_tx))?;
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("🔊 Speaker ready for playback");
                Ok(Self {
                    commands: cmd_tx,
                    next_id: AtomicU64::new(0),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Playback("speaker thread exited".to_string())),
        }
    }
}

fn speaker_loop(
    commands: std_mpsc::Receiver<SpeakerCommand>,
    ready: std_mpsc::Sender<VoiceResult<()>>,
) {
    let (_stream, stream_handle) = match rodio::OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(VoiceError::Playback(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut current: Option<(u64, rodio::Sink, oneshot::Sender<VoiceResult<PlaybackEnd>>)> = None;
    loop {
        match commands.recv_timeout(Duration::from_millis(20)) {
            Ok(SpeakerCommand::Play { id, bytes, done }) => {
                if let Some((previous, sink, done)) = current.take() {
                    sink.stop();
                    let _ = done.send(Ok(PlaybackEnd::Cancelled));
                    debug!("playback #{} replaced by #{}", previous, id);
                }
                let sink = match rodio::Sink::try_new(&stream_handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = done.send(Err(VoiceError::Playback(e.to_string())));
                        continue;
                    }
                };
                match rodio::Decoder::new(Cursor::new(bytes)) {
                    Ok(source) => {
                        sink.append(source);
                        current = Some((id, sink, done));
                    }
                    Err(e) => {
                        let _ = done.send(Err(VoiceError::Playback(format!("Decode failed: {}", e))));
                    }
                }
            }
            Ok(SpeakerCommand::Stop { id }) => match current.take() {
                Some((playing, sink, done)) if stop_applies(playing, id) => {
                    sink.stop();
                    let _ = done.send(Ok(PlaybackEnd::Cancelled));
                    info!("⏹️ Speaker stopped (playback #{})", playing);
                }
                other => {
                    if let Some(stale) = id {
                        debug!("ignoring stop for finished playback #{}", stale);
                    }
                    current = other;
                }
            },
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if current.as_ref().is_some_and(|(_, sink, _)| sink.empty()) {
            if let Some((_, _, done)) = current.take() {
                let _ = done.send(Ok(PlaybackEnd::Finished));
            }
        }
    }
}

#[async_trait]
impl AudioOutput for SpeakerOutput {
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> VoiceResult<PlaybackEnd> {
        if audio.is_empty() {
            return Ok(PlaybackEnd::Finished);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(SpeakerCommand::Play {
                id,
                bytes: audio,
                done: done_tx,
            })
            .map_err(|_| VoiceError::ChannelClosed("speaker thread".to_string()))?;

        tokio::select! {
            res = done_rx => res.map_err(|_| VoiceError::ChannelClosed("speaker thread".to_string()))?,
            _ = cancel.cancelled() => {
                let _ = self.commands.send(SpeakerCommand::Stop { id: Some(id) });
                Ok(PlaybackEnd::Cancelled)
            }
        }
    }

    fn stop(&self) {
        let _ = self.commands.send(SpeakerCommand::Stop { id: None });
    }
}
