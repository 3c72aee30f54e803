//! Bossjy voice loop: microphone → recognizer → chat model → TTS (remote, local fallback).
//!
//! UI events are printed to stdout as JSON lines. Type `start`, `stop`, `reset`
//! or `quit` on stdin to drive the pipeline. Keys come from `.env` or the
//! environment (`GLM_API_KEY`, `TTS_API_KEY`, `STT_API_KEY`).

use bossjy_voice::{
    AudioCaptureSource, ChatCompletionGenerator, Command, ConversationOrchestrator,
    CpalMicrophone, LocalSynthesizer, RemoteSynthesizer, SpeakerOutput, SpeechSynthesizer,
    SynthesisBackend, VadRecognizer, VoiceConfig,
};
use bossjy_voice::recognizer::RemoteTranscriber;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = VoiceConfig::load()?;
    match CpalMicrophone::list_input_devices() {
        Ok(devices) => info!("🎤 Input devices: {:?}", devices),
        Err(e) => warn!("could not enumerate input devices: {}", e),
    }

    let capture = AudioCaptureSource::new(Arc::new(CpalMicrophone::new()), config.capture.clone());
    let transcriber = Arc::new(RemoteTranscriber::new(&config.recognizer));
    let recognizer = VadRecognizer::new(
        transcriber,
        config.recognizer.clone(),
        config.capture.clone(),
    );
    let generator = Arc::new(ChatCompletionGenerator::new(config.generator.clone())?);

    let speaker = Arc::new(SpeakerOutput::new()?);
    let remote: Arc<dyn SynthesisBackend> =
        Arc::new(RemoteSynthesizer::new(config.synthesis.remote.clone(), speaker)?);
    let local: Arc<dyn SynthesisBackend> =
        Arc::new(LocalSynthesizer::new(config.synthesis.local.clone()));
    let synthesizer = SpeechSynthesizer::new(vec![remote, local]);

    let (orchestrator, handle) = ConversationOrchestrator::new(
        config.orchestrator.clone(),
        capture,
        Box::new(recognizer),
        generator,
        synthesizer,
    )?;
    let running = tokio::spawn(orchestrator.run());

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("unprintable event: {}", e),
                },
                Err(RecvError::Lagged(n)) => warn!("UI fell behind, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("🚀 Ready. Commands: start | stop | reset | quit");
    handle.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match line.trim() {
                    "" => continue,
                    "start" => Command::Start,
                    "stop" => Command::Stop,
                    "reset" => Command::Reset,
                    "quit" | "exit" => break,
                    other => {
                        warn!("unknown command: {}", other);
                        continue;
                    }
                };
                handle.send(command)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl+C received");
                break;
            }
        }
    }

    handle.shutdown()?;
    running.await?;
    Ok(())
}
