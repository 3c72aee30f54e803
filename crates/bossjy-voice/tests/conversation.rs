//! End-to-end turn-taking against fake devices and backends.

mod common;

use axum::{extract::State, http::StatusCode, routing::post, Router};
use bossjy_voice::config::RemoteSynthesisConfig;
use bossjy_voice::{
    BackendKind, ErrorKind, GeneratedResponse, PipelineState, RemoteSynthesizer, Role,
    SynthesisBackend, UiEvent, VoiceError,
};
use common::{
    spawn, spawn_with, test_config, Behavior, FakeBackend, FakeMicrophone, RecordingOutput,
    ScriptedGenerator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn is_error(kind: ErrorKind) -> impl Fn(&UiEvent) -> bool {
    move |e| matches!(e, UiEvent::Error { kind: k, .. } if *k == kind)
}

#[tokio::test]
async fn final_utterance_runs_a_full_turn() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::Finish);
    let mut h = spawn(
        ScriptedGenerator::replying(vec![Ok(GeneratedResponse::text("你好！我是豆包"))]),
        vec![local.clone()],
    );
    h.start().await;

    assert!(h.script.final_text("你好"));
    assert_eq!(h.transition_to(PipelineState::Thinking).await, PipelineState::Listening);
    assert_eq!(h.transition_to(PipelineState::Speaking).await, PipelineState::Thinking);
    assert_eq!(h.transition_to(PipelineState::Listening).await, PipelineState::Speaking);

    assert_eq!(local.spoken(), vec!["你好！我是豆包".to_string()]);
    let requests = h.generator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_text, "你好");
    assert!(requests[0].recent_history.is_empty());

    let session = h.handle.session();
    assert_eq!(session.turn_count, 1);
    let roles: Vec<_> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(session.messages[1].content, "你好！我是豆包");
    assert!(session.messages[1].emotion_tag.is_some());
}

#[tokio::test]
async fn partial_during_speech_interrupts_playback() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::Hang);
    let mut h = spawn(
        ScriptedGenerator::replying(vec![Ok(GeneratedResponse::text("我們今天的瓦斯價格是每桶八百元"))]),
        vec![local.clone()],
    );
    h.start().await;

    h.script.final_text("價格多少");
    h.wait_state(PipelineState::Speaking).await;
    assert_eq!(h.handle.active_playbacks(), 1);

    h.script.partial("等");
    assert_eq!(h.transition_to(PipelineState::Listening).await, PipelineState::Speaking);
    assert_eq!(h.handle.active_playbacks(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(local.cancelled(), 1);
    // The rest of the reply is dropped, not retried
    assert_eq!(local.spoken().len(), 1);

    let session = h.handle.session();
    assert_eq!(session.messages.len(), 2);
    assert!(session.messages.iter().all(|m| m.content != "等"));
}

#[tokio::test]
async fn final_during_speech_becomes_the_next_turn() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::Hang);
    let mut h = spawn(ScriptedGenerator::default(), vec![local.clone()]);
    h.start().await;

    h.script.final_text("第一句");
    h.wait_state(PipelineState::Speaking).await;
    h.script.final_text("第二句");

    // Barge-in, then straight into the queued turn
    h.transition_to(PipelineState::Listening).await;
    h.transition_to(PipelineState::Thinking).await;
    h.wait_state(PipelineState::Speaking).await;

    let requests = h.generator.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].user_text, "第二句");
    let history: Vec<_> = requests[1].recent_history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(history, vec!["第一句", "好的"]);
}

#[tokio::test]
async fn final_while_thinking_is_not_merged() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::Finish);
    let generator = ScriptedGenerator::replying(vec![
        Ok(GeneratedResponse::text("一")),
        Ok(GeneratedResponse::text("二")),
    ])
    .with_delay(Duration::from_millis(50));
    let mut h = spawn(generator, vec![local.clone()]);
    h.start().await;

    h.script.final_text("問題一");
    h.wait_state(PipelineState::Thinking).await;
    h.script.final_text("問題二");

    // First reply, settle, then the queued question
    h.transition_to(PipelineState::Speaking).await;
    h.transition_to(PipelineState::Listening).await;
    h.transition_to(PipelineState::Thinking).await;
    h.transition_to(PipelineState::Speaking).await;
    h.transition_to(PipelineState::Listening).await;

    let texts: Vec<_> = h.generator.requests().into_iter().map(|r| r.user_text).collect();
    assert_eq!(texts, vec!["問題一", "問題二"]);
    assert_eq!(local.spoken(), vec!["一", "二"]);
    assert_eq!(h.handle.session().turn_count, 2);
}

#[tokio::test]
async fn remote_http_error_falls_back_to_local() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/audio/speech",
            post(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "tts unavailable")
            }),
        )
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let speaker = Arc::new(RecordingOutput::default());
    let remote: Arc<dyn SynthesisBackend> = Arc::new(
        RemoteSynthesizer::new(
            RemoteSynthesisConfig {
                api_url: format!("http://{}", addr),
                api_key: Some("test-key".to_string()),
                timeout_ms: 2_000,
                ..RemoteSynthesisConfig::default()
            },
            speaker.clone(),
        )
        .unwrap(),
    );
    let local = FakeBackend::new(BackendKind::Local, Behavior::Finish);
    let mut h = spawn(
        ScriptedGenerator::replying(vec![Ok(GeneratedResponse::text("你好！我是豆包"))]),
        vec![remote, local.clone()],
    );
    h.start().await;

    h.script.final_text("你好");
    let events = h
        .collect_until(|e| matches!(e, UiEvent::StateChanged { from: PipelineState::Speaking, .. }))
        .await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(speaker.played.lock().unwrap().is_empty());
    assert_eq!(local.spoken(), vec!["你好！我是豆包".to_string()]);

    let assistant: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            UiEvent::MessageAppended { message } if message.role == Role::Assistant => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "你好！我是豆包");
    assert!(!events.iter().any(|e| matches!(e, UiEvent::Error { .. })));
}

#[tokio::test]
async fn fallback_emits_exactly_one_assistant_message() {
    let remote = FakeBackend::new(BackendKind::Remote, Behavior::Fail);
    let local = FakeBackend::new(BackendKind::Local, Behavior::Finish);
    let mut h = spawn(
        ScriptedGenerator::replying(vec![Ok(GeneratedResponse::text("收到"))]),
        vec![remote.clone(), local.clone()],
    );
    h.start().await;
    h.script.final_text("訂一桶瓦斯");

    let events = h
        .collect_until(|e| matches!(e, UiEvent::StateChanged { from: PipelineState::Speaking, .. }))
        .await;
    let assistant = events
        .iter()
        .filter(|e| matches!(e, UiEvent::MessageAppended { message } if message.role == Role::Assistant))
        .count();
    assert_eq!(assistant, 1);
    assert_eq!(remote.spoken(), vec!["收到"]);
    assert_eq!(local.spoken(), vec!["收到"]);
}

#[tokio::test]
async fn all_backends_failing_surfaces_synthesis_error() {
    let remote = FakeBackend::new(BackendKind::Remote, Behavior::Fail);
    let local = FakeBackend::new(BackendKind::Local, Behavior::Fail);
    let mut h = spawn(ScriptedGenerator::default(), vec![remote, local]);
    h.start().await;

    h.script.final_text("你好");
    let event = h.next_event(is_error(ErrorKind::Synthesis)).await;
    if let UiEvent::Error { message, .. } = event {
        assert!(message.contains("remote") && message.contains("local"), "{}", message);
    }
    h.wait_state(PipelineState::Listening).await;
    assert_eq!(h.handle.active_playbacks(), 0);
}

#[tokio::test]
async fn generator_failure_aborts_only_the_turn() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::Finish);
    let mut h = spawn(
        ScriptedGenerator::replying(vec![Err(VoiceError::ResponseGeneration(
            "upstream 503".to_string(),
        ))]),
        vec![local.clone()],
    );
    h.start().await;

    h.script.final_text("你好");
    h.transition_to(PipelineState::Thinking).await;
    h.next_event(is_error(ErrorKind::ResponseGeneration)).await;
    assert_eq!(h.transition_to(PipelineState::Listening).await, PipelineState::Thinking);

    let session = h.handle.session();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].role, Role::User);
    assert!(local.spoken().is_empty());

    // The next turn works normally
    h.script.final_text("再試一次");
    h.transition_to(PipelineState::Speaking).await;
}

#[tokio::test]
async fn empty_reply_is_a_generation_error() {
    let mut h = spawn(
        ScriptedGenerator::replying(vec![Ok(GeneratedResponse::text("   "))]),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    h.script.final_text("你好");
    h.next_event(is_error(ErrorKind::ResponseGeneration)).await;
    h.wait_state(PipelineState::Listening).await;
    assert_eq!(h.handle.session().messages.len(), 1);
}

#[tokio::test]
async fn recognizer_error_restarts_without_touching_session() {
    let mut h = spawn(
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    assert_eq!(h.script.starts(), 1);

    h.script.fail("network dropped");
    h.next_event(is_error(ErrorKind::Recognition)).await;
    h.script.wait_running().await;
    assert_eq!(h.script.starts(), 2);
    assert_eq!(h.handle.state(), PipelineState::Listening);
    assert!(h.handle.session().messages.is_empty());

    h.script.final_text("聽得到嗎");
    h.transition_to(PipelineState::Thinking).await;
}

#[tokio::test]
async fn missing_microphone_stays_idle() {
    let mic = Arc::new(FakeMicrophone::default());
    mic.unavailable.store(true, Ordering::SeqCst);
    let mut h = spawn_with(
        test_config(),
        mic.clone(),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );

    h.handle.start().unwrap();
    h.next_event(is_error(ErrorKind::DeviceUnavailable)).await;
    assert_eq!(h.handle.state(), PipelineState::Idle);
    assert_eq!(h.script.starts(), 0);

    // Retry once the device is back
    mic.unavailable.store(false, Ordering::SeqCst);
    h.start().await;
    assert!(mic.is_open());
}

#[tokio::test]
async fn reset_while_speaking_releases_everything() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::Hang);
    let mut h = spawn(ScriptedGenerator::default(), vec![local.clone()]);
    h.start().await;
    let first_session = h.handle.session().session_id;

    h.script.final_text("你好");
    h.wait_state(PipelineState::Speaking).await;

    assert_ok!(h.handle.reset());
    h.wait_state(PipelineState::Idle).await;
    assert_eq!(h.handle.active_playbacks(), 0);
    h.wait_released().await;
    assert!(!h.script.is_running());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(local.cancelled(), 1);
    let session = h.handle.session();
    assert!(session.messages.is_empty());
    assert_ne!(session.session_id, first_session);
}

#[tokio::test]
async fn reset_from_thinking_and_idle() {
    let generator = ScriptedGenerator::default().with_delay(Duration::from_millis(200));
    let local = FakeBackend::new(BackendKind::Local, Behavior::Finish);
    let mut h = spawn(generator, vec![local.clone()]);

    // Idle: nothing to release
    assert_ok!(h.handle.reset());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.handle.state(), PipelineState::Idle);

    h.start().await;
    h.script.final_text("你好");
    h.wait_state(PipelineState::Thinking).await;
    assert_ok!(h.handle.reset());
    h.wait_state(PipelineState::Idle).await;

    // The abandoned reply never reaches the speaker
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(local.spoken().is_empty());
    assert_eq!(h.handle.state(), PipelineState::Idle);
    h.wait_released().await;
}

#[tokio::test]
async fn stop_keeps_history_and_start_resumes() {
    let mut h = spawn(
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    h.script.final_text("你好");
    h.transition_to(PipelineState::Speaking).await;
    h.transition_to(PipelineState::Listening).await;

    assert_ok!(h.handle.stop());
    h.wait_state(PipelineState::Idle).await;
    h.wait_released().await;
    assert_eq!(h.handle.session().messages.len(), 2);

    h.start().await;
    assert_eq!(h.mic.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn history_window_is_bounded() {
    let mut config = test_config();
    config.history_limit = 4;
    config.settle_delay_ms = 1;
    let mut h = spawn_with(
        config,
        Arc::new(FakeMicrophone::default()),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;

    for i in 0..3 {
        h.script.wait_running().await;
        h.script.final_text(&format!("第{}句", i));
        h.transition_to(PipelineState::Speaking).await;
        h.transition_to(PipelineState::Listening).await;
    }
    let session = h.handle.session();
    assert_eq!(session.turn_count, 3);
    let contents: Vec<_> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["第1句", "好的", "第2句", "好的"]);
}

#[tokio::test]
async fn partials_are_published_but_not_stored() {
    let mut h = spawn(
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    h.script.partial("我想");

    let event = h.next_event(|e| matches!(e, UiEvent::Utterance { .. })).await;
    if let UiEvent::Utterance { utterance } = event {
        assert!(!utterance.is_final);
        assert_eq!(utterance.text, "我想");
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.handle.state(), PipelineState::Listening);
    assert!(h.handle.session().messages.is_empty());
}

#[tokio::test]
async fn shutdown_releases_the_microphone() {
    let mut h = spawn(
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    assert_ok!(h.handle.shutdown());
    h.transition_to(PipelineState::Idle).await;
    h.wait_released().await;
    let err = assert_err!(h.handle.start());
    assert!(matches!(err, VoiceError::ChannelClosed(_)));
}

#[tokio::test]
async fn recognition_stays_muted_for_the_settle_delay() {
    let mut config = test_config();
    config.settle_delay_ms = 300;
    let mut h = spawn_with(
        config,
        Arc::new(FakeMicrophone::default()),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    h.script.final_text("你好");
    h.transition_to(PipelineState::Speaking).await;
    h.transition_to(PipelineState::Listening).await;
    let finished = Instant::now();

    assert!(!h.script.is_running());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!h.script.is_running());
    assert!(!h.script.final_text("回音"));

    h.script.wait_running().await;
    assert!(finished.elapsed() >= Duration::from_millis(250));
    assert_eq!(h.script.starts(), 2);
    assert_eq!(h.handle.state(), PipelineState::Listening);
}

#[tokio::test]
async fn reset_during_settle_cancels_the_restart() {
    let mut config = test_config();
    config.settle_delay_ms = 200;
    let mut h = spawn_with(
        config,
        Arc::new(FakeMicrophone::default()),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.start().await;
    h.script.final_text("你好");
    h.transition_to(PipelineState::Speaking).await;
    h.transition_to(PipelineState::Listening).await;

    assert_ok!(h.handle.reset());
    h.wait_state(PipelineState::Idle).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!h.script.is_running());
    assert_eq!(h.script.starts(), 1);
    assert_eq!(h.handle.state(), PipelineState::Idle);
    h.wait_released().await;
}

#[tokio::test]
async fn late_finish_after_barge_in_is_ignored() {
    let local = FakeBackend::new(BackendKind::Local, Behavior::FinishWhenCancelled);
    let mut h = spawn(ScriptedGenerator::default(), vec![local.clone()]);
    h.start().await;
    h.script.final_text("你好");
    h.transition_to(PipelineState::Speaking).await;

    h.script.partial("等");
    h.transition_to(PipelineState::Listening).await;

    // Well past the settle delay: no settle was started for the cut-off reply
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(local.cancelled(), 1);
    assert_eq!(h.handle.state(), PipelineState::Listening);
    assert!(h.script.is_running());
    assert_eq!(h.script.stops(), 0);
    assert_eq!(h.script.starts(), 1);
    assert_eq!(h.handle.active_playbacks(), 0);
}

#[tokio::test]
async fn refused_recognizer_start_is_retried_after_the_restart_delay() {
    let mut config = test_config();
    config.restart_delay_ms = 200;
    let mut h = spawn_with(
        config,
        Arc::new(FakeMicrophone::default()),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    h.script.refuse_next_starts(1);

    assert_ok!(h.handle.start());
    h.next_event(is_error(ErrorKind::Recognition)).await;
    let refused = Instant::now();
    h.wait_state(PipelineState::Listening).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.script.is_running());
    assert_eq!(h.script.attempts(), 1);

    h.script.wait_running().await;
    assert!(refused.elapsed() >= Duration::from_millis(150));
    assert_eq!(h.script.attempts(), 2);
    assert_eq!(h.handle.state(), PipelineState::Listening);
}

#[tokio::test]
async fn slow_microphone_does_not_block_commands() {
    let mic = Arc::new(FakeMicrophone::default());
    mic.open_delay_ms.store(300, Ordering::SeqCst);
    let h = spawn_with(
        test_config(),
        mic.clone(),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );
    let first_session = h.handle.session().session_id;

    assert_ok!(h.handle.start());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_ok!(h.handle.reset());

    // Handled while the device is still opening
    let mut sessions = h.handle.watch_session();
    tokio::time::timeout(
        Duration::from_millis(100),
        sessions.wait_for(|s| s.session_id != first_session),
    )
    .await
    .expect("reset waited for the microphone")
    .unwrap();
    assert_eq!(mic.opened.load(Ordering::SeqCst), 0);

    // The abandoned open completes and is closed again
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(mic.opened.load(Ordering::SeqCst), 1);
    h.wait_released().await;
    assert_eq!(h.handle.state(), PipelineState::Idle);
    assert_eq!(h.script.starts(), 0);
}

#[tokio::test]
async fn repeated_start_opens_the_microphone_once() {
    let mic = Arc::new(FakeMicrophone::default());
    mic.open_delay_ms.store(100, Ordering::SeqCst);
    let mut h = spawn_with(
        test_config(),
        mic.clone(),
        ScriptedGenerator::default(),
        vec![FakeBackend::new(BackendKind::Local, Behavior::Finish)],
    );

    assert_ok!(h.handle.start());
    assert_ok!(h.handle.start());
    h.transition_to(PipelineState::Listening).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mic.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.script.starts(), 1);
}
