//! Call lifecycle scenarios against in-memory devices and transport.

use super::fakes::{wait_for, FakeBackend, FakeConnector, Harness};
use crate::bridge::{CallError, CallPhase, ConnectionStatus, EndReason};
use crate::call_log::CallOutcome;
use crate::codec::{EncodedChunk, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::live::{ClientMessage, LinkCommand, LinkEndpoint, ServerMessage};
use crate::session::SessionEvent;
use crate::settings::BridgeSettings;
use std::time::Duration;

const FRAME: usize = 4096;

/// Start a call with the tutor and drive it to `Active`.
async fn active_call(harness: &mut Harness) -> LinkEndpoint {
    harness.bridge.start_call("tutor").unwrap();
    let endpoint = harness.next_endpoint().await;
    assert!(endpoint.emit(SessionEvent::Opened));
    wait_for(&harness.bridge, |s| s.phase == CallPhase::Active).await;
    endpoint
}

/// Collect the next `n` audio messages sent to the transport.
async fn sent_audio(endpoint: &mut LinkEndpoint, n: usize) -> Vec<EncodedChunk> {
    let mut chunks = Vec::new();
    while chunks.len() < n {
        let command = tokio::time::timeout(Duration::from_secs(5), endpoint.recv_command())
            .await
            .expect("timed out waiting for audio")
            .expect("link closed");
        if let LinkCommand::Send(message) = command {
            chunks.extend(message.media_chunks().iter().cloned());
        }
    }
    chunks
}

fn reply_of(secs: f64) -> SessionEvent {
    let n = (secs * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
    SessionEvent::Message(ServerMessage::with_audio(EncodedChunk::from_samples(
        &vec![0.2; n],
        PLAYBACK_SAMPLE_RATE,
    )))
}

#[tokio::test]
async fn test_start_call_reaches_active() {
    let mut harness = Harness::new(FakeBackend::default());
    let call_id = harness.bridge.start_call("tutor").unwrap();

    let status = harness.bridge.status();
    assert_eq!(status.phase, CallPhase::Connecting);
    assert_eq!(status.connection, ConnectionStatus::Connecting);
    assert_eq!(status.call_id.as_deref(), Some(call_id.as_str()));
    assert_eq!(status.persona_id.as_deref(), Some("tutor"));

    let endpoint = harness.next_endpoint().await;
    // Microphone is held but silent until the session opens
    assert_eq!(harness.backend.mic.opened(), 1);
    assert_eq!(harness.backend.mic.started(), 0);

    endpoint.emit(SessionEvent::Opened);
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::Active).await;
    assert_eq!(status.connection, ConnectionStatus::Connected);
    assert_eq!(harness.backend.mic.started(), 1);
    assert_eq!(harness.backend.output.opened(), 1);

    let setups = harness.setups.lock().unwrap().clone();
    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0].voice, "Kore");

    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_session_uses_configured_model() {
    let settings = BridgeSettings {
        live_model: "gemini-live-2.5-flash".to_string(),
        ..BridgeSettings::default()
    };
    let mut harness = Harness::with_settings(FakeBackend::default(), settings);
    harness.bridge.start_call("tutor").unwrap();
    let _endpoint = harness.next_endpoint().await;

    let setups = harness.setups.lock().unwrap().clone();
    assert_eq!(setups[0].model, "gemini-live-2.5-flash");
    match setups[0].to_message() {
        ClientMessage::Setup(payload) => assert_eq!(payload.model, "models/gemini-live-2.5-flash"),
        other => panic!("expected setup, got {:?}", other),
    }

    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_end_during_connecting_ignores_late_open() {
    let mut harness = Harness::new(FakeBackend::default());
    harness.bridge.start_call("barista").unwrap();
    let mut endpoint = harness.next_endpoint().await;

    // The open arrives but the call is ended before the bridge sees it
    endpoint.emit(SessionEvent::Opened);
    harness.bridge.end_call();
    assert_eq!(harness.bridge.phase(), CallPhase::NoCall);

    harness.bridge.end_call_and_wait().await;
    endpoint.emit(SessionEvent::Opened);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = harness.bridge.status();
    assert_eq!(status.phase, CallPhase::NoCall);
    assert_eq!(status.last_end_reason, Some(EndReason::Hangup));
    assert!(status.last_error.is_none());

    // Capture never ran, devices and session were released
    assert_eq!(harness.backend.mic.started(), 0);
    assert!(!harness.backend.mic.is_streaming());
    assert_eq!(harness.backend.mic.stopped(), 1);
    assert_eq!(harness.backend.output.closed(), 1);
    assert!(harness.backend.output.played().is_empty());
    assert_eq!(endpoint.try_recv_command(), Some(LinkCommand::Close));

    let log = harness.bridge.call_log();
    assert_eq!(log[0].outcome, CallOutcome::Cancelled);
}

#[tokio::test]
async fn test_end_before_connect_task_runs() {
    let mut harness = Harness::new(FakeBackend::default());
    harness.bridge.start_call("tutor").unwrap();
    harness.bridge.end_call();
    harness.bridge.end_call_and_wait().await;

    assert_eq!(harness.bridge.phase(), CallPhase::NoCall);
    assert_eq!(harness.backend.mic.started(), 0);
    // The connector is never reached once the call is cancelled
    assert!(harness.endpoints.try_recv().is_err());
}

#[tokio::test]
async fn test_end_call_is_idempotent() {
    let mut harness = Harness::new(FakeBackend::default());

    // No call at all
    harness.bridge.end_call();
    harness.bridge.end_call();
    assert_eq!(harness.bridge.status().last_end_reason, None);

    let _endpoint = active_call(&mut harness).await;
    harness.bridge.end_call();
    harness.bridge.end_call();
    harness.bridge.end_call_and_wait().await;
    harness.bridge.end_call_and_wait().await;

    let status = harness.bridge.status();
    assert_eq!(status.phase, CallPhase::NoCall);
    assert_eq!(status.connection, ConnectionStatus::Idle);
    assert_eq!(status.last_end_reason, Some(EndReason::Hangup));
    assert_eq!(harness.backend.mic.stopped(), 1);
    assert_eq!(harness.backend.output.closed(), 1);

    let log = harness.bridge.call_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, CallOutcome::Completed);
}

#[tokio::test]
async fn test_three_silent_frames_are_sent() {
    let mut harness = Harness::new(FakeBackend::default());
    let mut endpoint = active_call(&mut harness).await;

    for _ in 0..3 {
        assert!(harness.backend.mic.push(&[0.0; FRAME]));
    }

    let chunks = sent_audio(&mut endpoint, 3).await;
    assert_eq!(chunks.len(), 3);
    for chunk in &chunks {
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(chunk.sample_rate(), Some(CAPTURE_SAMPLE_RATE));
        let samples = chunk.decode_samples().unwrap();
        assert_eq!(samples.len(), FRAME);
        assert!(samples.iter().all(|s| *s == 0.0));
    }

    wait_for(&harness.bridge, |s| s.chunks_sent == 3).await;
    harness.bridge.end_call_and_wait().await;
    assert_eq!(harness.bridge.call_log()[0].chunks_sent, 3);
}

#[tokio::test]
async fn test_partial_frames_are_regrouped() {
    let mut harness = Harness::new(FakeBackend::default());
    let mut endpoint = active_call(&mut harness).await;

    // Platform callbacks rarely line up with frame boundaries
    harness.backend.mic.push(&[0.1; 1000]);
    harness.backend.mic.push(&[0.1; 3000]);
    assert!(endpoint.try_recv_command().is_none());
    harness.backend.mic.push(&[0.1; 96]);

    let chunks = sent_audio(&mut endpoint, 1).await;
    assert_eq!(chunks[0].decode_samples().unwrap().len(), FRAME);
    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_mute_stops_sending_but_keeps_metering() {
    let mut harness = Harness::new(FakeBackend::default());
    let mut endpoint = active_call(&mut harness).await;

    assert!(harness.bridge.toggle_mute());
    assert!(harness.bridge.status().muted);
    let before = harness.bridge.level_snapshot().seq;
    harness.backend.mic.push(&[0.5; FRAME]);
    let after = harness.bridge.level_snapshot();
    assert_eq!(after.seq, before + 1);
    assert!(after.rms > 0.4);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(endpoint.try_recv_command().is_none());

    assert!(!harness.bridge.toggle_mute());
    harness.backend.mic.push(&[0.25; FRAME]);
    let chunks = sent_audio(&mut endpoint, 1).await;
    assert_eq!(chunks.len(), 1);
    // Capture was never restarted
    assert_eq!(harness.backend.mic.started(), 1);

    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_replies_play_back_to_back() {
    let mut harness = Harness::new(FakeBackend::default());
    let endpoint = active_call(&mut harness).await;

    endpoint.emit(reply_of(0.5));
    endpoint.emit(reply_of(0.5));
    wait_for(&harness.bridge, |s| s.chunks_received == 2).await;

    let played = harness.backend.output.played();
    assert_eq!(played.len(), 2);
    assert_eq!(played[0].1, 12_000);
    assert!((played[1].0 - (played[0].0 + 0.5)).abs() < 1e-9);
    assert!(played[1].0 >= played[0].0 + 0.5 - 1e-9);

    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_non_audio_messages_are_ignored() {
    let mut harness = Harness::new(FakeBackend::default());
    let endpoint = active_call(&mut harness).await;

    let turn_complete =
        ServerMessage::parse(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
    endpoint.emit(SessionEvent::Message(turn_complete));
    endpoint.emit(reply_of(0.1));
    wait_for(&harness.bridge, |s| s.chunks_received == 1).await;

    let status = harness.bridge.status();
    assert_eq!(status.phase, CallPhase::Active);
    assert_eq!(harness.backend.output.played().len(), 1);
    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_playback_failure_keeps_call_alive() {
    let mut harness = Harness::new(FakeBackend::default());
    let endpoint = active_call(&mut harness).await;

    harness.backend.output.set_fail(true);
    endpoint.emit(reply_of(0.2));
    let status = wait_for(&harness.bridge, |s| s.playback_failures == 1).await;
    assert_eq!(status.phase, CallPhase::Active);

    harness.backend.output.set_fail(false);
    endpoint.emit(reply_of(0.2));
    wait_for(&harness.bridge, |s| s.chunks_received == 2).await;
    assert_eq!(harness.backend.output.played().len(), 1);

    harness.bridge.end_call_and_wait().await;
    assert_eq!(harness.bridge.call_log()[0].playback_failures, 1);
}

#[tokio::test]
async fn test_permission_denied_never_reaches_active() {
    let backend = FakeBackend {
        deny_microphone: true,
        ..Default::default()
    };
    let mut harness = Harness::new(backend);
    harness.bridge.start_call("tutor").unwrap();
    // Denial arrives after the optimistic connecting state
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;

    assert!(matches!(status.last_error, Some(CallError::PermissionDenied(_))));
    assert_eq!(status.connection, ConnectionStatus::Error);
    assert_eq!(status.last_end_reason, Some(EndReason::Failed));
    assert_eq!(harness.backend.output.opened(), 0);
    assert!(harness.endpoints.try_recv().is_err());

    harness.bridge.end_call();
    harness.bridge.end_call_and_wait().await;
    let log = harness.bridge.call_log();
    assert_eq!(log[0].outcome, CallOutcome::Failed);
    assert!(log[0].error_message.is_some());
}

#[tokio::test]
async fn test_missing_microphone_is_not_a_denial() {
    let backend = FakeBackend {
        no_microphone: true,
        ..Default::default()
    };
    let harness = Harness::new(backend);
    harness.bridge.start_call("tutor").unwrap();
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    harness.bridge.end_call_and_wait().await;

    assert!(matches!(status.last_error, Some(CallError::NoInputDevice(_))));
    assert_eq!(status.last_end_reason, Some(EndReason::Failed));
}

#[tokio::test]
async fn test_restart_waits_for_previous_release() {
    let backend = FakeBackend {
        mic_release_delay: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let mut harness = Harness::new(backend);
    let _first = active_call(&mut harness).await;

    harness.bridge.end_call();
    harness.bridge.start_call("barista").unwrap();
    let second = harness.next_endpoint().await;
    // The new call only dials out once the old microphone is gone
    assert_eq!(harness.backend.mic.live(), 1);
    second.emit(SessionEvent::Opened);
    wait_for(&harness.bridge, |s| s.phase == CallPhase::Active).await;

    assert_eq!(harness.backend.mic.opened(), 2);
    assert_eq!(harness.backend.mic.max_live(), 1);

    harness.bridge.end_call_and_wait().await;
    assert_eq!(harness.backend.mic.live(), 0);
    assert_eq!(harness.backend.output.closed(), 2);
}

#[tokio::test]
async fn test_end_during_microphone_open_releases_it() {
    let backend = FakeBackend {
        mic_open_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let mut harness = Harness::new(backend);
    harness.bridge.start_call("tutor").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.bridge.end_call();

    // Restart right away while the first open is still blocked
    harness.bridge.start_call("barista").unwrap();
    let endpoint = harness.next_endpoint().await;
    endpoint.emit(SessionEvent::Opened);
    wait_for(&harness.bridge, |s| s.phase == CallPhase::Active).await;

    assert_eq!(harness.backend.mic.opened(), 2);
    assert_eq!(harness.backend.mic.max_live(), 1);
    assert_eq!(harness.backend.mic.started(), 1);
    let setups = harness.setups.lock().unwrap().clone();
    assert_eq!(setups.len(), 1);

    harness.bridge.end_call_and_wait().await;
    assert_eq!(harness.backend.mic.live(), 0);
    assert_eq!(harness.bridge.call_log()[1].outcome, CallOutcome::Cancelled);
}

#[tokio::test]
async fn test_output_unavailable_releases_microphone() {
    let backend = FakeBackend {
        fail_output: true,
        ..Default::default()
    };
    let mut harness = Harness::new(backend);
    harness.bridge.start_call("tutor").unwrap();
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    harness.bridge.end_call_and_wait().await;

    assert!(matches!(status.last_error, Some(CallError::OutputUnavailable(_))));
    assert_eq!(harness.backend.mic.opened(), 1);
    assert_eq!(harness.backend.mic.stopped(), 1);
    assert!(harness.endpoints.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let (connector, endpoints) = FakeConnector::failing();
    let mut harness = Harness::with_connector(FakeBackend::default(), connector, endpoints);
    harness.bridge.start_call("tutor").unwrap();
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    harness.bridge.end_call_and_wait().await;

    assert!(matches!(status.last_error, Some(CallError::ConnectionFailed(_))));
    assert_eq!(status.connection, ConnectionStatus::Error);
    assert_eq!(harness.backend.mic.stopped(), 1);
    assert_eq!(harness.backend.output.closed(), 1);
}

#[tokio::test]
async fn test_remote_hangup_tears_down() {
    let mut harness = Harness::new(FakeBackend::default());
    let endpoint = active_call(&mut harness).await;

    endpoint.emit(SessionEvent::Closed {
        reason: Some("session timeout".to_string()),
    });
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    harness.bridge.end_call_and_wait().await;

    assert_eq!(status.last_end_reason, Some(EndReason::RemoteClosed));
    assert_eq!(status.connection, ConnectionStatus::Idle);
    assert!(status.last_error.is_none());
    assert!(!harness.backend.mic.is_streaming());
    assert_eq!(harness.backend.output.closed(), 1);
    assert_eq!(harness.bridge.call_log()[0].outcome, CallOutcome::RemoteClosed);

    // Samples after teardown go nowhere
    assert!(!harness.backend.mic.push(&[0.0; FRAME]));
}

#[tokio::test]
async fn test_remote_error_is_connection_failure() {
    let mut harness = Harness::new(FakeBackend::default());
    let endpoint = active_call(&mut harness).await;

    endpoint.emit(SessionEvent::Errored("quota exceeded".to_string()));
    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    harness.bridge.end_call_and_wait().await;

    assert_eq!(
        status.last_error,
        Some(CallError::ConnectionFailed("quota exceeded".to_string()))
    );
    assert_eq!(status.connection, ConnectionStatus::Error);
    assert_eq!(harness.backend.mic.stopped(), 1);
}

#[tokio::test]
async fn test_close_before_open_is_connection_failure() {
    let mut harness = Harness::new(FakeBackend::default());
    harness.bridge.start_call("tutor").unwrap();
    let endpoint = harness.next_endpoint().await;
    drop(endpoint);

    let status = wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    assert!(matches!(status.last_error, Some(CallError::ConnectionFailed(_))));
    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_single_call_at_a_time() {
    let mut harness = Harness::new(FakeBackend::default());
    let _endpoint = active_call(&mut harness).await;

    assert_eq!(harness.bridge.start_call("barista"), Err(CallError::CallAlreadyActive));
    assert_eq!(harness.backend.mic.opened(), 1);

    harness.bridge.end_call_and_wait().await;
}

#[tokio::test]
async fn test_unknown_persona_is_rejected() {
    let harness = Harness::new(FakeBackend::default());
    assert!(matches!(
        harness.bridge.start_call("pirate"),
        Err(CallError::NoSuchPersona(_))
    ));
    assert_eq!(harness.bridge.phase(), CallPhase::NoCall);
}

#[tokio::test]
async fn test_new_call_after_failure() {
    let mut harness = Harness::new(FakeBackend::default());
    let endpoint = active_call(&mut harness).await;
    endpoint.emit(SessionEvent::Errored("dropped".to_string()));
    wait_for(&harness.bridge, |s| s.phase == CallPhase::NoCall).await;
    harness.bridge.end_call_and_wait().await;

    let mut endpoint = active_call(&mut harness).await;
    let status = harness.bridge.status();
    assert!(status.last_error.is_none());
    assert_eq!(status.chunks_sent, 0);

    harness.backend.mic.push(&[0.0; FRAME]);
    assert_eq!(sent_audio(&mut endpoint, 1).await.len(), 1);
    harness.bridge.end_call_and_wait().await;

    assert_eq!(harness.bridge.call_log().len(), 2);
}

#[test]
fn test_start_call_needs_runtime() {
    let harness = Harness::new(FakeBackend::default());
    assert!(matches!(harness.bridge.start_call("tutor"), Err(CallError::Runtime(_))));
}

#[test]
fn test_audio_message_shape() {
    let message = ClientMessage::audio(EncodedChunk::from_samples(&[0.0; 4], CAPTURE_SAMPLE_RATE));
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(
        json["realtimeInput"]["mediaChunks"][0]["mimeType"],
        "audio/pcm;rate=16000"
    );
}
