//! End-to-end session tests against a mock stream server.
//!
//! Each test runs a real `StreamSession` over a localhost WebSocket and
//! checks what reaches the recording sink and the host event channel:
//! - Ordered, serialized appends
//! - Protocol violations and sink failures
//! - Reconnect after the peer drops, and giving up
//! - Autoplay and live stall correction

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use stream_client::actors::{
    SessionEvent, SessionSettings, SessionSnapshot, StreamSession, StreamSessionHandle,
};
use stream_client::config::ReconnectPolicy;
use stream_client::errors::{ProtocolError, SinkError, StreamError};
use stream_client::pipeline::PipelineStateKind;
use stream_client::receiver::WsConnector;
use stream_test_utils::{
    camera, ending_script, live_script, segment_payload, MockStreamServer, RecordingSinkFactory,
    ServerFrame, SimulatedElement, TEST_CODEC, UNSUPPORTED_CODEC,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

fn settings(reconnect: ReconnectPolicy) -> SessionSettings {
    SessionSettings {
        reconnect,
        ..SessionSettings::default()
    }
}

fn spawn_session(
    url: String,
    settings: SessionSettings,
    sinks: &RecordingSinkFactory,
    element: Option<SimulatedElement>,
) -> (
    StreamSessionHandle,
    mpsc::Receiver<SessionEvent>,
    JoinHandle<()>,
) {
    StreamSession::spawn(
        camera("front-door"),
        url,
        settings,
        Arc::new(WsConnector::new(WAIT)),
        Arc::new(sinks.clone()),
        element.map(|e| Box::new(e) as Box<dyn stream_client::playback::MediaElement>),
        CancellationToken::new(),
    )
}

async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

async fn wait_for_snapshot(
    handle: &StreamSessionHandle,
    done: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = handle.get_state().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapshot never matched: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Ordered Streaming
// ============================================================================

#[tokio::test]
async fn test_streams_segments_in_order() {
    let server = MockStreamServer::builder()
        .connection(live_script(TEST_CODEC, 5))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();

    let (handle, mut events, task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    match next_event(&mut events).await {
        SessionEvent::Initialized { codec } => assert_eq!(codec, TEST_CODEC),
        other => panic!("expected Initialized, got {other:?}"),
    }

    let snapshot = wait_for_snapshot(&handle, |s| s.segments_appended == 5).await;
    assert_eq!(snapshot.state, PipelineStateKind::Idle);
    assert!(!snapshot.streaming_started);
    assert_eq!(snapshot.queue_len, 0);
    assert_eq!(snapshot.codec.as_deref(), Some(TEST_CODEC));
    assert!(snapshot.connected);
    assert_eq!(snapshot.segments_received, 5);

    assert_eq!(sinks.sinks_created(), 1);
    assert_eq!(sinks.appended_sequences(0), vec![0, 1, 2, 3, 4]);
    let record = sinks.sinks().pop().unwrap();
    assert_eq!(record.codec, TEST_CODEC);
    assert_eq!(record.camera, camera("front-door"));
    assert_eq!(
        record.appended.first().map(|s| s.payload.clone()),
        Some(segment_payload(0))
    );

    handle.close("tile unmounted".to_string()).await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::Closed { reason } => assert_eq!(reason, "tile unmounted"),
        other => panic!("expected Closed, got {other:?}"),
    }
    task.await.unwrap();

    assert!(server.wait_for_client_closes(1, WAIT).await);
    assert!(sinks.sinks().pop().unwrap().ended);
}

#[tokio::test]
async fn test_appends_are_serialized() {
    let server = MockStreamServer::builder()
        .connection(live_script(TEST_CODEC, 3))
        .build()
        .await;
    let sinks = RecordingSinkFactory::manual();

    let (handle, _events, _task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    // Everything arrives while the first append is still in flight
    let snapshot = wait_for_snapshot(&handle, |s| s.segments_received == 3).await;
    assert_eq!(snapshot.state, PipelineStateKind::Appending);
    assert!(snapshot.streaming_started);
    assert_eq!(snapshot.queue_len, 2);
    assert_eq!(sinks.total_appends(), 1);
    assert_eq!(sinks.in_flight(), 1);

    assert!(sinks.complete_next());
    assert!(sinks.wait_for_appends(2, WAIT).await);
    let snapshot = wait_for_snapshot(&handle, |s| s.segments_appended == 1).await;
    assert_eq!(snapshot.queue_len, 1);
    assert_eq!(sinks.in_flight(), 1);

    assert!(sinks.complete_next());
    assert!(sinks.wait_for_appends(3, WAIT).await);
    assert!(sinks.wait_for_in_flight(1, WAIT).await);
    assert!(sinks.complete_next());

    let snapshot = wait_for_snapshot(&handle, |s| s.segments_appended == 3).await;
    assert_eq!(snapshot.state, PipelineStateKind::Idle);
    assert!(!snapshot.streaming_started);
    assert_eq!(sinks.appended_sequences(0), vec![0, 1, 2]);

    handle.cancel();
}

#[tokio::test]
async fn test_text_frames_are_ignored() {
    let server = MockStreamServer::builder()
        .connection(vec![
            ServerFrame::Init(TEST_CODEC.to_string()),
            ServerFrame::Text("keepalive".to_string()),
            ServerFrame::Segment(segment_payload(0)),
            ServerFrame::Text("keepalive".to_string()),
            ServerFrame::Segment(segment_payload(1)),
        ])
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();

    let (handle, _events, _task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    wait_for_snapshot(&handle, |s| s.segments_appended == 2).await;
    assert_eq!(sinks.appended_sequences(0), vec![0, 1]);

    handle.cancel();
}

#[tokio::test]
async fn test_empty_binary_frames_are_skipped() {
    let server = MockStreamServer::builder()
        .connection(vec![
            ServerFrame::Init(TEST_CODEC.to_string()),
            ServerFrame::Raw(Bytes::new()),
            ServerFrame::Segment(segment_payload(0)),
            ServerFrame::Raw(Bytes::new()),
            ServerFrame::Segment(segment_payload(1)),
        ])
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();

    let (handle, mut events, _task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    let snapshot = wait_for_snapshot(&handle, |s| s.segments_appended == 2).await;
    assert_eq!(snapshot.segments_received, 2);
    assert!(snapshot.connected);
    assert_eq!(sinks.appended_sequences(0), vec![0, 1]);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Initialized { .. }
    ));
    assert!(events.try_recv().is_err());

    handle.cancel();
}

#[tokio::test]
async fn test_close_mid_append_discards_queue() {
    let server = MockStreamServer::builder()
        .connection(live_script(TEST_CODEC, 4))
        .build()
        .await;
    let sinks = RecordingSinkFactory::manual();

    let (handle, mut events, task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    wait_for_snapshot(&handle, |s| s.segments_received == 4).await;
    handle.close("camera removed".to_string()).await.unwrap();

    loop {
        if let SessionEvent::Closed { reason } = next_event(&mut events).await {
            assert_eq!(reason, "camera removed");
            break;
        }
    }
    task.await.unwrap();

    // A late completion for the torn-down sink goes nowhere
    sinks.complete_next();
    assert_eq!(sinks.total_appends(), 1);
    assert!(sinks.sinks().pop().unwrap().ended);
    assert!(server.wait_for_client_closes(1, WAIT).await);
}

// ============================================================================
// Fatal Errors
// ============================================================================

#[tokio::test]
async fn test_segment_before_init_is_fatal() {
    let server = MockStreamServer::builder()
        .connection(vec![ServerFrame::Segment(segment_payload(0))])
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();

    let (_handle, mut events, task) = spawn_session(
        server.url(),
        settings(ReconnectPolicy::Fixed {
            delay: Duration::from_millis(10),
            max_attempts: Some(3),
        }),
        &sinks,
        None,
    );

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    match next_event(&mut events).await {
        SessionEvent::StreamError { error } => {
            assert!(matches!(
                error,
                StreamError::Protocol(ProtocolError::SegmentBeforeInit)
            ));
            assert!(!error.is_retryable());
        }
        other => panic!("expected StreamError, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Closed { .. }
    ));
    task.await.unwrap();

    // Protocol errors are not retried
    assert_eq!(server.connections(), 1);
    assert_eq!(sinks.sinks_created(), 0);
}

#[tokio::test]
async fn test_unsupported_codec_is_fatal() {
    let server = MockStreamServer::builder()
        .connection(live_script(UNSUPPORTED_CODEC, 2))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new().reject_codec(UNSUPPORTED_CODEC);

    let (_handle, mut events, task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    match next_event(&mut events).await {
        SessionEvent::StreamError { error } => {
            assert!(matches!(
                error,
                StreamError::Sink(SinkError::UnsupportedCodec(codec)) if codec == UNSUPPORTED_CODEC
            ));
        }
        other => panic!("expected StreamError, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Closed { .. }
    ));
    task.await.unwrap();
    assert_eq!(sinks.total_appends(), 0);
}

#[tokio::test]
async fn test_append_failure_is_fatal() {
    let server = MockStreamServer::builder()
        .connection(live_script(TEST_CODEC, 4))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new().fail_append_at(2);

    let (_handle, mut events, task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    let error = loop {
        if let SessionEvent::StreamError { error } = next_event(&mut events).await {
            break error;
        }
    };
    assert!(matches!(
        error,
        StreamError::Sink(SinkError::AppendFailed(_))
    ));
    assert_eq!(error.error_code(), 3);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Closed { .. }
    ));
    task.await.unwrap();

    // The failed segment is not retried and nothing after it is appended
    assert_eq!(sinks.appended_sequences(0), vec![0, 1]);
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_reconnect_after_peer_close() {
    let server = MockStreamServer::builder()
        .connection(ending_script(TEST_CODEC, 2))
        .connection(live_script(TEST_CODEC, 3))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();
    let element = SimulatedElement::new();

    let (handle, mut events, _task) = spawn_session(
        server.url(),
        settings(ReconnectPolicy::Fixed {
            delay: Duration::from_millis(20),
            max_attempts: Some(3),
        }),
        &sinks,
        Some(element.clone()),
    );

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Initialized { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::StreamEnded
    ));
    match next_event(&mut events).await {
        SessionEvent::Reconnecting { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(20));
        }
        other => panic!("expected Reconnecting, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Initialized { .. }
    ));

    let deadline = tokio::time::Instant::now() + WAIT;
    while sinks.appended_sequences(1).len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "second sink never filled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let snapshot = handle.get_state().await.unwrap();
    assert_eq!(snapshot.reconnects, 1);

    // The second connection gets a fresh sink and restarts sequence numbers
    assert_eq!(sinks.sinks_created(), 2);
    assert!(sinks.sinks().first().unwrap().ended);
    assert_eq!(sinks.appended_sequences(1), vec![0, 1, 2]);
    let generations: Vec<u64> = sinks.sinks().iter().map(|s| s.generation).collect();
    assert!(generations.first() < generations.last());
    assert_eq!(element.attached(), vec![TEST_CODEC, TEST_CODEC]);

    handle.cancel();
}

#[tokio::test]
async fn test_gives_up_when_endpoint_refuses() {
    // No scripts: every upgrade is refused
    let server = MockStreamServer::builder().build().await;
    let sinks = RecordingSinkFactory::new();

    let (_handle, mut events, task) = spawn_session(
        server.url(),
        settings(ReconnectPolicy::Fixed {
            delay: Duration::from_millis(10),
            max_attempts: Some(2),
        }),
        &sinks,
        None,
    );

    for expected in 1..=2 {
        match next_event(&mut events).await {
            SessionEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, expected),
            other => panic!("expected Reconnecting, got {other:?}"),
        }
    }
    match next_event(&mut events).await {
        SessionEvent::StreamError { error } => {
            assert!(matches!(error, StreamError::Connection(_)));
            assert_eq!(error.host_message(), "Camera stream is unreachable");
        }
        other => panic!("expected StreamError, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Closed { .. }
    ));
    task.await.unwrap();

    assert_eq!(server.connections(), 3);
    assert_eq!(sinks.sinks_created(), 0);
}

#[tokio::test]
async fn test_peer_close_without_reconnect_ends_session() {
    let server = MockStreamServer::builder()
        .connection(ending_script(TEST_CODEC, 1))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();

    let (_handle, mut events, task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        seen.push(event.as_str());
        if let SessionEvent::Closed { reason } = event {
            assert_eq!(reason, "stream ended");
            break;
        }
    }
    task.await.unwrap();

    assert_eq!(seen, vec!["connected", "initialized", "stream_ended", "closed"]);
}

#[tokio::test]
async fn test_raw_init_tag_with_bad_codec_is_protocol_error() {
    let server = MockStreamServer::builder()
        .connection(vec![ServerFrame::Raw(Bytes::from_static(&[0x09, 0xff, 0xfe]))])
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();

    let (_handle, mut events, task) =
        spawn_session(server.url(), settings(ReconnectPolicy::Disabled), &sinks, None);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    match next_event(&mut events).await {
        SessionEvent::StreamError { error } => {
            assert!(matches!(error, StreamError::Decode(_)));
            assert_eq!(error.error_code(), 2);
        }
        other => panic!("expected StreamError, got {other:?}"),
    }
    task.await.unwrap();
}

// ============================================================================
// Playback
// ============================================================================

#[tokio::test]
async fn test_autoplay_and_stall_correction() {
    let server = MockStreamServer::builder()
        .connection(live_script(TEST_CODEC, 2))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();
    let element = SimulatedElement::new();

    let (handle, _events, _task) = spawn_session(
        server.url(),
        settings(ReconnectPolicy::Disabled),
        &sinks,
        Some(element.clone()),
    );

    wait_for_snapshot(&handle, |s| s.segments_appended == 2).await;
    assert_eq!(element.attached(), vec![TEST_CODEC]);
    assert_eq!(element.play_calls(), 1);
    assert!(!element.paused());

    // Position drifted past the buffered end and the element paused
    element.set_position(4.5, Some(4.0));
    element.pause();
    handle.notify_paused().await.unwrap();

    let snapshot = wait_for_snapshot(&handle, |s| s.stalls_corrected == 1).await;
    assert_eq!(snapshot.stalls_corrected, 1);
    let seeks = element.seeks();
    assert_eq!(seeks.len(), 1);
    assert!((seeks.first().copied().unwrap() - 3.9).abs() < 1e-9);
    assert_eq!(element.play_calls(), 2);

    // A pause inside the buffered range is left alone
    element.set_position(3.0, Some(4.0));
    element.pause();
    handle.notify_paused().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let snapshot = handle.get_state().await.unwrap();
    assert_eq!(snapshot.stalls_corrected, 1);
    assert_eq!(element.seeks().len(), 1);

    handle.cancel();
}

#[tokio::test]
async fn test_pause_ignored_outside_live_mode() {
    let server = MockStreamServer::builder()
        .connection(live_script(TEST_CODEC, 1))
        .build()
        .await;
    let sinks = RecordingSinkFactory::new();
    let element = SimulatedElement::new();

    let (handle, _events, _task) = spawn_session(
        server.url(),
        SessionSettings {
            live_mode: false,
            ..settings(ReconnectPolicy::Disabled)
        },
        &sinks,
        Some(element.clone()),
    );

    wait_for_snapshot(&handle, |s| s.segments_appended == 1).await;
    element.set_position(9.0, Some(4.0));
    element.pause();
    handle.notify_paused().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(element.seeks().is_empty());
    assert_eq!(handle.get_state().await.unwrap().stalls_corrected, 0);

    handle.cancel();
}
