//! Integration tests for the relay protocol handler.
//!
//! These tests drive [`RelayService`] through the same public API the
//! WebSocket session tasks use, with in-memory outbound queues standing in
//! for transports. No sockets are involved, which keeps every scenario
//! fast and deterministic:
//!
//! - a "connection" is `register_connection()` plus the returned queue
//!   receiver,
//! - inbound traffic is `handle_text` / `handle_binary`,
//! - a broken transport is simulated by dropping the queue receiver,
//! - a disconnect is `handle_disconnect`.
//!
//! Capture start/stop commands travel producer-ward through the stream
//! event pump, which runs as a real background task here, exactly as in
//! the server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use relay_core::{
    CaptureCommand, CodecAdapter, ConnectionId, ErrorCode, FrameCodec, PassthroughCompressor,
    ServerMessage, StreamId,
};
use relay_server::application::relay_service::{run_event_pump, RelayService};
use relay_server::domain::config::RelayConfig;
use relay_server::infrastructure::outbound::Outbound;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// Used when asserting that nothing arrives.
const QUIET_TIMEOUT: Duration = Duration::from_millis(200);

/// Builds a service with the event pump running, as `run_server` does.
fn make_service() -> RelayService {
    let (service, events) = RelayService::new(
        Arc::new(RelayConfig::default()),
        CodecAdapter::new(Arc::new(PassthroughCompressor)),
    );
    tokio::spawn(run_event_pump(service.clone(), events));
    service
}

/// Registers a connection and consumes its `welcome` message.
async fn connect(service: &RelayService) -> (ConnectionId, mpsc::Receiver<Outbound>) {
    let (id, mut rx) = service.register_connection().await;
    match recv_message(&mut rx).await {
        ServerMessage::Welcome { client_id } => assert_eq!(client_id, id),
        other => panic!("expected welcome, got {other:?}"),
    }
    (id, rx)
}

/// Receives the next outbound item, unwrapping control messages and frame
/// metadata alike.
async fn recv_message(rx: &mut mpsc::Receiver<Outbound>) -> ServerMessage {
    match timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound queue closed unexpectedly")
    {
        Outbound::Control(message) => message,
        Outbound::Frame { metadata, .. } => metadata,
    }
}

/// Receives the next outbound item whole (for payload assertions).
async fn recv_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for outbound item")
        .expect("outbound queue closed unexpectedly")
}

/// Asserts that nothing arrives on the queue for a short while.
async fn assert_quiet(rx: &mut mpsc::Receiver<Outbound>) {
    if let Ok(item) = timeout(QUIET_TIMEOUT, rx.recv()).await {
        panic!("expected silence, got {item:?}");
    }
}

/// Identifies `id` as a capture client and returns the created stream id.
async fn identify_producer(
    service: &RelayService,
    id: ConnectionId,
    rx: &mut mpsc::Receiver<Outbound>,
) -> StreamId {
    service
        .handle_text(
            id,
            r#"{"type":"identification","client_type":"capture_client","version":"1.0.0"}"#,
        )
        .await;
    match recv_message(rx).await {
        ServerMessage::StreamCreated { stream_id } => stream_id,
        other => panic!("expected stream_created, got {other:?}"),
    }
}

/// Joins `id` to `stream_id` and returns the reported viewer count.
async fn join_stream(
    service: &RelayService,
    id: ConnectionId,
    stream_id: StreamId,
    rx: &mut mpsc::Receiver<Outbound>,
) -> usize {
    service
        .handle_text(
            id,
            &format!(r#"{{"type":"join_stream","stream_id":"{stream_id}"}}"#),
        )
        .await;
    match recv_message(rx).await {
        ServerMessage::JoinedStream {
            stream_id: joined,
            viewer_count,
        } => {
            assert_eq!(joined, stream_id);
            viewer_count
        }
        other => panic!("expected joined_stream, got {other:?}"),
    }
}

/// Sends the metadata/payload pair for one frame from the producer.
async fn send_frame(
    service: &RelayService,
    producer: ConnectionId,
    frame_number: u64,
    width: u32,
    height: u32,
    payload: Vec<u8>,
) {
    service
        .handle_text(
            producer,
            &format!(
                r#"{{"type":"frame_metadata","width":{width},"height":{height},"timestamp":1,"frame_number":{frame_number},"size":{}}}"#,
                payload.len()
            ),
        )
        .await;
    service.handle_binary(producer, payload).await;
}

// ── Single producer invariant ─────────────────────────────────────────────────

/// A connection that already owns an active stream and identifies as a
/// producer again gets `producer_already_streaming`; no second stream is
/// created and the connection stays usable.
#[tokio::test]
async fn test_second_producer_identification_is_rejected() {
    let service = make_service();
    let (producer, mut rx) = connect(&service).await;
    identify_producer(&service, producer, &mut rx).await;

    service
        .handle_text(
            producer,
            r#"{"type":"identification","client_type":"capture_client"}"#,
        )
        .await;

    match recv_message(&mut rx).await {
        ServerMessage::Error { code, .. } => {
            assert_eq!(code, ErrorCode::ProducerAlreadyStreaming);
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(service.stream_count().await, 1);

    // Still connected and serviced.
    service.handle_text(producer, r#"{"type":"heartbeat"}"#).await;
    assert!(matches!(recv_message(&mut rx).await, ServerMessage::Pong { .. }));
}

// ── Fan-out completeness ──────────────────────────────────────────────────────

/// With viewers {A, B, C} where B's transport is broken, a broadcast
/// delivers to A and C, removes B from the viewer set, and reports a
/// delivered count of 2 in the stream counters.
#[tokio::test]
async fn test_broadcast_survives_one_broken_viewer() {
    let service = make_service();
    let (producer, mut producer_rx) = connect(&service).await;
    let stream_id = identify_producer(&service, producer, &mut producer_rx).await;

    let (viewer_a, mut rx_a) = connect(&service).await;
    let (viewer_b, rx_b) = connect(&service).await;
    let (viewer_c, mut rx_c) = connect(&service).await;
    join_stream(&service, viewer_a, stream_id, &mut rx_a).await;
    {
        let mut rx_b = rx_b;
        join_stream(&service, viewer_b, stream_id, &mut rx_b).await;
        // B's transport breaks: its writer (queue receiver) goes away.
        drop(rx_b);
    }
    join_stream(&service, viewer_c, stream_id, &mut rx_c).await;

    // 4x2 BGRA frame: 32 bytes.
    send_frame(&service, producer, 1, 4, 2, vec![7u8; 32]).await;

    for rx in [&mut rx_a, &mut rx_c] {
        match recv_outbound(rx).await {
            Outbound::Frame { metadata, payload } => {
                assert_eq!(payload.len(), 32);
                match metadata {
                    ServerMessage::FrameMetadata { metadata, .. } => {
                        assert_eq!(metadata.frame_number, 1);
                        assert_eq!(metadata.size, 32);
                    }
                    other => panic!("expected frame metadata, got {other:?}"),
                }
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    let mut remaining = service.viewer_ids(stream_id).await;
    remaining.sort();
    let mut expected = vec![viewer_a, viewer_c];
    expected.sort();
    assert_eq!(remaining, expected, "B must be removed from the stream");

    let stats = service.stream_stats(stream_id).await.unwrap();
    assert_eq!(stats.frames_sent, 2, "delivered count must be 2");
    assert_eq!(stats.frames_received, 1);
}

// ── Metadata/payload pairing ──────────────────────────────────────────────────

/// `frame_metadata{frame_number:7}` followed by a payload relays exactly
/// one pair with frame number 7; a payload with no preceding metadata
/// relays nothing.
#[tokio::test]
async fn test_metadata_payload_pairing() {
    let service = make_service();
    let (producer, mut producer_rx) = connect(&service).await;
    let stream_id = identify_producer(&service, producer, &mut producer_rx).await;
    let (viewer, mut viewer_rx) = connect(&service).await;
    join_stream(&service, viewer, stream_id, &mut viewer_rx).await;

    send_frame(&service, producer, 7, 4, 2, vec![1u8; 32]).await;

    match recv_outbound(&mut viewer_rx).await {
        Outbound::Frame { metadata, .. } => match metadata {
            ServerMessage::FrameMetadata { metadata, .. } => {
                assert_eq!(metadata.frame_number, 7);
            }
            other => panic!("expected frame metadata, got {other:?}"),
        },
        other => panic!("expected frame, got {other:?}"),
    }

    // Orphan payload: no pending metadata, so nothing is relayed.
    service.handle_binary(producer, vec![2u8; 32]).await;
    assert_quiet(&mut viewer_rx).await;

    let stats = service.stream_stats(stream_id).await.unwrap();
    assert_eq!(stats.frames_received, 1, "the orphan payload must not count");
    assert_eq!(stats.frames_sent, 1);
}

/// The raw-fallback path: when the buffer does not match the declared
/// geometry the codec adapter fails, and the frame is forwarded unmodified
/// tagged `bgra`.
#[tokio::test]
async fn test_codec_failure_falls_back_to_raw_forwarding() {
    let service = make_service();
    let (producer, mut producer_rx) = connect(&service).await;
    let stream_id = identify_producer(&service, producer, &mut producer_rx).await;
    let (viewer, mut viewer_rx) = connect(&service).await;
    join_stream(&service, viewer, stream_id, &mut viewer_rx).await;

    // Declared 320x240 but only 1000 bytes of payload.
    send_frame(&service, producer, 1, 320, 240, vec![0u8; 1000]).await;

    match recv_outbound(&mut viewer_rx).await {
        Outbound::Frame { metadata, payload } => {
            assert_eq!(payload.len(), 1000);
            match metadata {
                ServerMessage::FrameMetadata { metadata, codec } => {
                    assert_eq!(codec, FrameCodec::Bgra);
                    assert_eq!(metadata.size, 1000);
                }
                other => panic!("expected frame metadata, got {other:?}"),
            }
        }
        other => panic!("expected frame, got {other:?}"),
    }
}

// ── Viewer transition events ──────────────────────────────────────────────────

/// The first viewer joining starts capture (exactly once); further joins
/// do not. The last viewer leaving stops capture.
#[tokio::test]
async fn test_capture_follows_first_and_last_viewer() {
    let service = make_service();
    let (producer, mut producer_rx) = connect(&service).await;
    let stream_id = identify_producer(&service, producer, &mut producer_rx).await;

    let (viewer_a, mut rx_a) = connect(&service).await;
    join_stream(&service, viewer_a, stream_id, &mut rx_a).await;

    // First viewer: start_capture plus the initial config push.
    match recv_message(&mut producer_rx).await {
        ServerMessage::Command { command } => assert_eq!(command, CaptureCommand::StartCapture),
        other => panic!("expected start_capture, got {other:?}"),
    }
    match recv_message(&mut producer_rx).await {
        ServerMessage::ConfigUpdate { fps, quality } => {
            assert_eq!(fps, 30);
            assert_eq!(quality, 75);
        }
        other => panic!("expected config_update, got {other:?}"),
    }

    // Second viewer: no new command.
    let (viewer_b, mut rx_b) = connect(&service).await;
    assert_eq!(join_stream(&service, viewer_b, stream_id, &mut rx_b).await, 2);
    assert_quiet(&mut producer_rx).await;

    // One viewer leaves: still one left, no command.
    service.handle_disconnect(viewer_a).await;
    assert_quiet(&mut producer_rx).await;

    // Last viewer leaves: stop_capture.
    service.handle_disconnect(viewer_b).await;
    match recv_message(&mut producer_rx).await {
        ServerMessage::Command { command } => assert_eq!(command, CaptureCommand::StopCapture),
        other => panic!("expected stop_capture, got {other:?}"),
    }
}

// ── Idempotent teardown ───────────────────────────────────────────────────────

/// Disconnecting a producer twice (simulating a disconnect race) notifies
/// viewers exactly once and leaves the registries empty.
#[tokio::test]
async fn test_producer_disconnect_is_idempotent() {
    let service = make_service();
    let (producer, mut producer_rx) = connect(&service).await;
    let stream_id = identify_producer(&service, producer, &mut producer_rx).await;
    let (viewer, mut viewer_rx) = connect(&service).await;
    join_stream(&service, viewer, stream_id, &mut viewer_rx).await;

    service.handle_disconnect(producer).await;
    service.handle_disconnect(producer).await;

    match recv_message(&mut viewer_rx).await {
        ServerMessage::StreamEnded {
            stream_id: ended,
            reason,
        } => {
            assert_eq!(ended, stream_id);
            assert_eq!(reason, "producer_disconnected");
        }
        other => panic!("expected stream_ended, got {other:?}"),
    }
    // No second notification.
    assert_quiet(&mut viewer_rx).await;

    assert_eq!(service.stream_count().await, 0);
    assert_eq!(service.connection_count().await, 1, "only the viewer remains");
}

/// A viewer joining a stream that does not exist gets `stream_not_found`
/// and no membership anywhere.
#[tokio::test]
async fn test_join_unknown_stream_reports_not_found() {
    let service = make_service();
    let (viewer, mut rx) = connect(&service).await;

    let ghost = uuid::Uuid::new_v4();
    service
        .handle_text(
            viewer,
            &format!(r#"{{"type":"join_stream","stream_id":"{ghost}"}}"#),
        )
        .await;

    match recv_message(&mut rx).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::StreamNotFound),
        other => panic!("expected error, got {other:?}"),
    }
}

// ── End-to-end scenario ───────────────────────────────────────────────────────

/// Full happy path: producer identifies, viewer joins, one frame flows
/// through and the stream counters agree with the delivery.
#[tokio::test]
async fn test_end_to_end_single_frame_relay() {
    let service = make_service();

    // Producer connects and identifies; the relay answers with the stream.
    let (producer, mut producer_rx) = connect(&service).await;
    let stream_id = identify_producer(&service, producer, &mut producer_rx).await;

    // Viewer connects and joins that stream.
    let (viewer, mut viewer_rx) = connect(&service).await;
    let viewer_count = join_stream(&service, viewer, stream_id, &mut viewer_rx).await;
    assert_eq!(viewer_count, 1);

    // Producer pushes one 1000-byte frame declared as 320x240.
    send_frame(&service, producer, 1, 320, 240, vec![9u8; 1000]).await;

    // The viewer receives exactly one metadata/payload pair.
    match recv_outbound(&mut viewer_rx).await {
        Outbound::Frame { metadata, payload } => {
            match metadata {
                ServerMessage::FrameMetadata { metadata, .. } => {
                    assert_eq!(metadata.frame_number, 1);
                    assert_eq!(metadata.size, payload.len() as u64);
                }
                other => panic!("expected frame metadata, got {other:?}"),
            }
            assert_eq!(payload.len(), 1000);
        }
        other => panic!("expected frame, got {other:?}"),
    }
    assert_quiet(&mut viewer_rx).await;

    let stats = service.stream_stats(stream_id).await.unwrap();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.bytes_received, 1000);
    assert_eq!(stats.bytes_sent, 1000);
}
