//! Fan-out broadcaster: delivers one frame to every viewer of a stream.
//!
//! The caller passes a snapshot of the viewer set; viewers that join
//! mid-broadcast are not included in this delivery, viewers that left are
//! simply absent from the outbound registry and count as failed. Sends to
//! independent viewers are issued concurrently, each bounded by the send
//! timeout, so one slow or dead viewer can neither block the others nor
//! fail the broadcast as a whole.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use relay_core::{ConnectionId, FrameCodec, FrameMetadata, ServerMessage};

use crate::infrastructure::outbound::{Outbound, OutboundRegistry};

/// Result of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Number of viewers the frame was enqueued for successfully.
    pub delivered: usize,
    /// Viewers whose transport was gone or would not accept the frame
    /// within the send timeout; the caller removes these from the stream.
    pub failed: Vec<ConnectionId>,
}

/// Delivers `metadata` + `payload` to every viewer in the snapshot.
///
/// The metadata/payload pair travels as a single queue item per viewer
/// (see [`Outbound::Frame`]), which is what guarantees that metadata
/// always directly precedes its payload on each transport.
pub async fn broadcast_frame(
    outbound: &OutboundRegistry,
    viewers: &[ConnectionId],
    metadata: FrameMetadata,
    codec: FrameCodec,
    payload: Arc<Vec<u8>>,
    send_timeout: Duration,
) -> DeliveryReport {
    let sends = viewers.iter().map(|&viewer_id| {
        let item = Outbound::Frame {
            metadata: ServerMessage::FrameMetadata { metadata, codec },
            payload: Arc::clone(&payload),
        };
        async move { (viewer_id, outbound.send(viewer_id, item, send_timeout).await) }
    });

    let mut report = DeliveryReport::default();
    for (viewer_id, delivered) in join_all(sends).await {
        if delivered {
            report.delivered += 1;
        } else {
            tracing::warn!(%viewer_id, "frame delivery failed; scheduling viewer removal");
            report.failed.push(viewer_id);
        }
    }
    report
}

// ── Tests ─────────────────────────────────────────────────────────────────────
