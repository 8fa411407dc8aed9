// Local fan-out of room events to this process's connections.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use marginalia_common::protocol::ws::{encode_event, PresenceEvent};
use marginalia_common::types::RoomId;
use tracing::{debug, error, warn};

use crate::metrics::RelayMetrics;
use crate::rooms::{Delivery, RoomRegistry};

/// What happened to one event's fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Members whose outbound queue was full.
    pub dropped: usize,
    /// Members that closed after the snapshot was taken.
    pub closed: usize,
    /// Connections belonging to the originating peer.
    pub skipped_origin: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
    metrics: Arc<RelayMetrics>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RoomRegistry>, metrics: Arc<RelayMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Deliver `event` to the room's current members.
    ///
    /// `Joined` and `Annotation` skip every connection of the originating
    /// peer; `Left` reaches everyone still registered. Enqueueing never
    /// waits, so one slow member cannot hold up the rest of the room.
    pub async fn dispatch(&self, room: &RoomId, event: &PresenceEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let members = self.registry.members(room).await;
        if members.is_empty() {
            return report;
        }

        let frame = match encode_event(event) {
            Ok(encoded) => Utf8Bytes::from(encoded),
            Err(error) => {
                error!(room = %room, event_type = event.kind(), error = %error, "failed to encode event for fan-out");
                return report;
            }
        };

        let exclude_origin = event.excludes_origin();
        for member in members {
            if exclude_origin && member.peer() == event.origin() {
                report.skipped_origin += 1;
                continue;
            }

            match member.try_deliver(frame.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::QueueFull => {
                    report.dropped += 1;
                    warn!(
                        room = %room,
                        peer = %member.peer(),
                        connection_id = %member.id(),
                        event_type = event.kind(),
                        "outbound queue full, dropping event"
                    );
                }
                Delivery::Closed => {
                    report.closed += 1;
                    debug!(
                        room = %room,
                        connection_id = %member.id(),
                        "skipping delivery to closed connection"
                    );
                }
            }
        }

        self.metrics.record_delivered(report.delivered as u64);
        self.metrics.record_dropped(report.dropped as u64);
        report
    }
}
