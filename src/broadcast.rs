//! Room fan-out with per-member fault isolation

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SendError;
use crate::protocol::ServerMessage;
use crate::state::registry::RoomRegistry;
use crate::telemetry;
use crate::types::*;

/// A recipient the frame could not be queued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub connection_id: ConnectionId,
    pub error: SendError,
}

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    pub room: RoomId,
    /// Members targeted after applying `exclude_sender`
    pub recipients: usize,
    pub delivered: usize,
    pub failed: Vec<DeliveryFailure>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct BroadcastEngine {
    registry: Arc<RoomRegistry>,
    failures: AtomicU64,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            failures: AtomicU64::new(0),
        }
    }

    /// Deliver `payload` to every member of `room`.
    ///
    /// Works on a membership snapshot, so the registry lock is never held
    /// while queues are touched. A member whose queue is full is closed as a
    /// slow consumer; nothing a single member does stops the pass.
    pub async fn broadcast(
        &self,
        room: &RoomId,
        sender: &ConnectionId,
        payload: Value,
        exclude_sender: bool,
    ) -> BroadcastReport {
        let targets = self.registry.targets(room).await;
        let mut report = BroadcastReport {
            room: room.clone(),
            ..Default::default()
        };
        if targets.is_empty() {
            return report;
        }

        let msg = ServerMessage::broadcast(room.clone(), sender.clone(), payload);
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(room = %room, "Failed to encode broadcast: {}", e);
                return report;
            }
        };

        for conn in targets {
            if exclude_sender && conn.id() == sender {
                continue;
            }
            report.recipients += 1;

            match conn.enqueue(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    let reason = match error {
                        SendError::QueueFull => {
                            tracing::warn!(
                                connection_id = %conn.id(),
                                room = %room,
                                queued = conn.queued(),
                                "Dropping slow consumer"
                            );
                            conn.close(CloseReason::SlowConsumer);
                            "queue_full"
                        }
                        SendError::Closed => "closed",
                        SendError::Encode => "encode",
                    };
                    metrics::counter!(telemetry::BROADCAST_FAILURES_TOTAL, "reason" => reason)
                        .increment(1);
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    report.failed.push(DeliveryFailure {
                        connection_id: conn.id().clone(),
                        error,
                    });
                }
            }
        }

        metrics::counter!(telemetry::BROADCASTS_TOTAL).increment(1);
        tracing::debug!(
            room = %room,
            from = %sender,
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Broadcast"
        );
        report
    }

    /// Failed deliveries since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
