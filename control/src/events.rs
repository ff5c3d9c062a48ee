use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::{Alert, NodeId, SystemMetrics};

/// Notifications published to whoever listens to the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    NodeStatusChanged {
        node_id: NodeId,
        status: String,
    },
    NodeAlert {
        node_id: NodeId,
        alert: Alert,
    },
    SystemMetricsUpdated {
        node_id: NodeId,
        metrics: SystemMetrics,
        load_score: f64,
    },
    UserSyncCompleted {
        node_id: NodeId,
        count: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: FleetEvent);
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Emitting never blocks; subscribers that fall behind lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: FleetEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            debug!("Dropped fleet event: no subscribers");
        }
    }
}

/// Write every event on the bus to the log until the bus is dropped.
///
/// Alerts go out at warn level, everything else at info. Returns the number
/// of events logged.
pub async fn log_events(mut rx: broadcast::Receiver<FleetEvent>) -> usize {
    let mut logged = 0;
    loop {
        match rx.recv().await {
            Ok(FleetEvent::NodeAlert { node_id, alert }) => {
                warn!(
                    "Node {} alert {:?} ({:?}): {}",
                    node_id, alert.kind, alert.level, alert.message
                );
            }
            Ok(FleetEvent::NodeStatusChanged { node_id, status }) => {
                info!("Node {} status changed to {}", node_id, status);
            }
            Ok(FleetEvent::SystemMetricsUpdated { node_id, load_score, .. }) => {
                info!("Node {} metrics updated, load score {:.1}", node_id, load_score);
            }
            Ok(FleetEvent::UserSyncCompleted { node_id, count }) => {
                info!("Synced {} users to node {}", count, node_id);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event logger fell behind, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
        logged += 1;
    }
}
