//! Out-of-band pickup tracking.
//!
//! Pickup rows record "a worker took this goal" independently of the
//! dispatch transaction, so a crash mid-handler leaves evidence behind.
//! Dispatch counts them to terminate killer tasks. The writer runs on its
//! own task with its own pool connections, fed through an unbounded queue.

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use goalpost_db::queries::pickups as db;

enum PickupEvent {
    Pickup(Uuid),
    Release(Uuid),
}

/// Handle to the pickup monitor task. Cheap to clone; dropping every
/// clone shuts the task down after it drains the queue.
#[derive(Clone)]
pub struct PickupMonitor {
    tx: mpsc::UnboundedSender<PickupEvent>,
}

impl PickupMonitor {
    /// Spawn the monitor task. The returned `JoinHandle` completes once
    /// every `PickupMonitor` clone has been dropped and the queue drained.
    pub fn spawn(pool: PgPool) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let join = tokio::spawn(async move {
            tracing::debug!("pickup monitor started");
            while let Some(event) = rx.recv().await {
                match event {
                    PickupEvent::Pickup(goal_id) => {
                        if let Err(err) = db::insert_pickup(&pool, goal_id).await {
                            tracing::error!(%goal_id, ?err, "failed to record goal pickup");
                        }
                    }
                    PickupEvent::Release(goal_id) => {
                        if let Err(err) = db::delete_pickups(&pool, goal_id).await {
                            tracing::error!(%goal_id, ?err, "failed to release goal pickups");
                        }
                    }
                }
            }
            tracing::debug!("pickup monitor exiting");
        });

        (Self { tx }, join)
    }

    /// Record that a goal was just taken by a dispatcher.
    pub fn pickup(&self, goal_id: Uuid) {
        // Send fails only when the monitor task is gone; at shutdown that
        // loss is harmless.
        let _ = self.tx.send(PickupEvent::Pickup(goal_id));
    }

    /// Release a goal's pickups after its dispatch transaction committed.
    pub fn release(&self, goal_id: Uuid) {
        let _ = self.tx.send(PickupEvent::Release(goal_id));
    }
}
