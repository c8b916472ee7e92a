//! Cross-process broadcast channel
//!
//! With more than one server instance, an update committed on instance A
//! must become visible to viewers connected to instance B. Committed
//! events are published on a redis channel wrapped in an envelope carrying
//! the origin instance, so each instance can skip its own echoes when
//! re-broadcasting.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use redis::{AsyncCommands, aio::ConnectionManager};

use super::game::UpdateMessage;

/// Redis channel carrying committed game events between instances
pub const CHANNEL: &str = "tally:events";

/// A committed event together with the instance that produced it
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance that committed and already locally broadcast the event
    pub origin: Uuid,
    /// The broadcast event itself
    pub event: UpdateMessage,
}

/// Handle for publishing committed events to other instances
///
/// Publishing is fire-and-forget from the caller's point of view: events
/// are queued onto a channel drained by a background pump, so the game
/// loop never waits on redis.
#[derive(Debug, Clone)]
pub struct Publisher {
    origin: Uuid,
    tx: mpsc::UnboundedSender<UpdateMessage>,
}

impl Publisher {
    /// The id this instance stamps on its envelopes
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Queues a committed event for publication
    ///
    /// # Arguments
    ///
    /// * `event` - The event that was just broadcast locally
    pub fn publish(&self, event: &UpdateMessage) {
        if self.tx.send(event.clone()).is_err() {
            warn!("broadcast publisher task is gone, event dropped");
        }
    }
}

/// Spawns the pump forwarding locally committed events into redis
///
/// # Arguments
///
/// * `connection` - Connection shared with the redis store
///
/// # Returns
///
/// The [`Publisher`] handle the game loop publishes through.
pub fn start_publisher(connection: ConnectionManager) -> Publisher {
    let (tx, mut rx) = mpsc::unbounded_channel::<UpdateMessage>();
    let origin = Uuid::new_v4();

    tokio::spawn(async move {
        let mut connection = connection;

        while let Some(event) = rx.recv().await {
            let envelope = Envelope { origin, event };
            let payload =
                serde_json::to_string(&envelope).expect("default serializer cannot fail");

            if let Err(error) = connection.publish::<_, _, ()>(CHANNEL, payload).await {
                error!("failed to publish broadcast event: {error}");
            }
        }
    });

    Publisher { origin, tx }
}
