use crate::models::ExecutionRecord;
use strum::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::trace;

/// How many unread events a slow watcher may fall behind before it starts missing them. Watchers that lag
/// are told so and are expected to relist.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// A change to an execution record. Deleted events carry the last known copy of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub record: ExecutionRecord,
}

/// Fans out record changes to every watcher. Each store engine owns one and publishes after a write commits.
#[derive(Debug, Clone)]
pub struct WatchBus {
    broadcast_channel: broadcast::Sender<WatchEvent>,
}

impl Default for WatchBus {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);

        Self {
            broadcast_channel: tx,
        }
    }

    /// Returns a channel receiver end which can be used to listen to record changes.
    /// The receiver will drop automatically when out of scope.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.broadcast_channel.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.broadcast_channel.receiver_count()
    }

    pub fn publish(&self, kind: WatchEventKind, record: ExecutionRecord) {
        trace!(kind = %kind, namespace = record.namespace, name = record.name,
            resource_version = record.resource_version, "record changed");

        if let Err(err) = self.broadcast_channel.send(WatchEvent { kind, record }) {
            trace!(error = %err, "No watchers available to receive record change");
        }
    }
}
