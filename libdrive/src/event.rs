use tokio::sync::broadcast;

use crate::entry::DriveId;

/// Typed drive events published after adapter operations. Subscribers
/// are plain broadcast receivers; a bus with no subscribers drops
/// events silently.
#[derive(Clone, Debug)]
pub enum DriveEvent {
    EntryAccessed { drive: DriveId, path: String },
    EntryUpdated { drive: DriveId, path: String },
    EntryDeleted { drive: DriveId, path: String },
}

impl DriveEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::EntryAccessed { path, .. }
            | Self::EntryUpdated { path, .. }
            | Self::EntryDeleted { path, .. } => path,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DriveEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriveEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DriveEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(DriveEvent::EntryUpdated {
            drive: DriveId::new("d"),
            path: "a/b".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.path(), "a/b");
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(DriveEvent::EntryDeleted {
            drive: DriveId::new("d"),
            path: "x".into(),
        });
    }
}
