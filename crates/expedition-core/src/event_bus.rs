use tokio::sync::broadcast;

use expedition_types::MissionEvent;

/// Fan-out channel for mission progress events (§4.5). Subscribers are best-effort: a
/// slow or absent subscriber never blocks the scheduler, it simply misses events once its
/// buffer (`event_subscriber_buffer`, §6) is exceeded and `broadcast` drops the oldest.
#[derive(Clone)]
pub struct MissionEventBus {
    tx: broadcast::Sender<MissionEvent>,
}

impl MissionEventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MissionEvent) {
        // No receivers is a normal state (no subscriber attached yet); ignore the error.
        let _ = self.tx.send(event);
    }
}

impl Default for MissionEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = MissionEventBus::new(4);
        bus.publish(MissionEvent::MissionStarted {
            mission_id: "m1".to_string(),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = MissionEventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(MissionEvent::MissionStarted {
            mission_id: "m1".to_string(),
        });
        bus.publish(MissionEvent::MissionSucceeded {
            mission_id: "m1".to_string(),
        });
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, MissionEvent::MissionStarted { .. }));
        assert!(matches!(second, MissionEvent::MissionSucceeded { .. }));
    }
}
