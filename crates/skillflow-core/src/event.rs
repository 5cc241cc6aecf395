use crate::types::{ExecutionId, ProgressEvent};

/// Event bus using tokio broadcast channel.
/// All subscribers receive all progress events of every execution.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<(ExecutionId, ProgressEvent)>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, execution_id: ExecutionId, event: ProgressEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send((execution_id, event));
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(ExecutionId, ProgressEvent)> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressEventType;
    use chrono::Utc;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = ExecutionId::new();
        bus.publish(
            id.clone(),
            ProgressEvent {
                seq: 0,
                event_type: ProgressEventType::ExecutionStarted,
                timestamp: Utc::now(),
                node_name: "initialize".into(),
                payload: serde_json::Value::Null,
            },
        );
        let (got_id, event) = rx.recv().await.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(event.event_type, ProgressEventType::ExecutionStarted);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(
            ExecutionId::new(),
            ProgressEvent {
                seq: 0,
                event_type: ProgressEventType::GroupStarted,
                timestamp: Utc::now(),
                node_name: "execute_group".into(),
                payload: serde_json::Value::Null,
            },
        );
    }
}
