use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use skillflow_core::event::EventBus;
use skillflow_core::state::GraphState;
use skillflow_core::types::{ProgressEvent, ProgressEventType};

/// Node names recorded on progress events.
pub mod node {
    pub const INITIALIZE: &str = "initialize";
    pub const EXECUTE_GROUP: &str = "execute_group";
    pub const MERGE: &str = "merge_results";
    pub const VALIDATE: &str = "validate";
    pub const ROUTER: &str = "router";
    pub const HUMAN_REVIEW: &str = "human_review";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const FINALIZE: &str = "finalize";
}

/// Appends progress events to the execution's log and, when streaming is
/// enabled, publishes them on the event bus.
pub struct ProgressEmitter {
    bus: Option<Arc<EventBus>>,
}

impl ProgressEmitter {
    pub fn new(bus: Arc<EventBus>, streaming: bool) -> Self {
        Self {
            bus: streaming.then_some(bus),
        }
    }

    pub fn emit(
        &self,
        state: &mut GraphState,
        event_type: ProgressEventType,
        node_name: &str,
        payload: Value,
    ) {
        let event = ProgressEvent {
            seq: state.next_event_seq(),
            event_type,
            timestamp: Utc::now(),
            node_name: node_name.to_string(),
            payload,
        };
        debug!(
            execution_id = %state.execution_id,
            seq = event.seq,
            event = ?event.event_type,
            "Progress event"
        );
        if let Some(bus) = &self.bus {
            bus.publish(state.execution_id.clone(), event.clone());
        }
        state.progress_events.push(event);
    }
}
