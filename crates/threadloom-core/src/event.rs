use serde::Serialize;

use crate::types::{GraphId, NodeId};

/// Graph-level change published to every connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// The canvas write path changed a graph's topology.
    GraphChanged { graph_id: GraphId },
    /// The context merger created or grew a merge node.
    MergePlaced {
        graph_id: GraphId,
        merge_node: NodeId,
        target: NodeId,
        inserted: bool,
    },
    /// A graph got a new title.
    TitleChanged { graph_id: GraphId, title: String },
}

impl GraphEvent {
    pub fn graph_id(&self) -> &GraphId {
        match self {
            Self::GraphChanged { graph_id }
            | Self::MergePlaced { graph_id, .. }
            | Self::TitleChanged { graph_id, .. } => graph_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: GraphEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GraphEvent> {
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

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(GraphEvent::GraphChanged {
            graph_id: GraphId::from_string("g1"),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.graph_id().as_str(), "g1");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(GraphEvent::TitleChanged {
            graph_id: GraphId::from_string("g1"),
            title: "t".into(),
        });
    }
}
