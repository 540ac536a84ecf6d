use serde::{Deserialize, Serialize};

use threadloom_core::error::ThreadloomError;
use threadloom_core::event::GraphEvent;
use threadloom_core::types::{ExecutionPlan, GraphId, NodeId, StartStream};
use threadloom_graph::TitleStrategy;
use threadloom_stream::{FailurePolicy, PlanRun};

/// A message sent from the client over the stream socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartStream(StartStream),
    #[serde(rename_all = "camelCase")]
    CancelStream { node_id: NodeId },
    #[serde(rename_all = "camelCase")]
    RegenerateTitle {
        graph_id: GraphId,
        #[serde(default)]
        strategy: TitleStrategy,
    },
    RunPlan(PlanRequest),
}

/// `run_plan` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub graph_id: GraphId,
    pub node_id: NodeId,
    pub direction: String,
    /// Comma-separated kind filter for `multiple`.
    #[serde(default)]
    pub kinds: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// A non-stream message pushed to the client. Stream events are sent as
/// serialized `StreamEvent`s directly.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    TitleUpdate { graph_id: GraphId, title: String },
    #[serde(rename_all = "camelCase")]
    GraphChanged { graph_id: GraphId },
    #[serde(rename_all = "camelCase")]
    MergePlaced {
        graph_id: GraphId,
        merge_node: NodeId,
        target: NodeId,
        inserted: bool,
    },
    #[serde(rename_all = "camelCase")]
    PlanResult {
        graph_id: GraphId,
        node_id: NodeId,
        plan: ExecutionPlan,
        run: PlanRun,
    },
    Error(ErrorPayload),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl ServerMessage {
    pub fn error(err: &ThreadloomError, node_id: Option<NodeId>) -> Self {
        Self::Error(ErrorPayload {
            kind: err.kind().to_string(),
            message: err.to_string(),
            node_id,
        })
    }

    /// Frame for malformed input.
    pub fn parse_error(message: String) -> Self {
        Self::Error(ErrorPayload {
            kind: "parse_error".to_string(),
            message,
            node_id: None,
        })
    }
}

impl From<GraphEvent> for ServerMessage {
    fn from(event: GraphEvent) -> Self {
        match event {
            GraphEvent::GraphChanged { graph_id } => Self::GraphChanged { graph_id },
            GraphEvent::MergePlaced {
                graph_id,
                merge_node,
                target,
                inserted,
            } => Self::MergePlaced {
                graph_id,
                merge_node,
                target,
                inserted,
            },
            GraphEvent::TitleChanged { graph_id, title } => Self::TitleUpdate { graph_id, title },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadloom_core::types::StreamType;

    #[test]
    fn test_parse_start_stream() {
        let json = r#"{"type":"start_stream","graphId":"g","nodeId":"n","model":"m","streamType":"parallel","subModels":["a","b"]}"#;
        let ClientMessage::StartStream(req) = serde_json::from_str(json).unwrap() else {
            panic!("expected start_stream");
        };
        assert_eq!(req.node_id.as_str(), "n");
        assert_eq!(req.stream_type, StreamType::Parallel);
        assert_eq!(req.sub_models.len(), 2);
    }

    #[test]
    fn test_parse_control_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"cancel_stream","nodeId":"n"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::CancelStream { node_id } if node_id.as_str() == "n"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"regenerate_title","graphId":"g"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::RegenerateTitle { strategy: TitleStrategy::Prompts, .. }
        ));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"run_plan","graphId":"g","nodeId":"n","direction":"multiple","kinds":"github","failurePolicy":"continue"}"#,
        )
        .unwrap();
        let ClientMessage::RunPlan(req) = msg else {
            panic!("expected run_plan");
        };
        assert_eq!(req.kinds.as_deref(), Some("github"));
        assert_eq!(req.failure_policy, FailurePolicy::Continue);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"upload_file"}"#).is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let json = serde_json::to_value(ServerMessage::from(GraphEvent::TitleChanged {
            graph_id: GraphId::from_string("g"),
            title: "Rust basics".into(),
        }))
        .unwrap();
        assert_eq!(json["type"], "title_update");
        assert_eq!(json["graphId"], "g");

        let err = ThreadloomError::NotRegistered("t1".into());
        let json = serde_json::to_value(ServerMessage::error(&err, Some(NodeId::from("t1")))).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "not_registered");
        assert_eq!(json["nodeId"], "t1");
    }
}
