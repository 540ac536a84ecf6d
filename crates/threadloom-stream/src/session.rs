use chrono::{DateTime, Utc};
use serde::Serialize;

use threadloom_core::types::{FinishedSession, GraphId, SessionKey, SessionState};

/// Streamed output of one node execution (or one sub-model of a fan-out
/// node).
///
/// `idle -> streaming -> {complete | error | cancelled}`. Terminal sessions
/// never change again; regeneration replaces them with a fresh session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    key: SessionKey,
    graph_id: GraphId,
    model: String,
    state: SessionState,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    cancel_requested: bool,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    pub fn new(key: SessionKey, graph_id: GraphId, model: impl Into<String>) -> Self {
        Self {
            key,
            graph_id,
            model: model.into(),
            state: SessionState::Idle,
            text: String::new(),
            error: None,
            cancel_requested: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// `idle -> streaming`. Sub-sessions of one run share `started_at`.
    pub fn begin(&mut self, started_at: DateTime<Utc>) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        self.state = SessionState::Streaming;
        self.text.clear();
        self.started_at = started_at;
        true
    }

    /// Append a chunk. Ignored unless streaming.
    pub fn append(&mut self, chunk: &str) -> bool {
        if !self.is_streaming() {
            return false;
        }
        self.text.push_str(chunk);
        true
    }

    /// Mark cancellation as requested. Returns false if the session is not
    /// streaming or a cancel is already pending.
    pub fn request_cancel(&mut self) -> bool {
        if !self.is_streaming() || self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    pub fn complete(&mut self) -> bool {
        self.finish(SessionState::Complete, None)
    }

    pub fn fail(&mut self, payload: impl Into<String>) -> bool {
        self.finish(SessionState::Error, Some(payload.into()))
    }

    /// Cancellation acknowledged by the producer. Partial text is kept.
    pub fn acknowledge_cancel(&mut self) -> bool {
        self.finish(SessionState::Cancelled, None)
    }

    fn finish(&mut self, state: SessionState, error: Option<String>) -> bool {
        if !self.is_streaming() {
            return false;
        }
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Snapshot for listeners, once terminal.
    pub fn finished(&self) -> Option<FinishedSession> {
        let finished_at = self.finished_at?;
        Some(FinishedSession {
            graph_id: self.graph_id.clone(),
            key: self.key.clone(),
            model: self.model.clone(),
            text: self.text.clone(),
            status: self.state,
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at,
        })
    }
}

/// Aggregate status of a node from its sub-sessions: `cancelled` if any
/// sub was cancelled, else `error` if any errored, else `complete`. A node
/// with any streaming sub is still streaming.
pub fn aggregate_status(sessions: &[StreamSession]) -> SessionState {
    if sessions.is_empty() {
        return SessionState::Idle;
    }
    if sessions.iter().any(|s| !s.state.is_terminal()) {
        return SessionState::Streaming;
    }
    if sessions.iter().any(|s| s.state == SessionState::Cancelled) {
        SessionState::Cancelled
    } else if sessions.iter().any(|s| s.state == SessionState::Error) {
        SessionState::Error
    } else {
        SessionState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadloom_core::types::NodeId;

    fn session(sub: Option<&str>) -> StreamSession {
        let key = match sub {
            Some(s) => SessionKey::sub(NodeId::from("n"), s),
            None => SessionKey::node(NodeId::from("n")),
        };
        let mut s = StreamSession::new(key, GraphId::from_string("g"), "m");
        assert!(s.begin(Utc::now()));
        s
    }

    #[test]
    fn test_idle_session_ignores_chunks() {
        let mut s = StreamSession::new(SessionKey::node(NodeId::from("n")), GraphId::from_string("g"), "m");
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.append("x"));
        assert!(!s.complete());
        assert!(s.finished().is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = session(None);
        assert!(s.append("Hel"));
        assert!(s.append("lo"));
        assert!(s.complete());
        assert!(!s.append("!"));
        assert!(!s.fail("late"));
        assert!(!s.begin(Utc::now()));
        assert_eq!(s.text(), "Hello");
        assert_eq!(s.state(), SessionState::Complete);
    }

    #[test]
    fn test_cancel_keeps_partial_text() {
        let mut s = session(None);
        s.append("partial");
        assert!(s.request_cancel());
        assert!(!s.request_cancel());
        assert!(s.is_streaming());
        assert!(s.acknowledge_cancel());
        let done = s.finished().unwrap();
        assert_eq!(done.status, SessionState::Cancelled);
        assert_eq!(done.text, "partial");
        assert!(!s.request_cancel());
    }

    #[test]
    fn test_error_records_payload() {
        let mut s = session(None);
        s.append("half");
        assert!(s.fail("rate limited"));
        assert_eq!(s.error(), Some("rate limited"));
        assert_eq!(s.finished().unwrap().to_output().text, "half");
    }

    #[test]
    fn test_aggregate_status() {
        let mut a = session(Some("a"));
        let mut b = session(Some("b"));
        let mut c = session(Some("c"));
        assert_eq!(aggregate_status(&[a.clone(), b.clone()]), SessionState::Streaming);
        a.complete();
        b.fail("x");
        assert_eq!(aggregate_status(&[a.clone(), b.clone()]), SessionState::Error);
        c.acknowledge_cancel();
        assert_eq!(aggregate_status(&[a.clone(), b, c]), SessionState::Cancelled);
        assert_eq!(aggregate_status(&[a]), SessionState::Complete);
        assert_eq!(aggregate_status(&[]), SessionState::Idle);
    }
}
