use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::Transport;
use threadloom_core::types::{ControlMessage, SessionKey};

/// Transport that records control messages and forwards them to the test.
pub struct RecordingTransport {
    sent: Mutex<Vec<ControlMessage>>,
    tx: mpsc::UnboundedSender<ControlMessage>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            tx,
            failing: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Make every following `send` fail as if the channel dropped.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<SessionKey> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::Start { key, .. } => Some(key),
                ControlMessage::Cancel { .. } => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> Vec<SessionKey> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::Cancel { key } => Some(key),
                ControlMessage::Start { .. } => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, message: ControlMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ThreadloomError::TransportError("channel closed".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            let _ = self.tx.send(message);
            Ok(())
        })
    }
}
