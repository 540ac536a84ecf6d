use tokio::sync::mpsc;

use crate::protocol::PlanRequest;

/// Per-connection FIFO queue ensuring plan runs execute one at a time.
///
/// Submitting never waits for the run; the lane worker reports each result
/// on its own.
pub struct LaneQueue {
    tx: mpsc::Sender<PlanRequest>,
}

impl LaneQueue {
    /// Create a new lane and return (queue_handle, receiver).
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PlanRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Enqueue a plan run. Returns `false` when the lane is full or closed.
    pub fn submit(&self, request: PlanRequest) -> bool {
        self.tx.try_send(request).is_ok()
    }
}
