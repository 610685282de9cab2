//! A live peer connection, as seen by everything above the socket.

use std::sync::Arc;
use std::time::Instant;

use pagelink_core::{ConnectionId, PageKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;

/// One attached peer. Frames written here are forwarded to the socket by the
/// connection's writer task.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub page_key: PageKey,
    pub connected_at: Instant,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiving end its writer task drains.
    pub fn open(page_key: PageKey, max_send_queue: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            page_key,
            connected_at: Instant::now(),
            tx,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Tear the connection down. Its receive loop and socket writer stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once [`Connection::close`] has been called.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }

    /// Queue a frame, retrying on a full queue with a fixed delay.
    ///
    /// Returns `false` once the attempt ceiling is hit or the writer is gone.
    /// The frame is dropped in that case; nothing surfaces to the caller of
    /// the originating call.
    pub async fn send_with_retry(&self, frame: String, policy: RetryPolicy) -> bool {
        let mut frame = frame;
        if self.closed.is_cancelled() {
            return false;
        }
        for attempt in 1..=policy.attempts {
            match self.tx.try_send(frame) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(connection_id = %self.id, "Send on closed connection");
                    return false;
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    frame = returned;
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.delay()).await;
                    }
                }
            }
        }
        tracing::warn!(
            connection_id = %self.id,
            page_key = %self.page_key,
            attempts = policy.attempts,
            msg_len = frame.len(),
            "Send queue full, dropping frame"
        );
        false
    }
}
