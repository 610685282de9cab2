use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pagelink_core::{safe_json, Call, ConnectionId, PageKey, PreConnectBuffer};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{BroadcastPolicy, RetryPolicy};
use crate::connection::Connection;

/// Told when the last connection of a page goes away.
///
/// Receives the page that closed and every connection still live (on any
/// page). Runs exactly once per page-emptying removal.
pub trait CloseHandler: Send + Sync {
    fn on_close(&self, page: &PageKey, remaining: &[Arc<Connection>]);
}

impl<F> CloseHandler for F
where
    F: Fn(&PageKey, &[Arc<Connection>]) + Send + Sync,
{
    fn on_close(&self, page: &PageKey, remaining: &[Arc<Connection>]) {
        self(page, remaining)
    }
}

/// Live connections, in attach order.
pub struct ConnectionManager {
    live: Mutex<Vec<Arc<Connection>>>,
    buffer: PreConnectBuffer,
    close_handler: Option<Arc<dyn CloseHandler>>,
    retry: RetryPolicy,
    policy: BroadcastPolicy,
    count_tx: watch::Sender<usize>,
}

impl ConnectionManager {
    pub fn new(
        retry: RetryPolicy,
        policy: BroadcastPolicy,
        close_handler: Option<Arc<dyn CloseHandler>>,
    ) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            live: Mutex::new(Vec::new()),
            buffer: PreConnectBuffer::new(),
            close_handler,
            retry,
            policy,
            count_tx,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn buffer(&self) -> &PreConnectBuffer {
        &self.buffer
    }

    /// Attach a connection, then replay buffered calls to it if its page has
    /// not seen them yet.
    pub async fn add(&self, conn: Arc<Connection>) {
        let count = {
            let mut live = self.live.lock();
            live.push(Arc::clone(&conn));
            live.len()
        };
        self.count_tx.send_replace(count);
        tracing::info!(
            connection_id = %conn.id,
            page_key = %conn.page_key,
            live = count,
            "Peer connected"
        );

        let replay = self.buffer.drain_for(&conn.page_key);
        if replay.is_empty() {
            return;
        }
        tracing::info!(
            connection_id = %conn.id,
            page_key = %conn.page_key,
            calls = replay.len(),
            "Replaying buffered calls"
        );
        for call in &replay {
            if !conn.send_with_retry(safe_json(call), self.retry).await {
                tracing::warn!(connection_id = %conn.id, call_id = %call.id, "Replay send failed");
            }
        }
    }

    /// Buffer `call` if no connection is live. Checked under the same lock
    /// `add` takes, so a call is either buffered before a replay snapshot or
    /// sees the new connection.
    pub fn buffer_if_disconnected(&self, call: &Call) -> bool {
        let live = self.live.lock();
        if !live.is_empty() {
            return false;
        }
        self.buffer.enqueue(call.clone());
        tracing::debug!(call_id = %call.id, target = %call.name, "No peer connected, call buffered");
        true
    }

    /// Detach and close a connection. Returns `false` if it was already gone.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let (removed, remaining) = {
            let mut live = self.live.lock();
            let Some(pos) = live.iter().position(|c| &c.id == id) else {
                return false;
            };
            (live.remove(pos), live.clone())
        };
        self.count_tx.send_replace(remaining.len());
        removed.close();

        let page_emptied = !remaining.iter().any(|c| c.page_key == removed.page_key);
        tracing::info!(
            connection_id = %removed.id,
            page_key = %removed.page_key,
            live = remaining.len(),
            page_emptied,
            "Peer disconnected"
        );

        if page_emptied {
            if let Some(handler) = &self.close_handler {
                handler.on_close(&removed.page_key, &remaining);
            }
        }
        true
    }

    /// Send `frame` to the connections selected by the broadcast policy,
    /// optionally limited to one page. Connections whose retries run out are
    /// dropped. Returns how many connections accepted the frame.
    pub async fn broadcast(&self, page: Option<&PageKey>, frame: String) -> usize {
        let targets = self.targets(page);
        let sends = targets.iter().map(|conn| {
            let frame = frame.clone();
            async move { (conn, conn.send_with_retry(frame, self.retry).await) }
        });

        let mut delivered = 0;
        for (conn, ok) in futures::future::join_all(sends).await {
            if ok {
                delivered += 1;
            } else {
                tracing::warn!(
                    connection_id = %conn.id,
                    page_key = %conn.page_key,
                    "Dropping unreachable connection"
                );
                self.remove(&conn.id);
            }
        }
        delivered
    }

    fn targets(&self, page: Option<&PageKey>) -> Vec<Arc<Connection>> {
        let live = self.live.lock();
        let matching = live
            .iter()
            .filter(|c| page.map_or(true, |p| &c.page_key == p));

        match self.policy {
            BroadcastPolicy::AllConnections => matching.cloned().collect(),
            BroadcastPolicy::LatestPerPage => {
                let mut seen = BTreeSet::new();
                let mut latest: Vec<Arc<Connection>> = matching
                    .rev()
                    .filter(|c| seen.insert(c.page_key.clone()))
                    .cloned()
                    .collect();
                latest.reverse();
                latest
            }
        }
    }

    pub fn count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Distinct page keys with at least one live connection.
    pub fn pages(&self) -> Vec<PageKey> {
        let pages: BTreeSet<PageKey> = self.live.lock().iter().map(|c| c.page_key.clone()).collect();
        pages.into_iter().collect()
    }

    pub fn connections_for(&self, page: &PageKey) -> Vec<Arc<Connection>> {
        self.live
            .lock()
            .iter()
            .filter(|c| &c.page_key == page)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.live.lock().clone()
    }

    /// Wait until at least one connection is live.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.count_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n > 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Close every connection without close notifications.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.live.lock());
        self.count_tx.send_replace(0);
        for conn in &dropped {
            conn.close();
        }
    }
}
