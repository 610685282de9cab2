use std::collections::HashSet;

use parking_lot::Mutex;

use crate::ids::PageKey;
use crate::wire::Call;

#[derive(Default)]
struct BufferState {
    queue: Vec<Call>,
    replayed: HashSet<PageKey>,
}

/// Calls issued while no peer was connected.
///
/// Ingress is global (not partitioned by page); replay happens at most once
/// per page key, in insertion order.
#[derive(Default)]
pub struct PreConnectBuffer {
    state: Mutex<BufferState>,
}

impl PreConnectBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, call: Call) {
        self.state.lock().queue.push(call);
    }

    /// Calls to replay for `page`. Marks the page as replayed, so every later
    /// connection for the same page gets an empty list.
    pub fn drain_for(&self, page: &PageKey) -> Vec<Call> {
        let mut state = self.state.lock();
        if !state.replayed.insert(page.clone()) {
            return Vec::new();
        }
        state.queue.clone()
    }

    pub fn is_replayed(&self, page: &PageKey) -> bool {
        self.state.lock().replayed.contains(page)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
