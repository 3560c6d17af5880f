//! The Executor Registry (§4.5): live executor ids in insertion order, a
//! round-robin cursor, and per-executor channel handles.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{BrokerError, Result};

/// One outbound frame queued for delivery to an executor's socket. The write
/// pump in the executor channel listener drains this.
pub type OutboundFrame = String;

#[derive(Clone)]
pub struct ExecutorHandle {
    pub id: String,
    sender: mpsc::Sender<OutboundFrame>,
}

impl ExecutorHandle {
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| BrokerError::ExecutorGone(self.id.clone()))
    }
}

struct State {
    order: Vec<String>,
    handles: HashMap<String, ExecutorHandle>,
    cursor: usize,
}

pub struct ExecutorRegistry {
    state: Mutex<State>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        ExecutorRegistry {
            state: Mutex::new(State {
                order: Vec::new(),
                handles: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("executor registry mutex poisoned")
    }

    /// Registers a connected executor, replacing any prior handle under the
    /// same id (a reconnect).
    pub fn connect(&self, id: String, sender: mpsc::Sender<OutboundFrame>) -> ExecutorHandle {
        let handle = ExecutorHandle { id: id.clone(), sender };
        let mut state = self.lock();
        if !state.order.contains(&id) {
            state.order.push(id.clone());
        }
        state.handles.insert(id, handle.clone());
        handle
    }

    /// Removes the executor from the live list and returns its handle so the
    /// caller can drive cancellation for requests it owned.
    pub fn disconnect(&self, id: &str) -> Option<ExecutorHandle> {
        let mut state = self.lock();
        state.order.retain(|existing| existing != id);
        if state.cursor > state.order.len() {
            state.cursor = 0;
        }
        state.handles.remove(id)
    }

    /// Strict round-robin over the insertion-ordered live list.
    pub fn next(&self) -> Result<ExecutorHandle> {
        let mut state = self.lock();
        if state.order.is_empty() {
            return Err(BrokerError::NoExecutors);
        }
        let idx = state.cursor % state.order.len();
        state.cursor = (state.cursor + 1) % state.order.len();
        let id = state.order[idx].clone();
        state.handles.get(&id).cloned().ok_or(BrokerError::NoExecutors)
    }

    pub fn get(&self, id: &str) -> Option<ExecutorHandle> {
        self.lock().handles.get(id).cloned()
    }

    pub fn all(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    pub fn count(&self) -> usize {
        self.lock().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> (ExecutorHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ExecutorHandle { id: id.to_string(), sender: tx }, rx)
    }

    #[test]
    fn next_fails_with_no_executors() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(registry.next(), Err(BrokerError::NoExecutors)));
    }

    #[test]
    fn next_round_robins_over_insertion_order() {
        let registry = ExecutorRegistry::new();
        let (h1, _r1) = handle("a");
        let (h2, _r2) = handle("b");
        registry.connect("a".into(), h1.sender.clone());
        registry.connect("b".into(), h2.sender.clone());

        assert_eq!(registry.next().unwrap().id, "a");
        assert_eq!(registry.next().unwrap().id, "b");
        assert_eq!(registry.next().unwrap().id, "a");
    }

    #[test]
    fn disconnect_removes_from_rotation() {
        let registry = ExecutorRegistry::new();
        let (h1, _r1) = handle("a");
        let (h2, _r2) = handle("b");
        registry.connect("a".into(), h1.sender.clone());
        registry.connect("b".into(), h2.sender.clone());

        registry.disconnect("a");
        assert_eq!(registry.all(), vec!["b".to_string()]);
        assert_eq!(registry.next().unwrap().id, "b");
        assert_eq!(registry.next().unwrap().id, "b");
    }

    #[tokio::test]
    async fn send_to_gone_executor_reports_executor_gone() {
        let (handle, rx) = handle("a");
        drop(rx);
        let err = handle.send("frame".to_string()).await.unwrap_err();
        assert!(matches!(err, BrokerError::ExecutorGone(id) if id == "a"));
    }
}
