//! The Correlation Layer (§4.6): matches inbound executor frames back to the
//! caller-side waiter that is expecting them, by request id.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BrokerError, Result};

const STREAM_QUEUE_CAPACITY: usize = 32;

/// One item flowing through a streaming request's queue. `End` is the
/// end-of-stream sentinel; once received, the receiver must not poll again.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Chunk(Value),
    End,
}

struct State {
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
    streams: HashMap<String, mpsc::Sender<StreamItem>>,
    owner: HashMap<String, String>,
    assigned: HashMap<String, HashSet<String>>,
}

pub struct CorrelationLayer {
    state: Mutex<State>,
}

impl Default for CorrelationLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationLayer {
    pub fn new() -> Self {
        CorrelationLayer {
            state: Mutex::new(State {
                pending: HashMap::new(),
                streams: HashMap::new(),
                owner: HashMap::new(),
                assigned: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("correlation layer mutex poisoned")
    }

    pub fn register_non_streaming(&self, rid: String, executor: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        state.pending.insert(rid.clone(), tx);
        state.owner.insert(rid.clone(), executor.to_string());
        state.assigned.entry(executor.to_string()).or_default().insert(rid);
        rx
    }

    pub fn register_streaming(&self, rid: String, executor: &str) -> mpsc::Receiver<StreamItem> {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        let mut state = self.lock();
        state.streams.insert(rid.clone(), tx);
        state.owner.insert(rid.clone(), executor.to_string());
        state.assigned.entry(executor.to_string()).or_default().insert(rid);
        rx
    }

    pub fn owner_of(&self, rid: &str) -> Option<String> {
        self.lock().owner.get(rid).cloned()
    }

    /// Handles one inbound `{id, payload, status?}` frame from an executor.
    pub fn handle_inbound(&self, rid: &str, payload: Value, status: Option<Value>) {
        let streaming = payload.get("streaming").and_then(Value::as_bool).unwrap_or(false);

        let stream_tx = if streaming { self.lock().streams.get(rid).cloned() } else { None };
        if let Some(tx) = stream_tx {
            if let Some(chunk) = payload.get("chunk").cloned() {
                let _ = tx.try_send(StreamItem::Chunk(chunk));
            }
            let finished = payload.get("finished").and_then(Value::as_bool).unwrap_or(false);
            if finished {
                let _ = tx.try_send(StreamItem::End);
                self.cleanup(rid);
            }
            return;
        }

        let pending_tx = self.lock().pending.remove(rid);
        if let Some(tx) = pending_tx {
            let result = match status.as_ref().and_then(|s| s.get("error")) {
                Some(error) => {
                    let code = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
                    let detail = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("executor reported an error")
                        .to_string();
                    Err(BrokerError::ApiError { code, detail, details: error.get("details").cloned() })
                }
                None => Ok(payload),
            };
            let _ = tx.send(result);
            self.cleanup(rid);
        }
    }

    /// Idempotent teardown: removes slot/queue (pushing the end-of-stream
    /// sentinel first), clears ownership, and cancels any still-waiting slot.
    pub fn cleanup(&self, rid: &str) -> bool {
        let mut state = self.lock();
        let mut did_something = false;

        if let Some(tx) = state.streams.remove(rid) {
            let _ = tx.try_send(StreamItem::End);
            did_something = true;
        }
        if let Some(tx) = state.pending.remove(rid) {
            let _ = tx.send(Err(BrokerError::ExecutorGone(rid.to_string())));
            did_something = true;
        }
        if let Some(executor) = state.owner.remove(rid) {
            if let Some(set) = state.assigned.get_mut(&executor) {
                set.remove(rid);
            }
            did_something = true;
        }
        did_something
    }

    /// Resolves a still-pending non-streaming slot with a success payload
    /// without going through [`handle_inbound`]'s error-shape parsing.
    pub fn resolve_ok(&self, rid: &str, payload: Value) -> bool {
        let tx = self.lock().pending.remove(rid);
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(payload));
                self.cleanup(rid);
                true
            }
            None => false,
        }
    }

    /// Every request-id currently owned by `executor`, used by disconnect
    /// handling to drive cancellation before tearing down the rest.
    pub fn requests_for_executor(&self, executor: &str) -> Vec<String> {
        self.lock()
            .assigned
            .get(executor)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.streams.len()
    }
}
