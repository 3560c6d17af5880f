//! The Command Dispatcher (§4.7): serializes a command envelope, routes it
//! to an executor's channel, and correlates the response.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broker::correlation::{CorrelationLayer, StreamItem};
use crate::broker::executor::{ExecutorHandle, ExecutorRegistry};
use crate::error::{BrokerError, Result};

pub struct Dispatcher {
    registry: Arc<ExecutorRegistry>,
    correlation: Arc<CorrelationLayer>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, correlation: Arc<CorrelationLayer>, request_timeout: Duration) -> Self {
        Dispatcher { registry, correlation, request_timeout }
    }

    fn envelope(rid: &str, command_type: &str, payload: Value) -> String {
        json!({ "id": rid, "type": command_type, "payload": payload }).to_string()
    }

    pub async fn dispatch_non_streaming(
        &self,
        executor: &ExecutorHandle,
        command_type: &str,
        payload: Value,
    ) -> Result<Value> {
        let rid = Uuid::new_v4().to_string();
        let rx = self.correlation.register_non_streaming(rid.clone(), &executor.id);

        if let Err(err) = executor.send(Self::envelope(&rid, command_type, payload)).await {
            self.correlation.cleanup(&rid);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(api_err))) => Err(api_err),
            Ok(Err(_channel_dropped)) => Err(BrokerError::BadGateway(
                "executor channel closed before responding".to_string(),
            )),
            Err(_elapsed) => {
                self.correlation.cleanup(&rid);
                Err(BrokerError::GatewayTimeout)
            }
        }
    }

    pub async fn dispatch_streaming(
        &self,
        executor: &ExecutorHandle,
        command_type: &str,
        payload: Value,
    ) -> Result<StreamingHandle> {
        let rid = Uuid::new_v4().to_string();
        let rx = self.correlation.register_streaming(rid.clone(), &executor.id);

        if let Err(err) = executor.send(Self::envelope(&rid, command_type, payload)).await {
            self.correlation.cleanup(&rid);
            return Err(err);
        }

        Ok(StreamingHandle {
            rid,
            executor: executor.clone(),
            correlation: self.correlation.clone(),
            rx,
            done: false,
        })
    }

    /// Explicit cancel: best-effort notifies the owning executor, then
    /// performs idempotent local cleanup. Returns `false` for an unknown rid.
    pub async fn cancel(&self, rid: &str) -> bool {
        let owner = self.correlation.owner_of(rid);
        if let Some(executor_id) = &owner {
            if let Some(handle) = self.registry.get(executor_id) {
                let frame = json!({ "type": "cancel", "id": rid }).to_string();
                if let Err(err) = handle.send(frame).await {
                    warn!("cancel envelope to {} failed: {}", executor_id, err);
                }
            }
        }
        self.correlation.cleanup(rid)
    }
}

/// The outcome of one poll of a [`StreamingHandle`].
pub enum PollOutcome {
    Chunk(Value),
    Ended,
    /// No item arrived within the poll window; the caller should check for
    /// its own disconnect and poll again.
    Pending,
}

/// A live streaming request. Poll with [`poll_next`](Self::poll_next) on a
/// short timeout so the caller can interleave its own disconnect checks,
/// per §4.7 step 5.
pub struct StreamingHandle {
    rid: String,
    executor: ExecutorHandle,
    correlation: Arc<CorrelationLayer>,
    rx: tokio::sync::mpsc::Receiver<StreamItem>,
    done: bool,
}

impl StreamingHandle {
    pub fn request_id(&self) -> &str {
        &self.rid
    }

    pub async fn poll_next(&mut self, poll_timeout: Duration) -> PollOutcome {
        if self.done {
            return PollOutcome::Ended;
        }
        match tokio::time::timeout(poll_timeout, self.rx.recv()).await {
            Ok(Some(StreamItem::Chunk(value))) => PollOutcome::Chunk(value),
            Ok(Some(StreamItem::End)) | Ok(None) => {
                self.done = true;
                PollOutcome::Ended
            }
            Err(_elapsed) => PollOutcome::Pending,
        }
    }

    /// Sends a best-effort cancel envelope to the owning executor and cleans
    /// up local state. Idempotent: a second call is a no-op.
    pub async fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let frame = json!({ "type": "cancel", "id": self.rid }).to_string();
        if let Err(err) = self.executor.send(frame).await {
            warn!("cancel envelope to {} failed: {}", self.executor.id, err);
        }
        self.correlation.cleanup(&self.rid);
    }
}

impl Drop for StreamingHandle {
    fn drop(&mut self) {
        if !self.done {
            self.correlation.cleanup(&self.rid);
        }
    }
}
