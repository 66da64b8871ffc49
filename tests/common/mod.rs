//! Scripted in-process backend shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use resviz_sync::backend::{Backend, ByteStream};
use resviz_sync::wire::{History, RollbackResponse, SendRequest, StopResponse};
use resviz_sync::{Result, SyncError};

/// Each call pops the next scripted response; an empty script is a
/// transport error.
#[derive(Default)]
pub struct ScriptedBackend {
    histories: Mutex<VecDeque<Result<History>>>,
    streams: Mutex<VecDeque<Result<ByteStream>>>,
    rollbacks: Mutex<VecDeque<Result<RollbackResponse>>>,
    calls: Mutex<Vec<String>>,
    stall_history: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(self, history: History) -> Self {
        self.histories.lock().unwrap().push_back(Ok(history));
        self
    }

    pub fn history_json(self, value: serde_json::Value) -> Self {
        let history: History = serde_json::from_value(value).unwrap();
        self.history(history)
    }

    pub fn history_error(self, error: SyncError) -> Self {
        self.histories.lock().unwrap().push_back(Err(error));
        self
    }

    /// The next history fetch never resolves.
    pub fn stalled_history(self) -> Self {
        self.stall_history.store(true, Ordering::SeqCst);
        self
    }

    /// A stream that yields `body` as one chunk and then ends.
    pub fn stream(self, body: &str) -> Self {
        self.chunks(vec![Ok(Bytes::from(body.to_string()))])
    }

    pub fn chunks(self, chunks: Vec<Result<Bytes>>) -> Self {
        let stream: ByteStream = Box::pin(tokio_stream::iter(chunks));
        self.streams.lock().unwrap().push_back(Ok(stream));
        self
    }

    /// A stream fed by the returned sender; it ends when the sender drops.
    pub fn live_stream(&self) -> mpsc::UnboundedSender<Result<Bytes>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream: ByteStream = Box::pin(UnboundedReceiverStream::new(rx));
        self.streams.lock().unwrap().push_back(Ok(stream));
        tx
    }

    pub fn stream_error(self, error: SyncError) -> Self {
        self.streams.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn rollback(self, response: Result<RollbackResponse>) -> Self {
        self.rollbacks.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_stream(&self) -> Result<ByteStream> {
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport("scripted", "no stream scripted")))
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn start_conversation(&self, request: &SendRequest) -> Result<ByteStream> {
        self.record(format!("send:{}", request.content));
        self.next_stream()
    }

    async fn continue_incomplete(&self, message_id: &str) -> Result<ByteStream> {
        self.record(format!("continue:{message_id}"));
        self.next_stream()
    }

    async fn stop(&self) -> Result<StopResponse> {
        self.record("stop".to_string());
        Ok(StopResponse {
            status: "stopping".into(),
            message: String::new(),
        })
    }

    async fn rollback_to(&self, message_id: &str) -> Result<RollbackResponse> {
        self.record(format!("rollback:{message_id}"));
        self.rollbacks
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport("scripted", "no rollback scripted")))
    }

    async fn fetch_history(&self) -> Result<History> {
        self.record("history".to_string());
        if self.stall_history.swap(false, Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.histories
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport("scripted", "no history scripted")))
    }
}

/// One `data:` frame.
pub fn data(value: serde_json::Value) -> String {
    format!("data: {value}\n\n")
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

pub fn ok_rollback(deleted: usize) -> RollbackResponse {
    serde_json::from_value(json!({
        "success": true,
        "message": "rolled back",
        "deleted_count": deleted,
        "target_snapshot_id": "s1"
    }))
    .unwrap()
}

pub fn request(content: &str) -> SendRequest {
    SendRequest {
        content: content.to_string(),
        title: "User message".to_string(),
        agent_name: "auto_research_agent".to_string(),
        other_params: None,
    }
}
