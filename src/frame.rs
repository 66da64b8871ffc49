//! Line framing for the patch stream.
//!
//! The transport delivers arbitrary byte chunks. [`FrameReader`] decodes them
//! as UTF-8 in streaming mode, splits the text into lines and folds
//! `event:`/`data:` pairs into [`StreamEvent`]s. [`EventStream`] couples a
//! reader with the byte stream it consumes.

use std::collections::VecDeque;

use bytes::Bytes;
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::backend::ByteStream;
use crate::error::{Result, SyncError};

/// Data value that terminates a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Patch,
    Error,
    Finished,
    /// `data: [DONE]`.
    Done,
}

impl EventKind {
    fn from_name(name: Option<&str>) -> Option<Self> {
        match name {
            None | Some("patch") | Some("message") => Some(EventKind::Patch),
            Some("error") => Some(EventKind::Error),
            Some("finished") => Some(EventKind::Finished),
            Some(_) => None,
        }
    }

    /// Whether receiving this event ends the current stream.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventKind::Patch)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl StreamEvent {
    fn done() -> Self {
        StreamEvent {
            kind: EventKind::Done,
            data: Value::Null,
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameReader {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Decoded text not yet terminated by `\n`.
    line: String,
    /// Name from the last `event:` line of the current block.
    event: Option<String>,
    closed: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Consume one transport chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);
        self.decode_pending();

        let mut events = Vec::new();
        while let Some(end) = self.line.find('\n') {
            let raw: String = self.line.drain(..=end).collect();
            if let Some(event) = self.process_line(raw.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
            if self.closed {
                break;
            }
        }
        events
    }

    /// Flush a final unterminated line at end of input, then close.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.line.push_str(&String::from_utf8_lossy(&rest));
        }
        let rest = std::mem::take(&mut self.line);
        let events = self
            .process_line(rest.trim_end_matches('\r'))
            .into_iter()
            .collect();
        self.close();
        events
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.line.clear();
        self.event = None;
    }

    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.line.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.line
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            self.line.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn process_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            self.event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim().to_string());
            return None;
        }
        let Some(data) = line.strip_prefix("data:") else {
            debug!(line, "ignoring non-data field");
            return None;
        };
        let data = data.trim();
        if data == DONE_SENTINEL {
            self.close();
            return Some(StreamEvent::done());
        }
        let Some(kind) = EventKind::from_name(self.event.as_deref()) else {
            warn!(event = ?self.event, "unknown event type; data dropped");
            return None;
        };
        match serde_json::from_str::<Value>(data) {
            Ok(value) => Some(StreamEvent { kind, data: value }),
            Err(e) => {
                let err = SyncError::Framing {
                    detail: format!("{e} in {data:.80}"),
                };
                warn!(error = %err, "dropping malformed data line");
                None
            }
        }
    }
}

/// A byte stream paired with the reader that frames it.
pub struct EventStream {
    stream: Option<ByteStream>,
    reader: FrameReader,
    queue: VecDeque<StreamEvent>,
}

impl EventStream {
    pub fn new(stream: ByteStream) -> Self {
        EventStream {
            stream: Some(stream),
            reader: FrameReader::new(),
            queue: VecDeque::new(),
        }
    }

    /// Next framed event; `None` once the stream is exhausted or closed.
    ///
    /// A transport error closes the stream and is returned once.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(chunk)) => {
                    self.push_chunk(chunk);
                }
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(e));
                }
                None => {
                    self.queue.extend(self.reader.finish());
                    self.stream = None;
                }
            }
        }
    }

    fn push_chunk(&mut self, chunk: Bytes) {
        self.queue.extend(self.reader.feed(&chunk));
        if self.reader.is_closed() {
            // `[DONE]` seen; release the connection now.
            self.stream = None;
        }
    }

    /// Drop the underlying connection and any buffered events.
    pub fn close(&mut self) {
        self.stream = None;
        self.reader.close();
        self.queue.clear();
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
