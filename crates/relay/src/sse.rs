//! Server-sent-event framing shared by the streaming serves, the
//! outbound drivers, and the capture-replay path.
//!
//! Framing: a heartbeat comment `: ok\n\n` opens a stream, data frames
//! are `data: <payload>\n\n`, errors are `data: {"error":"…"}\n\n`, and
//! `data: [DONE]\n\n` terminates. Comment lines are ignored by readers.

use serde_json::json;

use crate::error::RelayError;
use crate::sink::ResponseSink;

pub const DONE: &str = "[DONE]";

/// Extracts the payload of a `data:` line; `None` for comments, blank
/// lines, and other fields.
pub fn data_line(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    line.strip_prefix("data:").map(|rest| rest.trim_start())
}

/// One parsed event from a captured SSE body.
#[derive(Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub data: Vec<u8>,
    pub done: bool,
}

/// Parses a fully captured SSE body into its data events. Multi-line
/// `data:` fields are joined with `\n` per the SSE spec.
pub fn parse_events(body: &[u8]) -> Vec<SseEvent> {
    let text = String::from_utf8_lossy(body);
    let mut events = Vec::new();
    let mut data: Vec<String> = Vec::new();
    for raw in text.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            if !data.is_empty() {
                let payload = data.join("\n");
                data.clear();
                let done = payload == DONE;
                events.push(SseEvent {
                    data: payload.into_bytes(),
                    done,
                });
            }
            continue;
        }
        if let Some(payload) = data_line(line) {
            data.push(payload.to_string());
        }
        // Comments (`:`) and other fields (`event:`, `id:`) are skipped.
    }
    if !data.is_empty() {
        let payload = data.join("\n");
        let done = payload == DONE;
        events.push(SseEvent {
            data: payload.into_bytes(),
            done,
        });
    }
    events
}

/// SSE writer over a response sink. Sets the stream headers on creation;
/// every frame is followed by a flush.
pub struct SseWriter<'a> {
    sink: &'a mut dyn ResponseSink,
}

impl<'a> SseWriter<'a> {
    pub fn new(sink: &'a mut dyn ResponseSink) -> Self {
        let headers = sink.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(
            http::header::CACHE_CONTROL,
            http::HeaderValue::from_static("no-cache"),
        );
        SseWriter { sink }
    }

    pub async fn heartbeat(&mut self, message: &str) -> Result<(), RelayError> {
        self.sink.write(format!(": {message}\n\n").as_bytes()).await?;
        self.sink.flush().await
    }

    pub async fn data(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\n\n");
        self.sink.write(&frame).await?;
        self.sink.flush().await
    }

    pub async fn error(&mut self, message: &str) -> Result<(), RelayError> {
        let payload = serde_json::to_vec(&json!({"error": message})).unwrap_or_default();
        self.data(&payload).await
    }

    pub async fn done(&mut self) -> Result<(), RelayError> {
        self.data(DONE.as_bytes()).await
    }

    pub fn sink(&mut self) -> &mut dyn ResponseSink {
        self.sink
    }
}
