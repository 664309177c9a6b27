use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};

use crate::error::RelayError;

/// Destination for a response: status, headers, body bytes, flush.
///
/// The live HTTP layer implements this over a channel-backed body; the
/// [`ResponseCapture`] implementation records everything in memory so
/// recursive plugins can buffer and re-issue the pipeline transparently.
#[async_trait]
pub trait ResponseSink: Send {
    fn set_status(&mut self, status: StatusCode);
    fn headers_mut(&mut self) -> &mut HeaderMap;
    async fn write(&mut self, data: &[u8]) -> Result<(), RelayError>;
    async fn flush(&mut self) -> Result<(), RelayError>;
}

/// Captures a response instead of transmitting it. Satisfies the full
/// sink contract so downstream code treats it as a real destination;
/// `flush` is a no-op.
#[derive(Debug, Default)]
pub struct ResponseCapture {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ResponseCapture {
    pub fn new() -> Self {
        ResponseCapture::default()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ResponseSink for ResponseCapture {
    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.body.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Writes a plain-text error response, mirroring the transport host's
/// default error rendering.
pub async fn write_error(
    sink: &mut dyn ResponseSink,
    status: StatusCode,
    message: &str,
) -> Result<(), RelayError> {
    sink.set_status(status);
    sink.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    sink.write(message.as_bytes()).await?;
    sink.flush().await
}
