//! Bridges the pipeline's sink-oriented serving onto axum responses.
//!
//! The pipeline decides status and headers while (or after) producing
//! body bytes, and streaming bodies must reach the client incrementally.
//! [`run_to_response`] runs the pipeline in a task writing into a
//! [`ChannelSink`]; the response head ships on the first body write, and
//! a pipeline that finishes without writing anything surfaces its result
//! (empty success or error) directly.

use std::convert::Infallible;
use std::future::Future;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::error;

use crate::error::RelayError;
use crate::sink::ResponseSink;

pub struct ChannelSink {
    status: StatusCode,
    headers: HeaderMap,
    head: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    fn new(head: oneshot::Sender<(StatusCode, HeaderMap)>, body: mpsc::Sender<Bytes>) -> Self {
        ChannelSink {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head: Some(head),
            body,
        }
    }

    fn send_head(&mut self) {
        if let Some(head) = self.head.take() {
            let _ = head.send((self.status, self.headers.clone()));
        }
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.send_head();
        self.body
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| RelayError::Internal("client disconnected".into()))
    }

    async fn flush(&mut self) -> Result<(), RelayError> {
        // Channel writes are push-through; nothing to flush.
        Ok(())
    }
}

pub fn plain_error(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

/// Runs a pipeline future against a live sink and turns the outcome into
/// an axum response.
pub async fn run_to_response<F, Fut>(serve: F) -> Response
where
    F: FnOnce(ChannelSink) -> Fut,
    Fut: Future<Output = Result<(), RelayError>> + Send + 'static,
{
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(16);
    let sink = ChannelSink::new(head_tx, body_tx);
    let task = tokio::spawn(serve(sink));

    match head_rx.await {
        Ok((status, headers)) => {
            // Something was written: stream the body through. Later
            // pipeline errors can only truncate the stream.
            let stream = ReceiverStream::new(body_rx).map(Ok::<_, Infallible>);
            let mut builder = Response::builder().status(status);
            if let Some(header_map) = builder.headers_mut() {
                *header_map = headers;
            }
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_default()
        }
        Err(_) => {
            // The sink was dropped without a write; the task's result is
            // the whole story.
            match task.await {
                Ok(Ok(())) => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::empty())
                    .unwrap_or_default(),
                Ok(Err(e)) => {
                    error!(error = %e, "request failed");
                    plain_error(e.status(), &e.to_string())
                }
                Err(join_error) => {
                    error!(error = %join_error, "request task panicked");
                    plain_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                }
            }
        }
    }
}
