use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ail::Program;

use crate::context::RequestContext;
use crate::error::RelayError;
use crate::sink::{ResponseCapture, ResponseSink};
use crate::sse;

/// The endpoint adapter entry recursive plugins re-enter. Carries the
/// program directly, so inner invocations never re-parse wire bytes.
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    async fn handle(
        self: Arc<Self>,
        prog: Program,
        sink: &mut dyn ResponseSink,
        ctx: RequestContext,
    ) -> Result<(), RelayError>;
}

/// Converts captured response bytes back into AIL. Injected into the
/// invoker at construction so it stays decoupled from any wire format.
pub trait ResponseParser: Send + Sync {
    fn parse_response(&self, data: &[u8]) -> Result<Program, RelayError>;

    /// Parses one SSE data event; defaults to the non-streaming parser.
    fn parse_stream_data(&self, data: &[u8]) -> Result<Program, RelayError> {
        self.parse_response(data)
    }
}

/// Back-reference recursive plugins use to re-enter the pipeline.
pub struct HandlerInvoker {
    handler: Arc<dyn EndpointHandler>,
    parser: Arc<dyn ResponseParser>,
}

impl HandlerInvoker {
    pub fn new(handler: Arc<dyn EndpointHandler>, parser: Arc<dyn ResponseParser>) -> Self {
        HandlerInvoker { handler, parser }
    }

    /// Re-enters the pipeline, writing to the given sink.
    pub async fn invoke(
        &self,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<(), RelayError> {
        self.handler
            .clone()
            .handle(prog.clone(), sink, ctx.clone())
            .await
    }

    /// Re-enters the pipeline, captures the response, and parses it back
    /// to a program.
    pub async fn invoke_capture(
        &self,
        prog: &Program,
        ctx: &RequestContext,
    ) -> Result<Program, RelayError> {
        let mut capture = ResponseCapture::new();
        self.invoke(prog, &mut capture, ctx).await?;
        if capture.body.is_empty() {
            return Ok(Program::new());
        }
        self.parse_captured(&capture)
    }

    /// Re-enters the pipeline with streaming enabled, captures the SSE
    /// stream, and reassembles all chunk programs.
    pub async fn invoke_capture_stream(
        &self,
        prog: &Program,
        ctx: &RequestContext,
    ) -> Result<Program, RelayError> {
        let mut streaming = prog.clone();
        streaming.set_streaming(true);
        let mut capture = ResponseCapture::new();
        self.invoke(&streaming, &mut capture, ctx).await?;
        if capture.body.is_empty() {
            return Ok(Program::new());
        }
        if capture.is_event_stream() {
            return self.parse_sse_capture(&capture.body);
        }
        // The handler may have answered without streaming after all.
        self.parser.parse_response(&capture.body)
    }

    /// Parses a captured response, dispatching on its Content-Type.
    pub fn parse_captured(&self, capture: &ResponseCapture) -> Result<Program, RelayError> {
        if capture.body.is_empty() {
            return Ok(Program::new());
        }
        if capture.is_event_stream() {
            return self.parse_sse_capture(&capture.body);
        }
        self.parser.parse_response(&capture.body)
    }

    fn parse_sse_capture(&self, body: &[u8]) -> Result<Program, RelayError> {
        let mut assembled = Program::new();
        for event in sse::parse_events(body) {
            if event.done {
                break;
            }
            if event.data.is_empty() {
                continue;
            }
            match self.parser.parse_stream_data(&event.data) {
                Ok(chunk) => assembled.append(&chunk),
                Err(e) => {
                    // Unparseable data events are treated as heartbeats.
                    debug!(error = %e, "skipping unparseable captured SSE event");
                }
            }
        }
        assembled.finalize_stream();
        Ok(assembled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ail::{codec_for, Op, Style};

    struct EchoHandler;
    #[async_trait]
    impl EndpointHandler for EchoHandler {
        async fn handle(
            self: Arc<Self>,
            prog: Program,
            sink: &mut dyn ResponseSink,
            _ctx: RequestContext,
        ) -> Result<(), RelayError> {
            sink.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            let mut response = Program::new();
            response.emit(Op::MsgStart);
            response.emit(Op::RoleAssistant);
            response.emit_text(Op::TxtChunk, format!("echo:{}", prog.model().unwrap_or("")));
            response.emit(Op::MsgEnd);
            let bytes = codec_for(Style::ChatCompletions)
                .emit_response(&response)
                .unwrap();
            sink.write(&bytes).await
        }
    }

    struct ChatParser;
    impl ResponseParser for ChatParser {
        fn parse_response(&self, data: &[u8]) -> Result<Program, RelayError> {
            codec_for(Style::ChatCompletions)
                .parse_response(data)
                .map_err(|e| RelayError::BadWire(e.to_string()))
        }
        fn parse_stream_data(&self, data: &[u8]) -> Result<Program, RelayError> {
            codec_for(Style::ChatCompletions)
                .parse_stream_chunk(data)
                .map_err(|e| RelayError::BadWire(e.to_string()))
        }
    }

    #[tokio::test]
    async fn invoke_capture_parses_response() {
        let invoker = HandlerInvoker::new(Arc::new(EchoHandler), Arc::new(ChatParser));
        let mut prog = Program::new();
        prog.set_model("m1");
        let res = invoker
            .invoke_capture(&prog, &RequestContext::new())
            .await
            .unwrap();
        let msgs = res.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(res.message_text(&msgs[0]), "echo:m1");
    }

    #[tokio::test]
    async fn sse_capture_reassembles_and_skips_heartbeat_noise() {
        let invoker = HandlerInvoker::new(Arc::new(EchoHandler), Arc::new(ChatParser));
        let mut capture = ResponseCapture::new();
        capture.headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/event-stream"),
        );
        capture.body = b": ok\n\n\
data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"he\"}}]}\n\n\
data: not json at all\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
data: [DONE]\n\n"
            .to_vec();

        let assembled = invoker.parse_captured(&capture).unwrap();
        let msgs = assembled.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(assembled.message_text(&msgs[0]), "hello");
    }
}
