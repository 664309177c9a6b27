//! The raw-IR endpoint: accepts binary AIL (`application/x-ail`) or
//! disassembly text, runs the same pipeline as the wire endpoints, and
//! answers in kind. Streaming responses are SSE frames carrying one
//! chunk program each: disassembly text in text mode, base64 binary in
//! binary mode.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use base64::Engine;
use bytes::Bytes;
use tracing::error;

use ail::Program;

use crate::context::RequestContext;
use crate::drivers::{InferenceCommand, StreamItem};
use crate::error::RelayError;
use crate::gateway::Gateway;
use crate::plugin::{EndpointHandler, HandlerInvoker, PluginChain, ResponseParser};
use crate::provider::Provider;
use crate::sink::ResponseSink;
use crate::sse::SseWriter;

use super::pipeline::{request_preamble, run_inference_pipeline, ServeFormat};
use super::respond;

pub struct AilEndpoint {
    gateway: Arc<Gateway>,
    router_name: String,
}

impl AilEndpoint {
    pub fn new(gateway: Arc<Gateway>, router_name: impl Into<String>) -> Arc<Self> {
        Arc::new(AilEndpoint {
            gateway,
            router_name: router_name.into(),
        })
    }

    pub async fn serve_http(
        self: Arc<Self>,
        headers: HeaderMap,
        body: Bytes,
    ) -> axum::response::Response {
        if body.is_empty() {
            return respond::plain_error(StatusCode::BAD_REQUEST, "empty request body");
        }

        let input_binary = is_input_binary(&headers, &body);
        let prog = if input_binary {
            match Program::from_bytes(&body) {
                Ok(prog) => prog,
                Err(e) => {
                    return respond::plain_error(
                        StatusCode::BAD_REQUEST,
                        &format!("invalid binary AIL: {e}"),
                    )
                }
            }
        } else {
            match String::from_utf8(body.to_vec())
                .map_err(ail::Error::from)
                .and_then(|text| Program::asm(&text))
            {
                Ok(prog) => prog,
                Err(e) => {
                    return respond::plain_error(
                        StatusCode::BAD_REQUEST,
                        &format!("invalid AIL text: {e}"),
                    )
                }
            }
        };

        let bearer = match self.gateway.auth.collect_incoming(&headers) {
            Ok(bearer) => bearer,
            Err(e) => return respond::plain_error(e.status(), &e.to_string()),
        };

        let mut ctx = RequestContext::new();
        ctx.bearer = bearer;
        ctx.binary_output = wants_binary_output(&headers, input_binary);
        ctx.ensure_trace_id();

        let endpoint = self.clone();
        respond::run_to_response(move |mut sink| async move {
            endpoint.handle(prog, &mut sink, ctx).await
        })
        .await
    }

    fn write_program(
        &self,
        prog: &Program,
        binary: bool,
    ) -> Result<(&'static str, Vec<u8>), RelayError> {
        if binary {
            let bytes = prog
                .to_bytes()
                .map_err(|e| RelayError::Emit(e.to_string()))?;
            Ok(("application/x-ail", bytes))
        } else {
            Ok(("text/plain; charset=utf-8", prog.disasm().into_bytes()))
        }
    }

    fn encode_chunk(&self, prog: &Program, binary: bool) -> Result<Vec<u8>, RelayError> {
        if binary {
            let bytes = prog
                .to_bytes()
                .map_err(|e| RelayError::Emit(e.to_string()))?;
            Ok(base64::engine::general_purpose::STANDARD
                .encode(bytes)
                .into_bytes())
        } else {
            Ok(prog.disasm().into_bytes())
        }
    }
}

fn is_input_binary(headers: &HeaderMap, body: &[u8]) -> bool {
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with("application/x-ail")
        || content_type.starts_with("application/octet-stream")
    {
        return true;
    }
    if content_type.starts_with("text/plain") || content_type.starts_with("text/x-ail") {
        return false;
    }
    Program::is_binary(body)
}

fn wants_binary_output(headers: &HeaderMap, input_binary: bool) -> bool {
    let accept = headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if accept.contains("application/x-ail") || accept.contains("application/octet-stream") {
        return true;
    }
    if accept.contains("text/plain") || accept.contains("text/x-ail") {
        return false;
    }
    // Default: mirror the input format.
    input_binary
}

#[async_trait]
impl EndpointHandler for AilEndpoint {
    async fn handle(
        self: Arc<Self>,
        mut prog: Program,
        sink: &mut dyn ResponseSink,
        mut ctx: RequestContext,
    ) -> Result<(), RelayError> {
        let router = self.gateway.router(&self.router_name)?.clone();
        let chain = request_preamble(&self.gateway, &mut prog, &mut ctx).await;

        chain.run_request_init(&ctx, &prog);

        let invoker = HandlerInvoker::new(self.clone(), Arc::new(AilParser));
        if chain
            .run_recursive_handlers(&invoker, &prog, sink, &ctx)
            .await?
        {
            return Ok(());
        }

        run_inference_pipeline(
            &self.gateway,
            &router,
            &chain,
            &prog,
            sink,
            &ctx,
            self.as_ref(),
        )
        .await
    }
}

#[async_trait]
impl ServeFormat for AilEndpoint {
    async fn serve_non_streaming(
        &self,
        provider: &Arc<Provider>,
        cmd: &Arc<dyn InferenceCommand>,
        chain: &PluginChain,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<(), RelayError> {
        let (upstream, res_prog) = match cmd.do_inference(provider, prog, ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(provider = %provider.name, error = %e, "inference error");
                chain.run_error(provider, ctx, prog, None, &e).await;
                return Err(e);
            }
        };

        let res_prog = chain
            .run_after(provider, ctx, prog, &upstream, res_prog)
            .await?;

        let (content_type, body) = self.write_program(&res_prog, ctx.binary_output)?;
        sink.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(content_type),
        );
        sink.write(&body).await?;
        sink.flush().await
    }

    async fn serve_streaming(
        &self,
        provider: &Arc<Provider>,
        cmd: &Arc<dyn InferenceCommand>,
        chain: &PluginChain,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<(), RelayError> {
        let mut writer = SseWriter::new(sink);
        writer.heartbeat("ok").await?;

        let (upstream, mut chunks) = match cmd.do_inference_stream(provider, prog, ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(provider = %provider.name, error = %e, "inference stream start failed");
                chain.run_error(provider, ctx, prog, None, &e).await;
                writer.error("start failed").await?;
                writer.done().await?;
                return Err(RelayError::StreamStart(e.to_string()));
            }
        };

        let mut assembled = Program::new();
        while let Some(item) = chunks.recv().await {
            match item {
                StreamItem::Error(e) => {
                    writer.error(&e.to_string()).await?;
                    chain
                        .run_error(provider, ctx, prog, Some(&upstream), &e)
                        .await;
                    return Ok(());
                }
                StreamItem::Chunk(chunk) => {
                    let chunk = match chain
                        .run_after_chunk(provider, ctx, prog, &upstream, chunk)
                        .await
                    {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            error!(error = %e, "chunk hook failed, dropping chunk");
                            continue;
                        }
                    };
                    assembled.append(&chunk);
                    match self.encode_chunk(&chunk, ctx.binary_output) {
                        Ok(frame) => writer.data(&frame).await?,
                        Err(e) => {
                            error!(error = %e, "chunk encode failed, skipping");
                            continue;
                        }
                    }
                }
            }
        }

        assembled.finalize_stream();
        chain
            .run_stream_end(provider, ctx, prog, &upstream, &assembled)
            .await;

        writer.done().await?;
        Ok(())
    }
}

/// Parses captured responses for recursive invocations, sniffing binary
/// AIL by its magic header.
pub struct AilParser;

impl ResponseParser for AilParser {
    fn parse_response(&self, data: &[u8]) -> Result<Program, RelayError> {
        if Program::is_binary(data) {
            return Program::from_bytes(data).map_err(|e| RelayError::BadWire(e.to_string()));
        }
        let text =
            std::str::from_utf8(data).map_err(|e| RelayError::BadWire(e.to_string()))?;
        // Streaming captures carry base64-encoded binary chunks.
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(text.trim()) {
            if Program::is_binary(&decoded) {
                return Program::from_bytes(&decoded)
                    .map_err(|e| RelayError::BadWire(e.to_string()));
            }
        }
        Program::asm(text).map_err(|e| RelayError::BadWire(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ail::Op;

    #[test]
    fn content_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!is_input_binary(&headers, b"set_model \"m\"\n"));
        assert!(is_input_binary(&headers, b"AIL\x00rest"));

        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/x-ail"),
        );
        assert!(is_input_binary(&headers, b"anything"));

        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/x-ail"),
        );
        assert!(!is_input_binary(&headers, b"AIL\x00rest"));

        let mut accept = HeaderMap::new();
        assert!(wants_binary_output(&accept, true));
        assert!(!wants_binary_output(&accept, false));
        accept.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/plain"),
        );
        assert!(!wants_binary_output(&accept, true));
    }

    #[test]
    fn parser_handles_all_encodings() {
        let mut prog = Program::new();
        prog.set_model("m");
        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleAssistant);
        prog.emit_text(Op::TxtChunk, "hi");
        prog.emit(Op::MsgEnd);

        let parser = AilParser;
        let binary = prog.to_bytes().unwrap();
        assert_eq!(parser.parse_response(&binary).unwrap(), prog);

        let text = prog.disasm();
        assert_eq!(parser.parse_response(text.as_bytes()).unwrap(), prog);

        let b64 = base64::engine::general_purpose::STANDARD.encode(&binary);
        assert_eq!(parser.parse_response(b64.as_bytes()).unwrap(), prog);
    }
}
