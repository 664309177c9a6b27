//! The shared endpoint adapter for vendor wire styles (chat completions,
//! Anthropic messages, Google GenAI). Parses the request into AIL, runs
//! the preamble and recursive handlers, and serves provider responses
//! back in the client's style, converting streams across styles when
//! the provider speaks a different one.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tracing::error;

use ail::{codec_for, Program, StreamConverter, Style};

use crate::context::RequestContext;
use crate::drivers::{InferenceCommand, StreamItem};
use crate::error::RelayError;
use crate::gateway::Gateway;
use crate::plugin::{EndpointHandler, HandlerInvoker, PluginChain, ResponseParser};
use crate::provider::Provider;
use crate::sink::{write_error, ResponseSink};
use crate::sse::SseWriter;

use super::pipeline::{request_preamble, run_inference_pipeline, ServeFormat};
use super::respond;

/// Overrides applied after parsing, for styles that carry routing data
/// in the URL (Google GenAI).
pub struct ModelOverride {
    pub model: String,
    pub streaming: bool,
}

pub struct WireEndpoint {
    gateway: Arc<Gateway>,
    style: Style,
    router_name: String,
}

impl WireEndpoint {
    pub fn new(gateway: Arc<Gateway>, style: Style, router_name: impl Into<String>) -> Arc<Self> {
        Arc::new(WireEndpoint {
            gateway,
            style,
            router_name: router_name.into(),
        })
    }

    /// The axum-facing entry: parse, collect auth, then run the handler
    /// behind a live sink.
    pub async fn serve_http(
        self: Arc<Self>,
        headers: HeaderMap,
        body: Bytes,
        model_override: Option<ModelOverride>,
    ) -> axum::response::Response {
        let codec = codec_for(self.style);
        let mut prog = match codec.parse_request(&body) {
            Ok(prog) => prog,
            Err(e) => {
                error!(style = %self.style, error = %e, "request parse failed");
                return respond::plain_error(StatusCode::BAD_REQUEST, &format!("invalid request: {e}"));
            }
        };
        if let Some(over) = model_override {
            prog.set_model(over.model);
            prog.set_streaming(over.streaming);
        }

        let bearer = match self.gateway.auth.collect_incoming(&headers) {
            Ok(bearer) => bearer,
            Err(e) => return respond::plain_error(e.status(), &e.to_string()),
        };

        let mut ctx = RequestContext::new();
        ctx.bearer = bearer;
        ctx.client_style = Some(self.style);
        ctx.ensure_trace_id();

        let endpoint = self.clone();
        respond::run_to_response(move |mut sink| async move {
            endpoint.handle(prog, &mut sink, ctx).await
        })
        .await
    }
}

#[async_trait]
impl EndpointHandler for WireEndpoint {
    async fn handle(
        self: Arc<Self>,
        mut prog: Program,
        sink: &mut dyn ResponseSink,
        mut ctx: RequestContext,
    ) -> Result<(), RelayError> {
        let router = self.gateway.router(&self.router_name)?.clone();
        let chain = request_preamble(&self.gateway, &mut prog, &mut ctx).await;

        chain.run_request_init(&ctx, &prog);

        let invoker = HandlerInvoker::new(self.clone(), Arc::new(WireParser(self.style)));
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
impl ServeFormat for WireEndpoint {
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

        let res_prog = match chain
            .run_after(provider, ctx, prog, &upstream, res_prog)
            .await
        {
            Ok(prog) => prog,
            Err(e) => {
                // An After failure is terminal for the request, not a
                // reason to fail over.
                error!(error = %e, "after hook failed");
                write_error(sink, StatusCode::INTERNAL_SERVER_ERROR, "plugin error").await?;
                return Ok(());
            }
        };

        let body = match codec_for(self.style).emit_response(&res_prog) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "response emission failed");
                write_error(
                    sink,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "response emission error",
                )
                .await?;
                return Ok(());
            }
        };

        sink.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
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
        let provider_style = provider.style.wire().ok_or_else(|| {
            RelayError::Provider(format!("provider {} has no wire style", provider.name))
        })?;

        let mut writer = SseWriter::new(sink);
        writer.heartbeat("ok").await?;

        let mut converter = StreamConverter::new(provider_style, self.style);

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
                    // Mid-stream failure: report on the wire, no failover.
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

                    match converter.push_program(&chunk) {
                        Ok(frames) => {
                            for frame in frames {
                                writer.data(&frame).await?;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "stream conversion failed, skipping chunk");
                            continue;
                        }
                    }
                }
            }
        }

        match converter.flush() {
            Ok(frames) => {
                for frame in frames {
                    writer.data(&frame).await?;
                }
            }
            Err(e) => error!(error = %e, "stream converter flush failed"),
        }

        assembled.finalize_stream();
        chain
            .run_stream_end(provider, ctx, prog, &upstream, &assembled)
            .await;

        writer.done().await?;
        Ok(())
    }
}

/// Response parser injected into the invoker for capture-based recursive
/// plugins.
pub struct WireParser(pub Style);

impl ResponseParser for WireParser {
    fn parse_response(&self, data: &[u8]) -> Result<Program, RelayError> {
        codec_for(self.0)
            .parse_response(data)
            .map_err(|e| RelayError::BadWire(e.to_string()))
    }

    fn parse_stream_data(&self, data: &[u8]) -> Result<Program, RelayError> {
        codec_for(self.0)
            .parse_stream_chunk(data)
            .map_err(|e| RelayError::BadWire(e.to_string()))
    }
}
