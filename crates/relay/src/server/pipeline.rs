//! The core engine: request preamble and the provider iteration loop
//! shared by every endpoint adapter.

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode};
use serde_json::json;
use tracing::{debug, error};

use ail::Program;

use crate::context::RequestContext;
use crate::drivers::InferenceCommand;
use crate::error::RelayError;
use crate::gateway::{Gateway, RouterDef};
use crate::plugin::PluginChain;
use crate::provider::Provider;
use crate::sink::ResponseSink;

use std::sync::Arc;

const MAX_REWRITE_DEPTH: usize = 10;

/// How an endpoint adapter writes responses: the wire endpoints emit via
/// their style codec (with stream conversion), the raw-IR endpoint
/// writes disassembly or base64 binary.
#[async_trait]
pub trait ServeFormat: Send + Sync {
    async fn serve_non_streaming(
        &self,
        provider: &Arc<Provider>,
        cmd: &Arc<dyn InferenceCommand>,
        chain: &PluginChain,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<(), RelayError>;

    async fn serve_streaming(
        &self,
        provider: &Arc<Provider>,
        cmd: &Arc<dyn InferenceCommand>,
        chain: &PluginChain,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<(), RelayError>;
}

/// Shared request setup: resolves model aliases by re-running the
/// rewrite loop until the model stabilizes (bounded depth), re-resolving
/// the plugin chain each iteration so plugins injected by a mapping are
/// picked up. A rewrite by a `virtual:*` plugin flags the exports bypass.
pub async fn request_preamble(
    gateway: &Gateway,
    prog: &mut Program,
    ctx: &mut RequestContext,
) -> PluginChain {
    ctx.ensure_trace_id();

    let mut model = prog.model().unwrap_or_default().to_string();
    let mut chain = gateway.registry.resolve_chain(&model);
    for _ in 0..MAX_REWRITE_DEPTH {
        let (rewritten, rewriter) = chain.run_model_rewrite(&model).await;
        if rewritten == model {
            break;
        }
        debug!(from = %model, to = %rewritten, rewriter = ?rewriter, "model rewritten");
        if rewriter
            .as_deref()
            .map(|name| name.starts_with("virtual:"))
            .unwrap_or(false)
        {
            ctx.exports_bypass = true;
        }
        model = rewritten;
        chain = gateway.registry.resolve_chain(&model);
    }
    prog.set_model(&model);

    debug!(
        trace_id = %ctx.trace_id,
        model = %model,
        plugins = chain.plugins().len(),
        "plugins resolved"
    );
    chain
}

/// The provider iteration loop: resolves candidates, filters exports,
/// runs Before plugins, sets the response headers, and delegates the
/// actual serve. The first error is remembered and surfaced only after
/// every candidate failed; exports-only rejection yields a structured
/// 404.
pub async fn run_inference_pipeline(
    gateway: &Gateway,
    router: &RouterDef,
    chain: &PluginChain,
    prog: &Program,
    sink: &mut dyn ResponseSink,
    ctx: &RequestContext,
    format: &dyn ServeFormat,
) -> Result<(), RelayError> {
    let (order, model) =
        gateway.resolve_order_and_model(router, prog.model().unwrap_or_default());
    debug!(model = %model, providers = ?order, "resolved providers");

    let mut display_err: Option<RelayError> = None;
    let mut model_not_exported = false;

    for name in &order {
        debug!(provider = %name, "trying provider");
        let Some(provider) = gateway.provider(name) else {
            error!(provider = %name, "provider not found");
            continue;
        };

        // Exports gate, skipped when a virtual provider rewrote the
        // model (virtual aliases may target non-exported models).
        if !ctx.exports_bypass && !provider.is_model_exported(&model) {
            debug!(provider = %name, model = %model, "model not exported, skipping");
            model_not_exported = true;
            continue;
        }

        let Some(cmd) = provider.inference() else {
            debug!(provider = %name, "provider does not support inference");
            continue;
        };

        let mut provider_prog = prog.clone();
        provider_prog.set_model(&model);

        let provider_prog = match chain.run_before(provider, ctx, provider_prog).await {
            Ok(prog) => prog,
            Err(e) => {
                error!(provider = %name, error = %e, "before hook aborted attempt");
                display_err.get_or_insert(e);
                continue;
            }
        };

        debug!(
            provider = %name,
            style = provider.style.as_str(),
            streaming = provider_prog.is_streaming(),
            "executing inference"
        );

        set_header(sink, "x-real-provider-id", name);
        set_header(sink, "x-real-model-id", &model);
        if let Some(executed) = chain.executed_header() {
            set_header(sink, "x-plugins-executed", &executed);
        }

        let result = if provider_prog.is_streaming() {
            format
                .serve_streaming(provider, &cmd, chain, &provider_prog, sink, ctx)
                .await
        } else {
            format
                .serve_non_streaming(provider, &cmd, chain, &provider_prog, sink, ctx)
                .await
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                display_err.get_or_insert(e);
                continue;
            }
        }
    }

    if let Some(e) = display_err {
        return Err(e);
    }

    // Every candidate was export-filtered: a clear 404 instead of an
    // empty response.
    if model_not_exported {
        sink.set_status(StatusCode::NOT_FOUND);
        sink.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = json!({
            "error": {
                "message": format!(
                    "The model `{model}` does not exist or you do not have access to it."
                ),
                "type": "invalid_request_error",
                "param": null,
                "code": "model_not_found",
            }
        });
        sink.write(&serde_json::to_vec(&body).unwrap_or_default())
            .await?;
        sink.flush().await?;
    }

    Ok(())
}

fn set_header(sink: &mut dyn ResponseSink, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        sink.headers_mut().insert(name, value);
    }
}
