//! `logger`: request/response observability as a `+logger` suffix.

use async_trait::async_trait;
use tracing::{debug, info};

use ail::Program;

use crate::context::RequestContext;
use crate::drivers::UpstreamMeta;
use crate::error::RelayError;
use crate::plugin::{AfterHook, BeforeHook, ErrorHook, Plugin, StreamEndHook};
use crate::provider::Provider;

pub struct Logger;

impl Plugin for Logger {
    fn name(&self) -> &str {
        "logger"
    }

    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }

    fn as_after(&self) -> Option<&dyn AfterHook> {
        Some(self)
    }

    fn as_stream_end(&self) -> Option<&dyn StreamEndHook> {
        Some(self)
    }

    fn as_error(&self) -> Option<&dyn ErrorHook> {
        Some(self)
    }
}

#[async_trait]
impl BeforeHook for Logger {
    async fn before(
        &self,
        _params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        info!(
            trace_id = %ctx.trace_id,
            provider = %provider.name,
            model = prog.model().unwrap_or(""),
            messages = prog.count_messages(),
            streaming = prog.is_streaming(),
            "request"
        );
        Ok(prog)
    }
}

#[async_trait]
impl AfterHook for Logger {
    async fn after(
        &self,
        _params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        _req_prog: &Program,
        upstream: &UpstreamMeta,
        res_prog: Program,
    ) -> Result<Program, RelayError> {
        info!(
            trace_id = %ctx.trace_id,
            provider = %provider.name,
            status = %upstream.status,
            messages = res_prog.count_messages(),
            tool_calls = res_prog.tool_calls().len(),
            "response"
        );
        Ok(res_prog)
    }
}

#[async_trait]
impl StreamEndHook for Logger {
    async fn stream_end(
        &self,
        _params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        _req_prog: &Program,
        _upstream: &UpstreamMeta,
        assembled: &Program,
    ) -> Result<(), RelayError> {
        debug!(
            trace_id = %ctx.trace_id,
            provider = %provider.name,
            chunks = assembled.len(),
            "stream complete"
        );
        Ok(())
    }
}

#[async_trait]
impl ErrorHook for Logger {
    async fn on_error(
        &self,
        _params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        _req_prog: &Program,
        _upstream: Option<&UpstreamMeta>,
        error: &RelayError,
    ) -> Result<(), RelayError> {
        info!(
            trace_id = %ctx.trace_id,
            provider = %provider.name,
            error = %error,
            "provider call failed"
        );
        Ok(())
    }
}
