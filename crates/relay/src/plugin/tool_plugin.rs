//! Composable base for on-router tools.
//!
//! A [`ToolHandler`] supplies a name, tool definitions, and a call
//! dispatcher; [`ToolPlugin`] turns it into a full plugin by composing
//! the existing capabilities: a Before hook that injects the definitions
//! and a RecursiveHandler that captures the provider response, dispatches
//! matching calls locally, appends synthetic tool results, and re-invokes
//! inference up to `max_rounds` times. Client-owned tool calls pass
//! through untouched: their captured response is replayed verbatim.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use ail::{Instruction, Op, Program};

use super::{BeforeHook, HandlerInvoker, Plugin, RecursiveHandler};
use crate::context::RequestContext;
use crate::error::RelayError;
use crate::provider::Provider;
use crate::sink::{ResponseCapture, ResponseSink};

/// Request-scoped state available to tool handlers.
pub struct ToolCallContext<'a> {
    pub trace_id: &'a str,
    /// The original (pre-tool-injection) request program.
    pub request: &'a Program,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Unique tool name; doubles as the plugin identifier.
    fn tool_name(&self) -> &str;

    /// AIL instructions for this tool's definitions, injected during the
    /// Before phase.
    fn tool_defs(&self, params: &str) -> Vec<Instruction>;

    /// Executes a call. `Ok(None)` means the call was not actually for
    /// this handler.
    async fn handle_tool_call(
        &self,
        params: &str,
        call_id: &str,
        args: Option<&Value>,
        tcx: &ToolCallContext<'_>,
    ) -> Result<Option<String>, RelayError>;
}

/// Builds a complete `DefStart..DefEnd` sequence from structured data.
pub fn build_tool_def(name: &str, description: &str, schema: Option<Value>) -> Vec<Instruction> {
    let mut insts = vec![
        Instruction::new(Op::DefStart),
        Instruction::with_text(Op::DefName, name),
        Instruction::with_text(Op::DefDesc, description),
    ];
    if let Some(schema) = schema {
        insts.push(Instruction::with_json(Op::DefSchema, schema));
    }
    insts.push(Instruction::new(Op::DefEnd));
    insts
}

const DEFAULT_MAX_ROUNDS: usize = 10;

pub struct ToolPlugin<H> {
    pub handler: H,
    /// Bound on the tool-call dispatch loop.
    pub max_rounds: usize,
}

impl<H: ToolHandler> ToolPlugin<H> {
    pub fn new(handler: H) -> Self {
        ToolPlugin {
            handler,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    fn guard_key(&self) -> String {
        format!("tool:{}", self.handler.tool_name())
    }

    /// Inserts tool definitions after the last existing `DefEnd`, else
    /// before the first message, else at the end.
    pub fn inject_defs(&self, params: &str, mut prog: Program) -> Program {
        let defs = self.handler.tool_defs(params);
        if defs.is_empty() {
            return prog;
        }
        if let Some(last_def_end) = prog
            .code
            .iter()
            .rposition(|inst| inst.op == Op::DefEnd)
        {
            prog.insert_after(last_def_end, defs);
            return prog;
        }
        match prog.messages().first() {
            Some(span) => {
                let at = span.start;
                prog.insert_before(at, defs);
            }
            None => prog.code.extend(defs),
        }
        prog
    }

    /// The capture/dispatch/re-invoke loop.
    pub async fn run_recursive(
        &self,
        params: &str,
        invoker: &HandlerInvoker,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<bool, RelayError> {
        // Re-entry guard: inside our own invocation the inner pipeline
        // runs the normal (non-recursive) flow.
        if ctx.has_guard(&self.guard_key()) {
            return Ok(false);
        }
        let guarded = ctx.with_guard(&self.guard_key());
        let max_rounds = if self.max_rounds == 0 {
            DEFAULT_MAX_ROUNDS
        } else {
            self.max_rounds
        };

        let tcx = ToolCallContext {
            trace_id: &ctx.trace_id,
            request: prog,
        };

        // First round: run the normal pipeline, capturing the raw
        // response (the full SSE byte stream when the request streams).
        let mut capture = ResponseCapture::new();
        if invoker.invoke(prog, &mut capture, &guarded).await.is_err() {
            // Pipeline failed; let the caller deal with it.
            return Ok(false);
        }

        let res_prog = match invoker.parse_captured(&capture) {
            Ok(res_prog) => res_prog,
            Err(_) => {
                replay_capture(&capture, sink).await?;
                return Ok(true);
            }
        };

        let (result_insts, handled) = self.dispatch_calls(params, &res_prog, &tcx).await;
        if handled == 0 {
            // No calls for us; client-provided tool calls pass through.
            replay_capture(&capture, sink).await?;
            return Ok(true);
        }

        debug!(
            tool = %self.handler.tool_name(),
            streaming = prog.is_streaming(),
            dispatched = handled,
            "handling on-router tool calls"
        );

        let mut current = prog.clone();
        for span in res_prog.messages() {
            current.append(&res_prog.extract_message(&span));
        }
        current.code.extend(result_insts);

        for round in 1..max_rounds {
            debug!(tool = %self.handler.tool_name(), round, "re-invoking inference");

            capture = ResponseCapture::new();
            invoker.invoke(&current, &mut capture, &guarded).await?;

            let res_prog = match invoker.parse_captured(&capture) {
                Ok(res_prog) => res_prog,
                Err(_) => {
                    replay_capture(&capture, sink).await?;
                    return Ok(true);
                }
            };

            let (result_insts, handled) = self.dispatch_calls(params, &res_prog, &tcx).await;
            if handled == 0 {
                // Model finished; replay the final captured response.
                replay_capture(&capture, sink).await?;
                return Ok(true);
            }

            for span in res_prog.messages() {
                current.append(&res_prog.extract_message(&span));
            }
            current.code.extend(result_insts);
        }

        warn!(
            tool = %self.handler.tool_name(),
            max_rounds,
            "tool dispatch rounds exhausted"
        );
        replay_capture(&capture, sink).await?;
        Ok(true)
    }

    /// Dispatches response tool calls that match this handler's defined
    /// names; returns synthetic tool-result instructions and the count.
    async fn dispatch_calls(
        &self,
        params: &str,
        res_prog: &Program,
        tcx: &ToolCallContext<'_>,
    ) -> (Vec<Instruction>, usize) {
        let mut names = Vec::new();
        for inst in self.handler.tool_defs(params) {
            if inst.op == Op::DefName {
                names.push(inst.text);
            }
        }

        let mut results = Vec::new();
        let mut handled = 0usize;
        for call in res_prog.tool_calls() {
            if !names.iter().any(|name| *name == call.name) {
                continue;
            }
            let args = res_prog.code[call.start..=call.end]
                .iter()
                .find(|inst| inst.op == Op::CallArgs)
                .and_then(|inst| inst.json.as_ref());

            debug!(tool = %call.name, call_id = %call.call_id, "dispatching on-router call");
            let result = match self
                .handler
                .handle_tool_call(params, &call.call_id, args, tcx)
                .await
            {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool handler failed");
                    format!("error: {e}")
                }
            };

            handled += 1;
            results.extend([
                Instruction::new(Op::MsgStart),
                Instruction::new(Op::RoleTool),
                Instruction::with_text(Op::ResultStart, call.call_id.clone()),
                Instruction::with_text(Op::ResultData, result),
                Instruction::new(Op::ResultEnd),
                Instruction::new(Op::MsgEnd),
            ]);
        }
        (results, handled)
    }
}

/// Replays a captured response (status, headers, body) to the real sink.
pub async fn replay_capture(
    capture: &ResponseCapture,
    sink: &mut dyn ResponseSink,
) -> Result<(), RelayError> {
    if let Some(status) = capture.status {
        sink.set_status(status);
    }
    for (name, value) in capture.headers.iter() {
        sink.headers_mut().insert(name.clone(), value.clone());
    }
    sink.write(&capture.body).await?;
    sink.flush().await
}

impl<H: ToolHandler + 'static> Plugin for ToolPlugin<H> {
    fn name(&self) -> &str {
        self.handler.tool_name()
    }

    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }

    fn as_recursive(&self) -> Option<&dyn RecursiveHandler> {
        Some(self)
    }
}

#[async_trait]
impl<H: ToolHandler + 'static> BeforeHook for ToolPlugin<H> {
    async fn before(
        &self,
        params: &str,
        _provider: &Provider,
        _ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        Ok(self.inject_defs(params, prog))
    }
}

#[async_trait]
impl<H: ToolHandler + 'static> RecursiveHandler for ToolPlugin<H> {
    async fn recursive_handler(
        &self,
        params: &str,
        invoker: &HandlerInvoker,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<bool, RelayError> {
        self.run_recursive(params, invoker, prog, sink, ctx).await
    }
}
