//! `dspy`: bridges inference to an external DSPy sidecar process.
//!
//! Model-suffix syntax:
//!
//!   +dspy                 kind=cot, signature "history, question -> answer"
//!   +dspy:react           ReAct agent (tool use)
//!   +dspy:cot:a%20->%20b  custom signature (URL-encoded)
//!
//! The sidecar listens at `DSPY_SIDECAR_URL` (default
//! `http://localhost:8780`) and may issue loop-back inference calls
//! through the gateway; a per-plugin context guard keeps those from
//! re-entering this handler. `DSPY_TIMEOUT` (seconds) bounds each call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, error};

use ail::{codec_for, Op, Program, Role, Style};

use crate::context::RequestContext;
use crate::error::RelayError;
use crate::plugin::{HandlerInvoker, Plugin, RecursiveHandler};
use crate::sink::{write_error, ResponseSink};
use crate::sse::{self, SseWriter};

const DEFAULT_KIND: &str = "cot";
const DEFAULT_SIGNATURE: &str = "history, question -> answer";
const DEFAULT_SIDECAR_URL: &str = "http://localhost:8780";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const GUARD: &str = "dspy";

const VALID_KINDS: &[&str] = &["predict", "cot", "react", "rlm"];

pub struct Dspy {
    client: reqwest::Client,
}

impl Dspy {
    pub fn new(client: reqwest::Client) -> Self {
        Dspy { client }
    }
}

impl Plugin for Dspy {
    fn name(&self) -> &str {
        "dspy"
    }

    fn as_recursive(&self) -> Option<&dyn RecursiveHandler> {
        Some(self)
    }
}

#[async_trait]
impl RecursiveHandler for Dspy {
    async fn recursive_handler(
        &self,
        params: &str,
        _invoker: &HandlerInvoker,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<bool, RelayError> {
        // Inside a sidecar loop-back call, let the normal pipeline run.
        if ctx.has_guard(GUARD) {
            return Ok(false);
        }

        let (kind, signature) = parse_params(params);
        if !VALID_KINDS.contains(&kind.as_str()) {
            error!(kind = %kind, "unknown dspy kind");
            write_error(
                sink,
                StatusCode::BAD_REQUEST,
                &format!("dspy: unknown kind {kind:?}"),
            )
            .await?;
            return Ok(true);
        }

        let payload = build_sidecar_payload(&kind, &signature, prog)?;
        let style = ctx.client_style.unwrap_or(Style::ChatCompletions);

        let result = if prog.is_streaming() {
            self.handle_streaming(&payload, ctx, style, sink).await
        } else {
            self.handle_non_streaming(&payload, ctx, style, sink).await
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(error = %e, "dspy sidecar call failed");
                Err(RelayError::plugin("dspy", e))
            }
        }
    }
}

impl Dspy {
    fn sidecar_request(
        &self,
        payload: &SidecarRequest,
        ctx: &RequestContext,
        streaming: bool,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/invoke", sidecar_url()))
            .timeout(sidecar_timeout())
            .json(payload);
        if streaming {
            request = request.header(http::header::ACCEPT, "text/event-stream");
        }
        // Forward the caller's credential so the sidecar's loop-back
        // inference is attributed to the same user.
        if let Some(bearer) = &ctx.bearer {
            request = request.header("X-Upstream-Authorization", format!("Bearer {bearer}"));
        }
        request
    }

    async fn handle_non_streaming(
        &self,
        payload: &SidecarRequest,
        ctx: &RequestContext,
        style: Style,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), RelayError> {
        let mut payload = payload.clone();
        payload.stream = false;

        let response = self.sidecar_request(&payload, ctx, false).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Internal(format!(
                "sidecar returned {status}: {body}"
            )));
        }
        let sidecar: SidecarResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Internal(format!("decode sidecar response: {e}")))?;

        let res_prog =
            build_response_program(&payload.model, &payload.signature, &sidecar, &ctx.trace_id);
        let body = codec_for(style)
            .emit_response(&res_prog)
            .map_err(|e| RelayError::Emit(e.to_string()))?;

        sink.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        if let Ok(kind) = http::HeaderValue::from_str(&payload.kind) {
            sink.headers_mut().insert("x-dspy-kind", kind);
        }
        sink.write(&body).await?;
        sink.flush().await
    }

    async fn handle_streaming(
        &self,
        payload: &SidecarRequest,
        ctx: &RequestContext,
        style: Style,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), RelayError> {
        let mut payload = payload.clone();
        payload.stream = true;

        let response = self.sidecar_request(&payload, ctx, true).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Internal(format!(
                "sidecar returned {status}: {body}"
            )));
        }

        if let Ok(kind) = http::HeaderValue::from_str(&payload.kind) {
            sink.headers_mut().insert("x-dspy-kind", kind);
        }
        let mut writer = SseWriter::new(sink);
        writer.heartbeat("ok").await?;

        let codec = codec_for(style);
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let reader = StreamReader::new(stream);
        let mut lines = FramedRead::new(reader, LinesCodec::new());

        let mut chunk_index = 0usize;
        let mut stream_error: Option<RelayError> = None;

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    writer.error(&e.to_string()).await?;
                    stream_error = Some(RelayError::Internal(e.to_string()));
                    break;
                }
            };
            let Some(data) = sse::data_line(&line) else {
                continue;
            };
            if data == sse::DONE {
                break;
            }
            if data.is_empty() {
                continue;
            }
            let event: SidecarStreamEvent = match serde_json::from_str(data) {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable sidecar event");
                    continue;
                }
            };

            match event.kind.as_str() {
                "chunk" => {
                    let chunk = build_stream_chunk(
                        &payload.model,
                        &event.field,
                        &event.text,
                        chunk_index == 0,
                    );
                    match codec.emit_stream_chunk(&chunk) {
                        Ok(frame) => {
                            writer.data(&frame).await?;
                            chunk_index += 1;
                        }
                        Err(e) => debug!(error = %e, "emit stream chunk failed"),
                    }
                }
                "status" => {
                    // Surfaces as an SSE comment: standard clients ignore
                    // it, aware clients can show progress.
                    writer.heartbeat(&format!("status {}", event.message)).await?;
                }
                "tool_call" => {
                    let chunk = build_stream_tool_call(&payload.model, &event);
                    if let Ok(frame) = codec.emit_stream_chunk(&chunk) {
                        writer.data(&frame).await?;
                    }
                }
                "prediction" => {
                    // dspy.streamify may skip incremental deltas and emit
                    // only a final prediction; surface its content as
                    // stream chunks so the client receives actual data.
                    if chunk_index == 0 {
                        if let Some(outputs) = &event.outputs {
                            let (_, output_fields) = parse_signature_fields(&payload.signature);
                            if let Some(reasoning) =
                                outputs.get("reasoning").filter(|r| !r.is_empty())
                            {
                                let chunk = build_stream_chunk(
                                    &payload.model,
                                    "reasoning",
                                    reasoning,
                                    chunk_index == 0,
                                );
                                if let Ok(frame) = codec.emit_stream_chunk(&chunk) {
                                    writer.data(&frame).await?;
                                    chunk_index += 1;
                                }
                            }
                            for field in output_fields {
                                if field == "reasoning" {
                                    continue;
                                }
                                let Some(text) = outputs.get(&field).filter(|t| !t.is_empty())
                                else {
                                    continue;
                                };
                                let chunk = build_stream_chunk(
                                    &payload.model,
                                    &field,
                                    text,
                                    chunk_index == 0,
                                );
                                if let Ok(frame) = codec.emit_stream_chunk(&chunk) {
                                    writer.data(&frame).await?;
                                    chunk_index += 1;
                                }
                            }
                        }
                    }
                }
                "error" => {
                    let message = if event.message.is_empty() {
                        "unknown sidecar error".to_string()
                    } else {
                        event.message.clone()
                    };
                    writer.error(&message).await?;
                    stream_error =
                        Some(RelayError::Internal(format!("sidecar stream error: {message}")));
                }
                _ => {}
            }
        }

        writer.done().await?;
        match stream_error {
            // The SSE error frame was already written; surface the error
            // for logging only.
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Params and signature parsing ────────────────────────────────────────

/// Splits `kind:signature`, both optional; the signature may be
/// URL-encoded.
fn parse_params(params: &str) -> (String, String) {
    let mut kind = DEFAULT_KIND.to_string();
    let mut signature = DEFAULT_SIGNATURE.to_string();
    if params.is_empty() {
        return (kind, signature);
    }
    let (head, rest) = match params.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (params, None),
    };
    if !head.is_empty() {
        kind = head.to_string();
    }
    if let Some(rest) = rest {
        if !rest.is_empty() {
            signature = percent_decode(rest);
        }
    }
    (kind, signature)
}

/// Minimal %XX decoding for signature params.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 3 <= bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or_default();
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| raw.to_string())
}

/// Removes `+dspy` and any trailing params from a model name so the
/// sidecar's loop-back calls don't re-trigger this plugin.
fn strip_dspy_suffix(model: &str) -> String {
    match model.find("+dspy") {
        Some(at) => model[..at].to_string(),
        None => model.to_string(),
    }
}

/// Splits `"a, b -> c, d"` into input and output field names, stripping
/// `field: type` annotations.
fn parse_signature_fields(signature: &str) -> (Vec<String>, Vec<String>) {
    let Some((left, right)) = signature.split_once("->") else {
        return (vec!["question".into()], vec!["answer".into()]);
    };
    let clean = |side: &str| -> Vec<String> {
        side.split(',')
            .map(|field| {
                let field = field.trim();
                match field.split_once(':') {
                    Some((name, _)) => name.trim().to_string(),
                    None => field.to_string(),
                }
            })
            .filter(|field| !field.is_empty())
            .collect()
    };
    let mut inputs = clean(left);
    let mut outputs = clean(right);
    if inputs.is_empty() {
        inputs = vec!["question".into()];
    }
    if outputs.is_empty() {
        outputs = vec!["answer".into()];
    }
    (inputs, outputs)
}

// ── Sidecar wire types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct SidecarRequest {
    kind: String,
    signature: String,
    inputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<SidecarToolDef>,
    model: String,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct SidecarToolDef {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    #[serde(default)]
    outputs: HashMap<String, String>,
    #[serde(default)]
    tool_calls: Vec<SidecarToolCall>,
}

#[derive(Debug, Deserialize)]
struct SidecarToolCall {
    id: String,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SidecarStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    field: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    tool_args: Option<Value>,
    #[serde(default)]
    outputs: Option<HashMap<String, String>>,
}

// ── Payload building ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HistoryMessage {
    role: &'static str,
    content: String,
}

fn build_history(prog: &Program) -> Vec<HistoryMessage> {
    let mut history = Vec::new();
    for span in prog.messages() {
        let Some(role) = span.role else { continue };
        let text = prog.message_text(&span);
        if text.is_empty() {
            continue;
        }
        history.push(HistoryMessage {
            role: match role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            },
            content: text,
        });
    }
    history
}

fn build_sidecar_payload(
    kind: &str,
    signature: &str,
    prog: &Program,
) -> Result<SidecarRequest, RelayError> {
    let (input_fields, _) = parse_signature_fields(signature);
    let history = build_history(prog);

    let mut inputs = HashMap::new();
    for field in input_fields {
        match field.as_str() {
            "history" => {
                let serialized = serde_json::to_string(&history)
                    .map_err(|e| RelayError::Internal(format!("marshal history: {e}")))?;
                inputs.insert(field, serialized);
            }
            "context" => {
                inputs.insert(field, prog.system_prompt());
            }
            _ => {
                // "question" and unknown fields map to the last user
                // message.
                if let Some(span) = prog.last_user_message() {
                    inputs.insert(field, prog.message_text(&span));
                }
            }
        }
    }

    // ReAct receives the program's tool definitions.
    let mut tools = Vec::new();
    if kind == "react" {
        for def in prog.tool_defs() {
            let mut tool = SidecarToolDef {
                name: def.name.clone(),
                description: String::new(),
                schema: None,
            };
            for inst in &prog.code[def.start..=def.end] {
                match inst.op {
                    Op::DefDesc => tool.description = inst.text.clone(),
                    Op::DefSchema => tool.schema = inst.json.clone(),
                    _ => {}
                }
            }
            tools.push(tool);
        }
    }

    Ok(SidecarRequest {
        kind: kind.to_string(),
        signature: signature.to_string(),
        inputs,
        tools,
        model: strip_dspy_suffix(prog.model().unwrap_or_default()),
        stream: false,
    })
}

// ── Response building ───────────────────────────────────────────────────

fn build_response_program(
    model: &str,
    signature: &str,
    response: &SidecarResponse,
    trace_id: &str,
) -> Program {
    let (_, output_fields) = parse_signature_fields(signature);

    let mut prog = Program::new();
    prog.emit_text(Op::RespId, format!("dspy-{trace_id}"));
    prog.emit_text(Op::RespModel, model);
    prog.emit(Op::MsgStart);
    prog.emit(Op::RoleAssistant);

    if let Some(reasoning) = response.outputs.get("reasoning").filter(|r| !r.is_empty()) {
        prog.emit(Op::ThinkStart);
        prog.emit_text(Op::ThinkChunk, reasoning.clone());
        prog.emit(Op::ThinkEnd);
    }

    let mut text_parts = Vec::new();
    for field in &output_fields {
        if field == "reasoning" {
            continue;
        }
        if let Some(value) = response.outputs.get(field) {
            text_parts.push(value.clone());
        }
    }
    if !text_parts.is_empty() {
        prog.emit_text(Op::TxtChunk, text_parts.join("\n"));
    }

    if response.tool_calls.is_empty() {
        prog.emit_text(Op::RespDone, "stop");
    } else {
        for call in &response.tool_calls {
            prog.emit_text(Op::CallStart, call.id.clone());
            prog.emit_text(Op::CallName, call.name.clone());
            if let Some(args) = &call.args {
                prog.emit_json(Op::CallArgs, args.clone());
            }
            prog.emit(Op::CallEnd);
        }
        prog.emit_text(Op::RespDone, "tool_calls");
    }
    prog.emit(Op::MsgEnd);
    prog
}

fn build_stream_chunk(model: &str, field: &str, text: &str, first: bool) -> Program {
    let mut prog = Program::new();
    prog.emit_text(Op::RespModel, model);
    if first {
        prog.emit(Op::StreamStart);
    }
    if field == "reasoning" {
        prog.emit_text(Op::StreamThinkDelta, text);
    } else {
        prog.emit_text(Op::StreamDelta, text);
    }
    prog
}

fn build_stream_tool_call(model: &str, event: &SidecarStreamEvent) -> Program {
    let mut prog = Program::new();
    prog.emit_text(Op::RespModel, model);
    let mut delta = json!({
        "index": 0,
        "id": event.call_id,
        "name": event.tool_name,
    });
    if let Some(args) = &event.tool_args {
        delta["arguments"] = json!(serde_json::to_string(args).unwrap_or_default());
    }
    prog.emit_json(Op::StreamToolDelta, delta);
    prog
}

// ── Config helpers ──────────────────────────────────────────────────────

fn sidecar_url() -> String {
    std::env::var("DSPY_SIDECAR_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_SIDECAR_URL.to_string())
}

fn sidecar_timeout() -> Duration {
    std::env::var("DSPY_TIMEOUT")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_defaults_and_custom_signature() {
        assert_eq!(
            parse_params(""),
            (DEFAULT_KIND.to_string(), DEFAULT_SIGNATURE.to_string())
        );
        assert_eq!(
            parse_params("react"),
            ("react".to_string(), DEFAULT_SIGNATURE.to_string())
        );
        let (kind, signature) = parse_params("cot:context,%20question%20->%20answer");
        assert_eq!(kind, "cot");
        assert_eq!(signature, "context, question -> answer");
    }

    #[test]
    fn signature_field_parsing() {
        let (inputs, outputs) = parse_signature_fields("history, question -> answer");
        assert_eq!(inputs, vec!["history", "question"]);
        assert_eq!(outputs, vec!["answer"]);

        let (inputs, outputs) = parse_signature_fields("question: str -> answer: str, notes");
        assert_eq!(inputs, vec!["question"]);
        assert_eq!(outputs, vec!["answer", "notes"]);

        let (inputs, outputs) = parse_signature_fields("nonsense");
        assert_eq!(inputs, vec!["question"]);
        assert_eq!(outputs, vec!["answer"]);
    }

    #[test]
    fn model_suffix_stripping() {
        assert_eq!(strip_dspy_suffix("openai/gpt-4+dspy:cot"), "openai/gpt-4");
        assert_eq!(strip_dspy_suffix("openai/gpt-4"), "openai/gpt-4");
    }

    #[test]
    fn payload_extracts_inputs_and_tools() {
        let mut prog = Program::new();
        prog.set_model("openai/gpt-4+dspy:react");
        prog.code.extend(crate::plugin::build_tool_def(
            "now",
            "current time",
            Some(json!({"type": "object"})),
        ));
        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleSystem);
        prog.emit_text(Op::TxtChunk, "be terse");
        prog.emit(Op::MsgEnd);
        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleUser);
        prog.emit_text(Op::TxtChunk, "what time is it");
        prog.emit(Op::MsgEnd);

        let payload =
            build_sidecar_payload("react", "context, question -> answer", &prog).unwrap();
        assert_eq!(payload.model, "openai/gpt-4");
        assert_eq!(payload.inputs.get("context").unwrap(), "be terse");
        assert_eq!(payload.inputs.get("question").unwrap(), "what time is it");
        assert_eq!(payload.tools.len(), 1);
        assert_eq!(payload.tools[0].name, "now");
    }

    #[test]
    fn response_program_shapes() {
        let mut outputs = HashMap::new();
        outputs.insert("reasoning".to_string(), "hmm".to_string());
        outputs.insert("answer".to_string(), "42".to_string());
        let response = SidecarResponse {
            outputs,
            tool_calls: vec![],
        };
        let prog =
            build_response_program("m", "question -> answer", &response, "trace-1");
        assert!(prog.has_opcode(Op::ThinkChunk));
        let msgs = prog.messages();
        assert_eq!(prog.message_text(&msgs[0]), "42");

        let with_calls = SidecarResponse {
            outputs: HashMap::new(),
            tool_calls: vec![SidecarToolCall {
                id: "c1".into(),
                name: "now".into(),
                args: Some(json!({})),
            }],
        };
        let prog = build_response_program("m", "question -> answer", &with_calls, "trace-2");
        assert_eq!(prog.tool_calls().len(), 1);
    }
}
