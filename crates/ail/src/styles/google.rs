//! Google GenAI codec.
//!
//! The model name travels in the request URL rather than the body, so
//! `parse_request` leaves the program's model unset (the endpoint adapter
//! fills it in) and `emit_request` omits it. The wire has no tool-call
//! ids; the parser synthesizes `call_<n>` ids and tool results are matched
//! by function name.

use serde_json::{json, Map, Value};

use super::chat_completions::{collect_text, emit_tool_def, find_text, tool_def_fields};
use super::{tool_delta, StyleCodec};
use crate::error::Error;
use crate::op::{Op, Role};
use crate::program::Program;

const STYLE: &str = "google-genai";

pub struct GoogleGenAiCodec;

impl StyleCodec for GoogleGenAiCodec {
    fn parse_request(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;

        let mut prog = Program::new();

        if let Some(tools) = body.get("tools").and_then(Value::as_array) {
            for tool in tools {
                if let Some(decls) = tool.get("functionDeclarations").and_then(Value::as_array) {
                    for decl in decls {
                        emit_tool_def(
                            &mut prog,
                            decl.get("name").and_then(Value::as_str).unwrap_or_default(),
                            decl.get("description").and_then(Value::as_str),
                            decl.get("parameters"),
                        );
                    }
                }
            }
        }

        if let Some(system) = body.get("systemInstruction") {
            let text = parts_text(system.get("parts"));
            if !text.is_empty() {
                prog.emit(Op::MsgStart);
                prog.emit(Op::RoleSystem);
                prog.emit_text(Op::TxtChunk, text);
                prog.emit(Op::MsgEnd);
            }
        }

        let contents = body
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::wire(STYLE, "missing contents array"))?;

        let mut call_seq = 0usize;
        for content in contents {
            parse_content(&mut prog, content, &mut call_seq);
        }
        Ok(prog)
    }

    fn emit_request(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut body = Map::new();

        let system = prog.system_prompt();
        if !system.is_empty() {
            body.insert(
                "systemInstruction".into(),
                json!({"parts": [{"text": system}]}),
            );
        }

        let decls: Vec<Value> = tool_def_fields(prog)
            .into_iter()
            .map(|(name, description, schema)| {
                let mut decl = Map::new();
                decl.insert("name".into(), json!(name));
                if !description.is_empty() {
                    decl.insert("description".into(), json!(description));
                }
                if let Some(schema) = schema {
                    decl.insert("parameters".into(), schema);
                }
                Value::Object(decl)
            })
            .collect();
        if !decls.is_empty() {
            body.insert("tools".into(), json!([{"functionDeclarations": decls}]));
        }

        // Call-id → name table, for functionResponse emission.
        let call_names: Vec<(String, String)> = prog
            .tool_calls()
            .into_iter()
            .map(|span| (span.call_id, span.name))
            .collect();

        let mut contents = Vec::new();
        for span in prog.messages() {
            match span.role {
                Some(Role::System) | None => continue,
                Some(Role::User) => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": prog.message_text(&span)}],
                })),
                Some(Role::Assistant) => {
                    contents.push(json!({
                        "role": "model",
                        "parts": assistant_parts(prog, &span),
                    }));
                }
                Some(Role::Tool) => {
                    let mut call_id = String::new();
                    let mut data = String::new();
                    for inst in &prog.code[span.start..=span.end] {
                        match inst.op {
                            Op::ResultStart => call_id = inst.text.clone(),
                            Op::ResultData => data.push_str(&inst.text),
                            _ => {}
                        }
                    }
                    let name = call_names
                        .iter()
                        .find(|(id, _)| *id == call_id)
                        .map(|(_, name)| name.clone())
                        .unwrap_or_else(|| call_id.clone());
                    let response = serde_json::from_str::<Value>(&data)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({"result": data}));
                    contents.push(json!({
                        "role": "user",
                        "parts": [{"functionResponse": {"name": name, "response": response}}],
                    }));
                }
            }
        }
        body.insert("contents".into(), Value::Array(contents));
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    fn parse_response(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;

        let mut prog = Program::new();
        if let Some(model) = body.get("modelVersion").and_then(Value::as_str) {
            prog.emit_text(Op::RespModel, model);
        }

        let candidate = body
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .ok_or_else(|| Error::wire(STYLE, "missing candidates"))?;

        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleAssistant);
        let mut call_seq = 0usize;
        if let Some(parts) = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                emit_part(&mut prog, part, &mut call_seq);
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            prog.emit_text(Op::RespDone, reason);
        }
        prog.emit(Op::MsgEnd);
        Ok(prog)
    }

    fn parse_stream_chunk(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;

        let mut prog = Program::new();
        if let Some(model) = body.get("modelVersion").and_then(Value::as_str) {
            prog.emit_text(Op::RespModel, model);
        }
        let Some(candidate) = body
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
        else {
            return Ok(prog);
        };

        let mut call_seq = 0usize;
        if let Some(parts) = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    prog.emit_text(Op::StreamDelta, text);
                } else if let Some(call) = part.get("functionCall") {
                    let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                    let args = call.get("args").cloned().unwrap_or(json!({}));
                    let id = format!("call_{call_seq}");
                    call_seq += 1;
                    prog.emit_json(
                        Op::StreamToolDelta,
                        tool_delta::build(
                            (call_seq - 1) as i64,
                            Some(&id),
                            Some(name),
                            Some(&serde_json::to_string(&args)?),
                        ),
                    );
                }
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            prog.emit_text(Op::RespDone, reason);
        }
        Ok(prog)
    }

    fn emit_response(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut parts = Vec::new();
        let text = collect_text(prog, Op::TxtChunk);
        if !text.is_empty() {
            parts.push(json!({"text": text}));
        }
        for span in prog.tool_calls() {
            let mut args = json!({});
            for inst in &prog.code[span.start..=span.end] {
                if inst.op == Op::CallArgs {
                    args = inst.json.clone().unwrap_or(json!({}));
                }
            }
            parts.push(json!({"functionCall": {"name": span.name, "args": args}}));
        }

        let finish = match find_text(prog, Op::RespDone) {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ => "STOP".to_string(),
        };

        let mut body = Map::new();
        body.insert(
            "candidates".into(),
            json!([{
                "content": {"role": "model", "parts": parts},
                "finishReason": finish,
            }]),
        );
        if let Some(model) = find_text(prog, Op::RespModel) {
            body.insert("modelVersion".into(), json!(model));
        }
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    fn emit_stream_chunk(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut parts = Vec::new();
        let text = collect_text(prog, Op::StreamDelta);
        if !text.is_empty() {
            parts.push(json!({"text": text}));
        }
        for inst in &prog.code {
            if inst.op != Op::StreamToolDelta {
                continue;
            }
            let Some(payload) = &inst.json else { continue };
            if let Some(name) = tool_delta::name(payload) {
                let args = tool_delta::arguments(payload)
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                    .unwrap_or(json!({}));
                parts.push(json!({"functionCall": {"name": name, "args": args}}));
            }
        }

        let mut candidate = Map::new();
        candidate.insert(
            "content".into(),
            json!({"role": "model", "parts": parts}),
        );
        if let Some(reason) = find_text(prog, Op::RespDone) {
            candidate.insert("finishReason".into(), json!(reason));
        }

        let mut body = Map::new();
        body.insert("candidates".into(), json!([Value::Object(candidate)]));
        if let Some(model) = find_text(prog, Op::RespModel) {
            body.insert("modelVersion".into(), json!(model));
        }
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }
}

fn assistant_parts(prog: &Program, span: &crate::program::MessageSpan) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut current_call: Option<(String, Value)> = None;
    for inst in &prog.code[span.start..=span.end] {
        match inst.op {
            Op::TxtChunk => text.push_str(&inst.text),
            Op::CallName => current_call = Some((inst.text.clone(), json!({}))),
            Op::CallArgs => {
                if let Some(call) = current_call.as_mut() {
                    call.1 = inst.json.clone().unwrap_or(json!({}));
                }
            }
            Op::CallEnd => {
                if let Some((name, args)) = current_call.take() {
                    parts.push(json!({"functionCall": {"name": name, "args": args}}));
                }
            }
            _ => {}
        }
    }
    if !text.is_empty() {
        parts.insert(0, json!({"text": text}));
    }
    parts
}

fn parts_text(parts: Option<&Value>) -> String {
    let mut out = String::new();
    if let Some(parts) = parts.and_then(Value::as_array) {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
    }
    out
}

fn parse_content(prog: &mut Program, content: &Value, call_seq: &mut usize) {
    let role = match content.get("role").and_then(Value::as_str) {
        Some("model") => Role::Assistant,
        _ => Role::User,
    };
    let Some(parts) = content.get("parts").and_then(Value::as_array) else {
        return;
    };

    // functionResponse parts become standalone tool messages; everything
    // else stays in one message of the content's role.
    let mut results = Vec::new();
    let mut inner = Program::new();
    for part in parts {
        if let Some(response) = part.get("functionResponse") {
            results.push((
                response
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                response
                    .get("response")
                    .map(|v| serde_json::to_string(v).unwrap_or_default())
                    .unwrap_or_default(),
            ));
        } else {
            emit_part(&mut inner, part, call_seq);
        }
    }

    if !inner.is_empty() {
        prog.emit(Op::MsgStart);
        prog.emit(role.op());
        prog.append(&inner);
        prog.emit(Op::MsgEnd);
    }
    for (name, data) in results {
        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleTool);
        prog.emit_text(Op::ResultStart, name);
        prog.emit_text(Op::ResultData, data);
        prog.emit(Op::ResultEnd);
        prog.emit(Op::MsgEnd);
    }
}

fn emit_part(prog: &mut Program, part: &Value, call_seq: &mut usize) {
    if let Some(text) = part.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            prog.emit_text(Op::TxtChunk, text);
        }
    } else if let Some(call) = part.get("functionCall") {
        let id = format!("call_{call_seq}");
        *call_seq += 1;
        prog.emit_text(Op::CallStart, id);
        prog.emit_text(
            Op::CallName,
            call.get("name").and_then(Value::as_str).unwrap_or_default(),
        );
        prog.emit_json(Op::CallArgs, call.get("args").cloned().unwrap_or(json!({})));
        prog.emit(Op::CallEnd);
    }
}
