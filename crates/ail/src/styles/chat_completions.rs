//! OpenAI chat-completions codec.

use serde_json::{json, Map, Value};

use super::{tool_delta, StyleCodec};
use crate::error::Error;
use crate::op::{Op, Role};
use crate::program::Program;

const STYLE: &str = "chat-completions";

pub struct ChatCompletionsCodec;

impl StyleCodec for ChatCompletionsCodec {
    fn parse_request(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;

        let mut prog = Program::new();
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            prog.emit_text(Op::SetModel, model);
        }
        if body.get("stream").and_then(Value::as_bool) == Some(true) {
            prog.emit(Op::SetStream);
        }

        if let Some(tools) = body.get("tools").and_then(Value::as_array) {
            for tool in tools {
                let func = tool.get("function").unwrap_or(tool);
                emit_tool_def(
                    &mut prog,
                    func.get("name").and_then(Value::as_str).unwrap_or_default(),
                    func.get("description").and_then(Value::as_str),
                    func.get("parameters"),
                );
            }
        }

        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::wire(STYLE, "missing messages array"))?;
        for message in messages {
            parse_message(&mut prog, message)?;
        }
        Ok(prog)
    }

    fn emit_request(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut body = Map::new();
        if let Some(model) = prog.model() {
            body.insert("model".into(), json!(model));
        }
        if prog.is_streaming() {
            body.insert("stream".into(), json!(true));
        }

        let tools = emit_tool_defs(prog);
        if !tools.is_empty() {
            body.insert("tools".into(), Value::Array(tools));
        }

        let mut messages = Vec::new();
        for span in prog.messages() {
            messages.push(emit_message(prog, &span));
        }
        body.insert("messages".into(), Value::Array(messages));

        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    fn parse_response(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;

        let mut prog = Program::new();
        if let Some(id) = body.get("id").and_then(Value::as_str) {
            prog.emit_text(Op::RespId, id);
        }
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            prog.emit_text(Op::RespModel, model);
        }

        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or_else(|| Error::wire(STYLE, "missing choices"))?;
        let message = choice
            .get("message")
            .ok_or_else(|| Error::wire(STYLE, "missing choice message"))?;

        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleAssistant);
        if let Some(thinking) = message.get("reasoning_content").and_then(Value::as_str) {
            if !thinking.is_empty() {
                prog.emit(Op::ThinkStart);
                prog.emit_text(Op::ThinkChunk, thinking);
                prog.emit(Op::ThinkEnd);
            }
        }
        if let Some(content) = message.get("content") {
            let text = content_text(content);
            if !text.is_empty() {
                prog.emit_text(Op::TxtChunk, text);
            }
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                parse_tool_call(&mut prog, call);
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            prog.emit_text(Op::RespDone, reason);
        }
        prog.emit(Op::MsgEnd);
        Ok(prog)
    }

    fn parse_stream_chunk(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;

        let mut prog = Program::new();
        if let Some(id) = body.get("id").and_then(Value::as_str) {
            prog.emit_text(Op::RespId, id);
        }
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            prog.emit_text(Op::RespModel, model);
        }

        let Some(choice) = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            // Usage-only trailer chunks carry no choices.
            return Ok(prog);
        };

        if let Some(delta) = choice.get("delta") {
            if delta.get("role").and_then(Value::as_str).is_some() {
                prog.emit(Op::StreamStart);
            }
            if let Some(thinking) = delta.get("reasoning_content").and_then(Value::as_str) {
                if !thinking.is_empty() {
                    prog.emit_text(Op::StreamThinkDelta, thinking);
                }
            }
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    prog.emit_text(Op::StreamDelta, text);
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let func = call.get("function").unwrap_or(&Value::Null);
                    let delta = tool_delta::build(
                        call.get("index").and_then(Value::as_i64).unwrap_or(0),
                        call.get("id").and_then(Value::as_str),
                        func.get("name").and_then(Value::as_str),
                        func.get("arguments").and_then(Value::as_str),
                    );
                    prog.emit_json(Op::StreamToolDelta, delta);
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            prog.emit_text(Op::RespDone, reason);
        }
        Ok(prog)
    }

    fn emit_response(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut message = Map::new();
        message.insert("role".into(), json!("assistant"));

        let thinking = collect_text(prog, Op::ThinkChunk);
        if !thinking.is_empty() {
            message.insert("reasoning_content".into(), json!(thinking));
        }

        let text = collect_text(prog, Op::TxtChunk);
        message.insert(
            "content".into(),
            if text.is_empty() && !prog.tool_calls().is_empty() {
                Value::Null
            } else {
                json!(text)
            },
        );

        let calls = emit_tool_calls(prog);
        let has_calls = !calls.is_empty();
        if has_calls {
            message.insert("tool_calls".into(), Value::Array(calls));
        }

        let finish = finish_reason(prog, has_calls);
        let mut body = Map::new();
        if let Some(id) = find_text(prog, Op::RespId) {
            body.insert("id".into(), json!(id));
        }
        body.insert("object".into(), json!("chat.completion"));
        if let Some(model) = find_text(prog, Op::RespModel) {
            body.insert("model".into(), json!(model));
        }
        body.insert(
            "choices".into(),
            json!([{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": finish,
            }]),
        );
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    fn emit_stream_chunk(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut delta = Map::new();
        if prog.has_opcode(Op::StreamStart) {
            delta.insert("role".into(), json!("assistant"));
        }
        let thinking = collect_text(prog, Op::StreamThinkDelta);
        if !thinking.is_empty() {
            delta.insert("reasoning_content".into(), json!(thinking));
        }
        let text = collect_text(prog, Op::StreamDelta);
        if !text.is_empty() {
            delta.insert("content".into(), json!(text));
        }

        let mut calls = Vec::new();
        for inst in &prog.code {
            if inst.op != Op::StreamToolDelta {
                continue;
            }
            let Some(payload) = &inst.json else { continue };
            let mut call = Map::new();
            call.insert("index".into(), json!(tool_delta::index(payload)));
            if let Some(id) = tool_delta::id(payload) {
                call.insert("id".into(), json!(id));
                call.insert("type".into(), json!("function"));
            }
            let mut func = Map::new();
            if let Some(name) = tool_delta::name(payload) {
                func.insert("name".into(), json!(name));
            }
            if let Some(arguments) = tool_delta::arguments(payload) {
                func.insert("arguments".into(), json!(arguments));
            }
            call.insert("function".into(), Value::Object(func));
            calls.push(Value::Object(call));
        }
        if !calls.is_empty() {
            delta.insert("tool_calls".into(), Value::Array(calls));
        }

        let mut body = Map::new();
        if let Some(id) = find_text(prog, Op::RespId) {
            body.insert("id".into(), json!(id));
        }
        body.insert("object".into(), json!("chat.completion.chunk"));
        if let Some(model) = find_text(prog, Op::RespModel) {
            body.insert("model".into(), json!(model));
        }
        body.insert(
            "choices".into(),
            json!([{
                "index": 0,
                "delta": Value::Object(delta),
                "finish_reason": find_text(prog, Op::RespDone),
            }]),
        );
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }
}

// ── Shared helpers (also used by the other codecs) ──────────────────────

pub(crate) fn emit_tool_def(
    prog: &mut Program,
    name: &str,
    description: Option<&str>,
    schema: Option<&Value>,
) {
    prog.emit(Op::DefStart);
    prog.emit_text(Op::DefName, name);
    if let Some(description) = description {
        prog.emit_text(Op::DefDesc, description);
    }
    if let Some(schema) = schema {
        if !schema.is_null() {
            prog.emit_json(Op::DefSchema, schema.clone());
        }
    }
    prog.emit(Op::DefEnd);
}

/// Definitions as `(name, description, schema)` triples.
pub(crate) fn tool_def_fields(prog: &Program) -> Vec<(String, String, Option<Value>)> {
    let mut defs = Vec::new();
    for span in prog.tool_defs() {
        let mut description = String::new();
        let mut schema = None;
        for inst in &prog.code[span.start..=span.end] {
            match inst.op {
                Op::DefDesc => description = inst.text.clone(),
                Op::DefSchema => schema = inst.json.clone(),
                _ => {}
            }
        }
        defs.push((span.name.clone(), description, schema));
    }
    defs
}

pub(crate) fn find_text(prog: &Program, op: Op) -> Option<&str> {
    prog.code
        .iter()
        .find(|inst| inst.op == op)
        .map(|inst| inst.text.as_str())
}

pub(crate) fn collect_text(prog: &Program, op: Op) -> String {
    let mut out = String::new();
    for inst in &prog.code {
        if inst.op == op {
            out.push_str(&inst.text);
        }
    }
    out
}

pub(crate) fn finish_reason(prog: &Program, has_calls: bool) -> String {
    match find_text(prog, Op::RespDone) {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ if has_calls => "tool_calls".to_string(),
        _ => "stop".to_string(),
    }
}

/// Flattens string-or-parts message content to plain text.
pub(crate) fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn parse_message(prog: &mut Program, message: &Value) -> Result<(), Error> {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::from_str)
        .ok_or_else(|| Error::wire(STYLE, "message with missing or unknown role"))?;

    prog.emit(Op::MsgStart);
    prog.emit(role.op());

    match role {
        Role::Tool => {
            let call_id = message
                .get("tool_call_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            prog.emit_text(Op::ResultStart, call_id);
            prog.emit_text(
                Op::ResultData,
                content_text(message.get("content").unwrap_or(&Value::Null)),
            );
            prog.emit(Op::ResultEnd);
        }
        _ => {
            if let Some(thinking) = message.get("reasoning_content").and_then(Value::as_str) {
                if !thinking.is_empty() {
                    prog.emit(Op::ThinkStart);
                    prog.emit_text(Op::ThinkChunk, thinking);
                    prog.emit(Op::ThinkEnd);
                }
            }
            let text = content_text(message.get("content").unwrap_or(&Value::Null));
            if !text.is_empty() {
                prog.emit_text(Op::TxtChunk, text);
            }
            if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    parse_tool_call(prog, call);
                }
            }
        }
    }

    prog.emit(Op::MsgEnd);
    Ok(())
}

fn parse_tool_call(prog: &mut Program, call: &Value) {
    let func = call.get("function").unwrap_or(&Value::Null);
    prog.emit_text(
        Op::CallStart,
        call.get("id").and_then(Value::as_str).unwrap_or_default(),
    );
    prog.emit_text(
        Op::CallName,
        func.get("name").and_then(Value::as_str).unwrap_or_default(),
    );
    if let Some(arguments) = func.get("arguments").and_then(Value::as_str) {
        // The wire carries arguments as an encoded JSON string; keep the
        // raw text when it does not parse.
        let args = serde_json::from_str::<Value>(arguments)
            .unwrap_or_else(|_| Value::String(arguments.to_string()));
        prog.emit_json(Op::CallArgs, args);
    }
    prog.emit(Op::CallEnd);
}

fn emit_message(prog: &Program, span: &crate::program::MessageSpan) -> Value {
    let role = span.role.unwrap_or(Role::User);
    let mut message = Map::new();
    message.insert("role".into(), json!(role.as_str()));

    if role == Role::Tool {
        let mut call_id = String::new();
        let mut data = String::new();
        for inst in &prog.code[span.start..=span.end] {
            match inst.op {
                Op::ResultStart => call_id = inst.text.clone(),
                Op::ResultData => data.push_str(&inst.text),
                _ => {}
            }
        }
        message.insert("tool_call_id".into(), json!(call_id));
        message.insert("content".into(), json!(data));
        return Value::Object(message);
    }

    let mut text = String::new();
    let mut thinking = String::new();
    let mut calls = Vec::new();
    let mut current_call: Option<(String, String, Option<Value>)> = None;
    for inst in &prog.code[span.start..=span.end] {
        match inst.op {
            Op::TxtChunk => text.push_str(&inst.text),
            Op::ThinkChunk => thinking.push_str(&inst.text),
            Op::CallStart => current_call = Some((inst.text.clone(), String::new(), None)),
            Op::CallName => {
                if let Some(call) = current_call.as_mut() {
                    call.1 = inst.text.clone();
                }
            }
            Op::CallArgs => {
                if let Some(call) = current_call.as_mut() {
                    call.2 = inst.json.clone();
                }
            }
            Op::CallEnd => {
                if let Some((id, name, args)) = current_call.take() {
                    calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": encode_arguments(args.as_ref()),
                        },
                    }));
                }
            }
            _ => {}
        }
    }

    if !thinking.is_empty() {
        message.insert("reasoning_content".into(), json!(thinking));
    }
    message.insert(
        "content".into(),
        if text.is_empty() && !calls.is_empty() {
            Value::Null
        } else {
            json!(text)
        },
    );
    if !calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(calls));
    }
    Value::Object(message)
}

/// Serializes `CallArgs` back into the wire's string-encoded form.
pub(crate) fn encode_arguments(args: Option<&Value>) -> String {
    match args {
        Some(Value::String(raw)) => raw.clone(),
        Some(value) => serde_json::to_string(value).unwrap_or_default(),
        None => "{}".to_string(),
    }
}

fn emit_tool_defs(prog: &Program) -> Vec<Value> {
    tool_def_fields(prog)
        .into_iter()
        .map(|(name, description, schema)| {
            json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": description,
                    "parameters": schema.unwrap_or(json!({"type": "object", "properties": {}})),
                },
            })
        })
        .collect()
}

fn emit_tool_calls(prog: &Program) -> Vec<Value> {
    let mut calls = Vec::new();
    for span in prog.tool_calls() {
        let mut args = None;
        for inst in &prog.code[span.start..=span.end] {
            if inst.op == Op::CallArgs {
                args = inst.json.clone();
            }
        }
        calls.push(json!({
            "id": span.call_id,
            "type": "function",
            "function": {
                "name": span.name,
                "arguments": encode_arguments(args.as_ref()),
            },
        }));
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styles::codec_for;
    use crate::styles::Style;

    fn codec() -> &'static dyn StyleCodec {
        codec_for(Style::ChatCompletions)
    }

    #[test]
    fn parse_request_basic() {
        let body = br#"{"model":"prov/m","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let prog = codec().parse_request(body).unwrap();
        assert_eq!(prog.model(), Some("prov/m"));
        assert!(prog.is_streaming());
        let msgs = prog.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Some(Role::User));
        assert_eq!(prog.message_text(&msgs[0]), "hi");
    }

    #[test]
    fn parse_emit_request_round_trip() {
        let body = serde_json::to_vec(&json!({
            "model": "openai/gpt-4",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "what time is it"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "now", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "12:00"}
            ],
            "tools": [
                {"type": "function", "function": {
                    "name": "now", "description": "current time",
                    "parameters": {"type": "object", "properties": {}}
                }}
            ]
        }))
        .unwrap();

        let prog = codec().parse_request(&body).unwrap();
        let emitted = codec().emit_request(&prog).unwrap();
        let reparsed = codec().parse_request(&emitted).unwrap();
        assert_eq!(reparsed, prog);
    }

    #[test]
    fn parse_response_with_tool_calls() {
        let body = serde_json::to_vec(&json!({
            "id": "chatcmpl-1",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_9", "type": "function",
                        "function": {"name": "now", "arguments": "{\"tz\":\"utc\"}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        let prog = codec().parse_response(&body).unwrap();
        let calls = prog.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "call_9");
        assert_eq!(calls[0].name, "now");
        assert_eq!(find_text(&prog, Op::RespDone), Some("tool_calls"));

        let emitted = codec().emit_response(&prog).unwrap();
        let reparsed = codec().parse_response(&emitted).unwrap();
        assert_eq!(reparsed, prog);
    }

    #[test]
    fn parse_stream_chunk_deltas() {
        let first = br#"{"id":"c","model":"m","choices":[{"index":0,"delta":{"role":"assistant","content":"he"}}]}"#;
        let prog = codec().parse_stream_chunk(first).unwrap();
        assert!(prog.has_opcode(Op::StreamStart));
        assert_eq!(collect_text(&prog, Op::StreamDelta), "he");

        let done = br#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        let prog = codec().parse_stream_chunk(done).unwrap();
        assert_eq!(find_text(&prog, Op::RespDone), Some("stop"));

        let usage_only = br#"{"id":"c","usage":{"total_tokens":3},"choices":[]}"#;
        let prog = codec().parse_stream_chunk(usage_only).unwrap();
        assert!(!prog.has_opcode(Op::StreamDelta));
    }

    #[test]
    fn stream_chunk_emit_parse_round_trip() {
        let mut chunk = Program::new();
        chunk.emit_text(Op::RespId, "c1");
        chunk.emit_text(Op::RespModel, "m");
        chunk.emit(Op::StreamStart);
        chunk.emit_text(Op::StreamDelta, "hel");
        chunk.emit_json(Op::StreamToolDelta, tool_delta::build(0, Some("call_1"), Some("now"), Some("{")));
        let emitted = codec().emit_stream_chunk(&chunk).unwrap();
        let reparsed = codec().parse_stream_chunk(&emitted).unwrap();
        assert_eq!(reparsed, chunk);
    }

    #[test]
    fn malformed_request_is_bad_wire() {
        assert!(codec().parse_request(b"not json").is_err());
        assert!(codec().parse_request(br#"{"model":"m"}"#).is_err());
    }
}
