//! Anthropic messages codec.

use serde_json::{json, Map, Value};

use super::chat_completions::{
    collect_text, content_text, emit_tool_def, find_text, tool_def_fields,
};
use super::{tool_delta, StyleCodec};
use crate::error::Error;
use crate::op::{Op, Role};
use crate::program::Program;

const STYLE: &str = "anthropic";

/// `max_tokens` is mandatory on the Anthropic wire; the IR does not model
/// it, so emission falls back to this.
const DEFAULT_MAX_TOKENS: u64 = 8192;

pub struct AnthropicCodec;

impl StyleCodec for AnthropicCodec {
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
                emit_tool_def(
                    &mut prog,
                    tool.get("name").and_then(Value::as_str).unwrap_or_default(),
                    tool.get("description").and_then(Value::as_str),
                    tool.get("input_schema"),
                );
            }
        }

        if let Some(system) = body.get("system") {
            let text = content_text(system);
            if !text.is_empty() {
                prog.emit(Op::MsgStart);
                prog.emit(Op::RoleSystem);
                prog.emit_text(Op::TxtChunk, text);
                prog.emit(Op::MsgEnd);
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
        body.insert("max_tokens".into(), json!(DEFAULT_MAX_TOKENS));
        if prog.is_streaming() {
            body.insert("stream".into(), json!(true));
        }

        let system = prog.system_prompt();
        if !system.is_empty() {
            body.insert("system".into(), json!(system));
        }

        let tools: Vec<Value> = tool_def_fields(prog)
            .into_iter()
            .map(|(name, description, schema)| {
                json!({
                    "name": name,
                    "description": description,
                    "input_schema": schema.unwrap_or(json!({"type": "object"})),
                })
            })
            .collect();
        if !tools.is_empty() {
            body.insert("tools".into(), Value::Array(tools));
        }

        let mut messages = Vec::new();
        for span in prog.messages() {
            match span.role {
                Some(Role::System) | None => continue,
                Some(Role::User) => messages.push(json!({
                    "role": "user",
                    "content": [{"type": "text", "text": prog.message_text(&span)}],
                })),
                Some(Role::Assistant) => {
                    messages.push(json!({
                        "role": "assistant",
                        "content": assistant_blocks(prog, &span),
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
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": call_id,
                            "content": data,
                        }],
                    }));
                }
            }
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

        let content = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::wire(STYLE, "missing content array"))?;

        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleAssistant);
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        prog.emit_text(Op::TxtChunk, text);
                    }
                }
                Some("thinking") => {
                    if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                        prog.emit(Op::ThinkStart);
                        prog.emit_text(Op::ThinkChunk, thinking);
                        prog.emit(Op::ThinkEnd);
                    }
                }
                Some("tool_use") => {
                    prog.emit_text(
                        Op::CallStart,
                        block.get("id").and_then(Value::as_str).unwrap_or_default(),
                    );
                    prog.emit_text(
                        Op::CallName,
                        block.get("name").and_then(Value::as_str).unwrap_or_default(),
                    );
                    prog.emit_json(
                        Op::CallArgs,
                        block.get("input").cloned().unwrap_or(json!({})),
                    );
                    prog.emit(Op::CallEnd);
                }
                _ => {}
            }
        }
        if let Some(reason) = body.get("stop_reason").and_then(Value::as_str) {
            prog.emit_text(Op::RespDone, reason);
        }
        prog.emit(Op::MsgEnd);
        Ok(prog)
    }

    fn parse_stream_chunk(&self, data: &[u8]) -> Result<Program, Error> {
        let body: Value =
            serde_json::from_slice(data).map_err(|e| Error::wire(STYLE, e.to_string()))?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::wire(STYLE, "stream event without type"))?;

        let mut prog = Program::new();
        match kind {
            "message_start" => {
                let message = body.get("message").unwrap_or(&Value::Null);
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    prog.emit_text(Op::RespId, id);
                }
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    prog.emit_text(Op::RespModel, model);
                }
                prog.emit(Op::StreamStart);
            }
            "content_block_start" => {
                let index = body.get("index").and_then(Value::as_i64).unwrap_or(0);
                let block = body.get("content_block").unwrap_or(&Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    prog.emit_json(
                        Op::StreamToolDelta,
                        tool_delta::build(
                            index,
                            block.get("id").and_then(Value::as_str),
                            block.get("name").and_then(Value::as_str),
                            None,
                        ),
                    );
                }
            }
            "content_block_delta" => {
                let index = body.get("index").and_then(Value::as_i64).unwrap_or(0);
                let delta = body.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            prog.emit_text(Op::StreamDelta, text);
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                            prog.emit_text(Op::StreamThinkDelta, thinking);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            prog.emit_json(
                                Op::StreamToolDelta,
                                tool_delta::build(index, None, None, Some(partial)),
                            );
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = body
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    prog.emit_text(Op::RespDone, reason);
                }
            }
            // content_block_stop / message_stop / ping carry no data.
            _ => {}
        }
        Ok(prog)
    }

    fn emit_response(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        let mut content = Vec::new();
        let thinking = collect_text(prog, Op::ThinkChunk);
        if !thinking.is_empty() {
            content.push(json!({"type": "thinking", "thinking": thinking}));
        }
        let text = collect_text(prog, Op::TxtChunk);
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
        for span in prog.tool_calls() {
            let mut input = json!({});
            for inst in &prog.code[span.start..=span.end] {
                if inst.op == Op::CallArgs {
                    input = inst.json.clone().unwrap_or(json!({}));
                }
            }
            content.push(json!({
                "type": "tool_use",
                "id": span.call_id,
                "name": span.name,
                "input": input,
            }));
        }

        let has_calls = !prog.tool_calls().is_empty();
        let stop_reason = match find_text(prog, Op::RespDone) {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ if has_calls => "tool_use".to_string(),
            _ => "end_turn".to_string(),
        };

        let mut body = Map::new();
        if let Some(id) = find_text(prog, Op::RespId) {
            body.insert("id".into(), json!(id));
        }
        body.insert("type".into(), json!("message"));
        body.insert("role".into(), json!("assistant"));
        if let Some(model) = find_text(prog, Op::RespModel) {
            body.insert("model".into(), json!(model));
        }
        body.insert("content".into(), Value::Array(content));
        body.insert("stop_reason".into(), json!(stop_reason));
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    /// Emits the single most natural Anthropic stream event for a chunk.
    /// Cross-style streams that need the full event choreography go
    /// through [`super::StreamConverter`] instead.
    fn emit_stream_chunk(&self, prog: &Program) -> Result<Vec<u8>, Error> {
        if prog.has_opcode(Op::StreamStart) {
            let mut message = Map::new();
            if let Some(id) = find_text(prog, Op::RespId) {
                message.insert("id".into(), json!(id));
            }
            message.insert("role".into(), json!("assistant"));
            if let Some(model) = find_text(prog, Op::RespModel) {
                message.insert("model".into(), json!(model));
            }
            return Ok(serde_json::to_vec(&json!({
                "type": "message_start",
                "message": Value::Object(message),
            }))?);
        }

        for inst in &prog.code {
            match inst.op {
                Op::StreamDelta => {
                    return Ok(serde_json::to_vec(&json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": inst.text},
                    }))?);
                }
                Op::StreamThinkDelta => {
                    return Ok(serde_json::to_vec(&json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "thinking_delta", "thinking": inst.text},
                    }))?);
                }
                Op::StreamToolDelta => {
                    let payload = inst.json.clone().unwrap_or(json!({}));
                    let index = tool_delta::index(&payload);
                    if let (Some(id), Some(name)) =
                        (tool_delta::id(&payload), tool_delta::name(&payload))
                    {
                        return Ok(serde_json::to_vec(&json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "tool_use", "id": id, "name": name},
                        }))?);
                    }
                    return Ok(serde_json::to_vec(&json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": tool_delta::arguments(&payload).unwrap_or_default(),
                        },
                    }))?);
                }
                Op::RespDone => {
                    return Ok(serde_json::to_vec(&json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": inst.text},
                    }))?);
                }
                _ => {}
            }
        }
        Ok(serde_json::to_vec(&json!({"type": "ping"}))?)
    }
}

fn assistant_blocks(prog: &Program, span: &crate::program::MessageSpan) -> Vec<Value> {
    let mut blocks = Vec::new();
    let mut text = String::new();
    let mut thinking = String::new();
    let mut current_call: Option<(String, String, Value)> = None;
    for inst in &prog.code[span.start..=span.end] {
        match inst.op {
            Op::TxtChunk => text.push_str(&inst.text),
            Op::ThinkChunk => thinking.push_str(&inst.text),
            Op::CallStart => current_call = Some((inst.text.clone(), String::new(), json!({}))),
            Op::CallName => {
                if let Some(call) = current_call.as_mut() {
                    call.1 = inst.text.clone();
                }
            }
            Op::CallArgs => {
                if let Some(call) = current_call.as_mut() {
                    call.2 = inst.json.clone().unwrap_or(json!({}));
                }
            }
            Op::CallEnd => {
                if let Some((id, name, input)) = current_call.take() {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    }));
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    if !thinking.is_empty() {
        out.push(json!({"type": "thinking", "thinking": thinking}));
    }
    if !text.is_empty() {
        out.push(json!({"type": "text", "text": text}));
    }
    out.extend(blocks);
    out
}

fn parse_message(prog: &mut Program, message: &Value) -> Result<(), Error> {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::from_str)
        .ok_or_else(|| Error::wire(STYLE, "message with missing or unknown role"))?;
    let content = message.get("content").unwrap_or(&Value::Null);

    match content {
        Value::String(text) => {
            prog.emit(Op::MsgStart);
            prog.emit(role.op());
            prog.emit_text(Op::TxtChunk, text.clone());
            prog.emit(Op::MsgEnd);
        }
        Value::Array(blocks) => {
            let mut text = String::new();
            let mut thinking = String::new();
            let mut calls = Vec::new();
            let mut results = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        text.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default())
                    }
                    Some("thinking") => thinking.push_str(
                        block
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    ),
                    Some("tool_use") => calls.push((
                        block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        block.get("input").cloned().unwrap_or(json!({})),
                    )),
                    Some("tool_result") => results.push((
                        block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        content_text(block.get("content").unwrap_or(&Value::Null)),
                    )),
                    _ => {}
                }
            }

            if !text.is_empty() || !thinking.is_empty() || !calls.is_empty() {
                prog.emit(Op::MsgStart);
                prog.emit(role.op());
                if !thinking.is_empty() {
                    prog.emit(Op::ThinkStart);
                    prog.emit_text(Op::ThinkChunk, thinking);
                    prog.emit(Op::ThinkEnd);
                }
                if !text.is_empty() {
                    prog.emit_text(Op::TxtChunk, text);
                }
                for (id, name, input) in calls {
                    prog.emit_text(Op::CallStart, id);
                    prog.emit_text(Op::CallName, name);
                    prog.emit_json(Op::CallArgs, input);
                    prog.emit(Op::CallEnd);
                }
                prog.emit(Op::MsgEnd);
            }
            // Tool results become standalone tool messages.
            for (call_id, data) in results {
                prog.emit(Op::MsgStart);
                prog.emit(Op::RoleTool);
                prog.emit_text(Op::ResultStart, call_id);
                prog.emit_text(Op::ResultData, data);
                prog.emit(Op::ResultEnd);
                prog.emit(Op::MsgEnd);
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styles::{codec_for, Style};

    fn codec() -> &'static dyn StyleCodec {
        codec_for(Style::Anthropic)
    }

    #[test]
    fn parse_request_with_system_and_tool_result() {
        let body = serde_json::to_vec(&json!({
            "model": "claude-3-opus",
            "max_tokens": 1024,
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "what time"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "now", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "12:00"}
                ]}
            ]
        }))
        .unwrap();
        let prog = codec().parse_request(&body).unwrap();
        assert_eq!(prog.model(), Some("claude-3-opus"));
        assert_eq!(prog.system_prompt(), "be terse");
        let msgs = prog.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[3].role, Some(Role::Tool));
        assert_eq!(prog.tool_calls().len(), 1);
        assert_eq!(prog.tool_results().len(), 1);
    }

    #[test]
    fn emit_request_maps_tool_results_to_user_blocks() {
        let mut prog = Program::new();
        prog.emit_text(Op::SetModel, "claude-3-opus");
        prog.emit(Op::MsgStart);
        prog.emit(Op::RoleTool);
        prog.emit_text(Op::ResultStart, "tu_1");
        prog.emit_text(Op::ResultData, "12:00");
        prog.emit(Op::ResultEnd);
        prog.emit(Op::MsgEnd);

        let body: Value =
            serde_json::from_slice(&codec().emit_request(&prog).unwrap()).unwrap();
        assert!(body.get("max_tokens").is_some());
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["type"], "tool_result");
        assert_eq!(msg["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn response_round_trip() {
        let body = serde_json::to_vec(&json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-opus",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "tu_2", "name": "now", "input": {"tz": "utc"}}
            ],
            "stop_reason": "tool_use"
        }))
        .unwrap();
        let prog = codec().parse_response(&body).unwrap();
        let emitted = codec().emit_response(&prog).unwrap();
        let reparsed = codec().parse_response(&emitted).unwrap();
        assert_eq!(reparsed, prog);
    }

    #[test]
    fn stream_events_parse() {
        let start = br#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-opus"}}"#;
        let prog = codec().parse_stream_chunk(start).unwrap();
        assert!(prog.has_opcode(Op::StreamStart));
        assert_eq!(find_text(&prog, Op::RespId), Some("msg_1"));

        let delta = br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"he"}}"#;
        let prog = codec().parse_stream_chunk(delta).unwrap();
        assert_eq!(collect_text(&prog, Op::StreamDelta), "he");

        let tool = br#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"now"}}"#;
        let prog = codec().parse_stream_chunk(tool).unwrap();
        assert!(prog.has_opcode(Op::StreamToolDelta));

        let args = br#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#;
        let prog = codec().parse_stream_chunk(args).unwrap();
        assert!(prog.has_opcode(Op::StreamToolDelta));

        let stop = br#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#;
        let prog = codec().parse_stream_chunk(stop).unwrap();
        assert_eq!(find_text(&prog, Op::RespDone), Some("end_turn"));

        let ping = br#"{"type":"ping"}"#;
        assert!(codec().parse_stream_chunk(ping).unwrap().is_empty());
    }
}
