//! Cross-style stream conversion.
//!
//! A [`StreamConverter`] consumes provider-style chunk programs and
//! produces client-style wire frames. It owns the state this requires:
//! response metadata seen so far, whether the destination stream has been
//! opened, the currently open content block (for block-framed targets),
//! and partially accumulated tool calls (for targets that can only
//! represent complete calls). One input chunk may yield zero, one, or
//! several output frames.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{tool_delta, Style};
use crate::error::Error;
use crate::op::Op;
use crate::program::Program;

#[derive(Debug, Default)]
struct Meta {
    id: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Text,
    Thinking,
    Tool(i64),
}

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

/// One scanned delta from an input chunk program.
enum Delta {
    Start,
    Text(String),
    Thinking(String),
    Tool(Value),
    Done(String),
}

pub struct StreamConverter {
    #[allow(dead_code)]
    src: Style,
    dst: Style,
    meta: Meta,
    started: bool,
    block: Option<Block>,
    next_block_index: i64,
    pending_tools: BTreeMap<i64, PendingTool>,
    finished: bool,
}

impl StreamConverter {
    pub fn new(src: Style, dst: Style) -> Self {
        StreamConverter {
            src,
            dst,
            meta: Meta::default(),
            started: false,
            block: None,
            next_block_index: 0,
            pending_tools: BTreeMap::new(),
            finished: false,
        }
    }

    /// Feeds one provider-style chunk program; returns the client-style
    /// frames it produced. An error skips this chunk only; the converter
    /// remains usable.
    pub fn push_program(&mut self, chunk: &Program) -> Result<Vec<Vec<u8>>, Error> {
        let deltas = self.scan(chunk);
        match self.dst {
            Style::ChatCompletions => self.push_chat(deltas),
            Style::Anthropic => self.push_anthropic(deltas),
            Style::GoogleGenAi => self.push_google(deltas),
        }
    }

    /// Emits whatever is still buffered (tool calls pending completion,
    /// unterminated block framing).
    pub fn flush(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        match self.dst {
            Style::ChatCompletions => Ok(Vec::new()),
            Style::Anthropic => {
                let mut frames = Vec::new();
                if self.started && !self.finished {
                    self.close_block(&mut frames)?;
                    frames.push(serde_json::to_vec(&json!({"type": "message_stop"}))?);
                    self.finished = true;
                }
                Ok(frames)
            }
            Style::GoogleGenAi => {
                if self.finished || self.pending_tools.is_empty() {
                    return Ok(Vec::new());
                }
                let frame = self.google_tool_frame(None)?;
                Ok(vec![frame])
            }
        }
    }

    fn scan(&mut self, chunk: &Program) -> Vec<Delta> {
        let mut deltas = Vec::new();
        for inst in &chunk.code {
            match inst.op {
                Op::RespId => self.meta.id = Some(inst.text.clone()),
                Op::RespModel => self.meta.model = Some(inst.text.clone()),
                Op::StreamStart => deltas.push(Delta::Start),
                Op::StreamDelta => deltas.push(Delta::Text(inst.text.clone())),
                Op::StreamThinkDelta => deltas.push(Delta::Thinking(inst.text.clone())),
                Op::StreamToolDelta => {
                    if let Some(payload) = &inst.json {
                        deltas.push(Delta::Tool(payload.clone()));
                    }
                }
                Op::RespDone => deltas.push(Delta::Done(inst.text.clone())),
                _ => {}
            }
        }
        deltas
    }

    // ── chat-completions destination ────────────────────────────────────

    fn push_chat(&mut self, deltas: Vec<Delta>) -> Result<Vec<Vec<u8>>, Error> {
        if deltas.is_empty() {
            return Ok(Vec::new());
        }

        let mut delta = Map::new();
        let mut calls = Vec::new();
        let mut finish: Option<String> = None;

        if !self.started {
            // The opening chunk names the role exactly once.
            delta.insert("role".into(), json!("assistant"));
            self.started = true;
        }
        for item in deltas {
            match item {
                Delta::Start => {}
                Delta::Text(text) => append_str(&mut delta, "content", &text),
                Delta::Thinking(text) => append_str(&mut delta, "reasoning_content", &text),
                Delta::Tool(payload) => {
                    let mut call = Map::new();
                    call.insert("index".into(), json!(tool_delta::index(&payload)));
                    if let Some(id) = tool_delta::id(&payload) {
                        call.insert("id".into(), json!(id));
                        call.insert("type".into(), json!("function"));
                    }
                    let mut func = Map::new();
                    if let Some(name) = tool_delta::name(&payload) {
                        func.insert("name".into(), json!(name));
                    }
                    if let Some(arguments) = tool_delta::arguments(&payload) {
                        func.insert("arguments".into(), json!(arguments));
                    }
                    call.insert("function".into(), Value::Object(func));
                    calls.push(Value::Object(call));
                }
                Delta::Done(reason) => finish = Some(map_finish_chat(&reason)),
            }
        }
        if !calls.is_empty() {
            delta.insert("tool_calls".into(), Value::Array(calls));
        }

        if delta.is_empty() && finish.is_none() {
            return Ok(Vec::new());
        }

        let body = json!({
            "id": self.meta.id.clone().unwrap_or_default(),
            "object": "chat.completion.chunk",
            "model": self.meta.model.clone().unwrap_or_default(),
            "choices": [{
                "index": 0,
                "delta": Value::Object(delta),
                "finish_reason": finish,
            }],
        });
        Ok(vec![serde_json::to_vec(&body)?])
    }

    // ── Anthropic destination ───────────────────────────────────────────

    fn push_anthropic(&mut self, deltas: Vec<Delta>) -> Result<Vec<Vec<u8>>, Error> {
        let mut frames = Vec::new();
        for item in deltas {
            if !self.started {
                self.started = true;
                frames.push(serde_json::to_vec(&json!({
                    "type": "message_start",
                    "message": {
                        "id": self.meta.id.clone().unwrap_or_default(),
                        "role": "assistant",
                        "model": self.meta.model.clone().unwrap_or_default(),
                        "content": [],
                    },
                }))?);
            }
            match item {
                Delta::Start => {}
                Delta::Text(text) => {
                    self.ensure_block(Block::Text, &mut frames, None)?;
                    frames.push(serde_json::to_vec(&json!({
                        "type": "content_block_delta",
                        "index": self.next_block_index - 1,
                        "delta": {"type": "text_delta", "text": text},
                    }))?);
                }
                Delta::Thinking(text) => {
                    self.ensure_block(Block::Thinking, &mut frames, None)?;
                    frames.push(serde_json::to_vec(&json!({
                        "type": "content_block_delta",
                        "index": self.next_block_index - 1,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }))?);
                }
                Delta::Tool(payload) => {
                    let source_index = tool_delta::index(&payload);
                    let opens = tool_delta::name(&payload).is_some()
                        || tool_delta::id(&payload).is_some();
                    if opens {
                        self.ensure_block(Block::Tool(source_index), &mut frames, Some(&payload))?;
                    }
                    if let Some(arguments) = tool_delta::arguments(&payload) {
                        if self.block != Some(Block::Tool(source_index)) {
                            // Arguments for a block that was never opened
                            // (source started mid-stream): open it bare.
                            self.ensure_block(
                                Block::Tool(source_index),
                                &mut frames,
                                Some(&payload),
                            )?;
                        }
                        frames.push(serde_json::to_vec(&json!({
                            "type": "content_block_delta",
                            "index": self.next_block_index - 1,
                            "delta": {"type": "input_json_delta", "partial_json": arguments},
                        }))?);
                    }
                }
                Delta::Done(reason) => {
                    self.close_block(&mut frames)?;
                    frames.push(serde_json::to_vec(&json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": map_finish_anthropic(&reason)},
                    }))?);
                    frames.push(serde_json::to_vec(&json!({"type": "message_stop"}))?);
                    self.finished = true;
                }
            }
        }
        Ok(frames)
    }

    fn ensure_block(
        &mut self,
        wanted: Block,
        frames: &mut Vec<Vec<u8>>,
        tool_payload: Option<&Value>,
    ) -> Result<(), Error> {
        if self.block == Some(wanted) {
            return Ok(());
        }
        self.close_block(frames)?;
        let index = self.next_block_index;
        self.next_block_index += 1;
        let content_block = match wanted {
            Block::Text => json!({"type": "text", "text": ""}),
            Block::Thinking => json!({"type": "thinking", "thinking": ""}),
            Block::Tool(_) => {
                let payload = tool_payload.cloned().unwrap_or(json!({}));
                json!({
                    "type": "tool_use",
                    "id": tool_delta::id(&payload).unwrap_or_default(),
                    "name": tool_delta::name(&payload).unwrap_or_default(),
                })
            }
        };
        frames.push(serde_json::to_vec(&json!({
            "type": "content_block_start",
            "index": index,
            "content_block": content_block,
        }))?);
        self.block = Some(wanted);
        Ok(())
    }

    fn close_block(&mut self, frames: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        if self.block.take().is_some() {
            frames.push(serde_json::to_vec(&json!({
                "type": "content_block_stop",
                "index": self.next_block_index - 1,
            }))?);
        }
        Ok(())
    }

    // ── Google GenAI destination ────────────────────────────────────────

    fn push_google(&mut self, deltas: Vec<Delta>) -> Result<Vec<Vec<u8>>, Error> {
        let mut frames = Vec::new();
        let mut text = String::new();
        let mut finish: Option<String> = None;

        for item in deltas {
            match item {
                Delta::Start => self.started = true,
                Delta::Text(chunk) => text.push_str(&chunk),
                // Thinking has no GenAI representation; dropped.
                Delta::Thinking(_) => {}
                Delta::Tool(payload) => {
                    // Buffer until the stream ends: GenAI only carries
                    // complete functionCall parts.
                    let entry = self
                        .pending_tools
                        .entry(tool_delta::index(&payload))
                        .or_default();
                    if let Some(id) = tool_delta::id(&payload) {
                        entry.id = id.to_string();
                    }
                    if let Some(name) = tool_delta::name(&payload) {
                        entry.name = name.to_string();
                    }
                    if let Some(arguments) = tool_delta::arguments(&payload) {
                        entry.arguments.push_str(arguments);
                    }
                }
                Delta::Done(reason) => finish = Some(map_finish_google(&reason)),
            }
        }

        if !text.is_empty() {
            frames.push(self.google_text_frame(&text)?);
        }
        if let Some(reason) = finish {
            let frame = self.google_tool_frame(Some(&reason))?;
            frames.push(frame);
            self.finished = true;
        }
        Ok(frames)
    }

    fn google_text_frame(&self, text: &str) -> Result<Vec<u8>, Error> {
        let mut body = Map::new();
        body.insert(
            "candidates".into(),
            json!([{"content": {"role": "model", "parts": [{"text": text}]}}]),
        );
        if let Some(model) = &self.meta.model {
            body.insert("modelVersion".into(), json!(model));
        }
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }

    /// The terminal frame: any buffered complete tool calls plus the
    /// finish reason.
    fn google_tool_frame(&mut self, finish: Option<&str>) -> Result<Vec<u8>, Error> {
        let mut parts = Vec::new();
        for (_, tool) in std::mem::take(&mut self.pending_tools) {
            let args = serde_json::from_str::<Value>(&tool.arguments).unwrap_or(json!({}));
            parts.push(json!({"functionCall": {"name": tool.name, "args": args}}));
        }
        let mut candidate = Map::new();
        candidate.insert(
            "content".into(),
            json!({"role": "model", "parts": parts}),
        );
        candidate.insert(
            "finishReason".into(),
            json!(finish.unwrap_or("STOP")),
        );
        let mut body = Map::new();
        body.insert("candidates".into(), json!([Value::Object(candidate)]));
        if let Some(model) = &self.meta.model {
            body.insert("modelVersion".into(), json!(model));
        }
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }
}

fn append_str(map: &mut Map<String, Value>, key: &str, text: &str) {
    if let Some(Value::String(existing)) = map.get_mut(key) {
        existing.push_str(text);
        return;
    }
    map.insert(key.to_string(), json!(text));
}

fn map_finish_chat(reason: &str) -> String {
    match reason {
        "end_turn" | "STOP" | "stop_sequence" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        "max_tokens" | "MAX_TOKENS" => "length".to_string(),
        other => other.to_string(),
    }
}

fn map_finish_anthropic(reason: &str) -> String {
    match reason {
        "stop" | "STOP" => "end_turn".to_string(),
        "tool_calls" => "tool_use".to_string(),
        "length" | "MAX_TOKENS" => "max_tokens".to_string(),
        other => other.to_string(),
    }
}

fn map_finish_google(reason: &str) -> String {
    match reason {
        "stop" | "end_turn" | "stop_sequence" | "tool_calls" | "tool_use" => "STOP".to_string(),
        "length" | "max_tokens" => "MAX_TOKENS".to_string(),
        other => other.to_string(),
    }
}
