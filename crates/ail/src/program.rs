use serde_json::Value;

use crate::op::{Op, Role};

/// A single AIL instruction: an opcode plus its operands. `text` is empty
/// and `json` is `None` when the opcode carries no such operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub text: String,
    pub json: Option<Value>,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Instruction {
            op,
            text: String::new(),
            json: None,
        }
    }

    pub fn with_text(op: Op, text: impl Into<String>) -> Self {
        Instruction {
            op,
            text: text.into(),
            json: None,
        }
    }

    pub fn with_json(op: Op, json: Value) -> Self {
        Instruction {
            op,
            text: String::new(),
            json: Some(json),
        }
    }
}

/// Span of one message (`MsgStart`..=`MsgEnd`) inside a program.
///
/// Spans hold indices into [`Program::code`] and become stale on any
/// mutation of the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSpan {
    pub start: usize,
    /// Index of the matching `MsgEnd`, inclusive.
    pub end: usize,
    pub role: Option<Role>,
}

/// Span of one tool call (`CallStart`..=`CallEnd`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpan {
    pub start: usize,
    pub end: usize,
    pub call_id: String,
    pub name: String,
}

/// Span of one tool result (`ResultStart`..=`ResultEnd`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSpan {
    pub start: usize,
    pub end: usize,
    pub call_id: String,
}

/// Span of one tool definition (`DefStart`..=`DefEnd`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefSpan {
    pub start: usize,
    pub end: usize,
    pub name: String,
}

/// An AIL program: an ordered instruction vector plus a side table of
/// binary buffers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub buffers: Vec<Vec<u8>>,
}

/// Open structures at the end of a program, for stream folding.
#[derive(Debug, Default, Clone, Copy)]
struct TailState {
    open_msg: bool,
    open_think: bool,
    open_call: bool,
    /// The open message came from a plain `MsgStart` being copied, not
    /// from delta folding; its instructions pass through untouched.
    plain_msg: bool,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    // ── Emit helpers ────────────────────────────────────────────────────

    pub fn emit(&mut self, op: Op) -> &mut Self {
        self.code.push(Instruction::new(op));
        self
    }

    pub fn emit_text(&mut self, op: Op, text: impl Into<String>) -> &mut Self {
        self.code.push(Instruction::with_text(op, text));
        self
    }

    pub fn emit_json(&mut self, op: Op, json: Value) -> &mut Self {
        self.code.push(Instruction::with_json(op, json));
        self
    }

    // ── Configuration accessors ─────────────────────────────────────────

    /// The effective model: the most recent `SetModel`, if any.
    pub fn model(&self) -> Option<&str> {
        self.code
            .iter()
            .rev()
            .find(|inst| inst.op == Op::SetModel)
            .map(|inst| inst.text.as_str())
    }

    /// Replaces the most recent `SetModel`, or inserts one at the front.
    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        if let Some(inst) = self
            .code
            .iter_mut()
            .rev()
            .find(|inst| inst.op == Op::SetModel)
        {
            inst.text = model;
        } else {
            self.code.insert(0, Instruction::with_text(Op::SetModel, model));
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.has_opcode(Op::SetStream)
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        if streaming {
            if !self.is_streaming() {
                let at = self
                    .code
                    .iter()
                    .position(|inst| inst.op != Op::SetModel)
                    .unwrap_or(self.code.len());
                self.code.insert(at, Instruction::new(Op::SetStream));
            }
        } else {
            self.code.retain(|inst| inst.op != Op::SetStream);
        }
    }

    pub fn has_opcode(&self, op: Op) -> bool {
        self.code.iter().any(|inst| inst.op == op)
    }

    // ── Derived spans ───────────────────────────────────────────────────

    /// Ordered message spans, computed by a fresh scan.
    pub fn messages(&self) -> Vec<MessageSpan> {
        let mut spans = Vec::new();
        let mut open: Option<MessageSpan> = None;
        for (i, inst) in self.code.iter().enumerate() {
            match inst.op {
                Op::MsgStart => {
                    open = Some(MessageSpan {
                        start: i,
                        end: i,
                        role: None,
                    });
                }
                Op::MsgEnd => {
                    if let Some(mut span) = open.take() {
                        span.end = i;
                        spans.push(span);
                    }
                }
                op => {
                    if let (Some(span), Some(role)) = (open.as_mut(), Role::from_op(op)) {
                        if span.role.is_none() {
                            span.role = Some(role);
                        }
                    }
                }
            }
        }
        spans
    }

    /// Ordered tool-call spans.
    pub fn tool_calls(&self) -> Vec<CallSpan> {
        let mut spans = Vec::new();
        let mut open: Option<CallSpan> = None;
        for (i, inst) in self.code.iter().enumerate() {
            match inst.op {
                Op::CallStart => {
                    open = Some(CallSpan {
                        start: i,
                        end: i,
                        call_id: inst.text.clone(),
                        name: String::new(),
                    });
                }
                Op::CallName => {
                    if let Some(span) = open.as_mut() {
                        span.name = inst.text.clone();
                    }
                }
                Op::CallEnd => {
                    if let Some(mut span) = open.take() {
                        span.end = i;
                        spans.push(span);
                    }
                }
                _ => {}
            }
        }
        spans
    }

    /// Ordered tool-result spans.
    pub fn tool_results(&self) -> Vec<ResultSpan> {
        let mut spans = Vec::new();
        let mut open: Option<ResultSpan> = None;
        for (i, inst) in self.code.iter().enumerate() {
            match inst.op {
                Op::ResultStart => {
                    open = Some(ResultSpan {
                        start: i,
                        end: i,
                        call_id: inst.text.clone(),
                    });
                }
                Op::ResultEnd => {
                    if let Some(mut span) = open.take() {
                        span.end = i;
                        spans.push(span);
                    }
                }
                _ => {}
            }
        }
        spans
    }

    /// Ordered tool-definition spans.
    pub fn tool_defs(&self) -> Vec<DefSpan> {
        let mut spans = Vec::new();
        let mut open: Option<DefSpan> = None;
        for (i, inst) in self.code.iter().enumerate() {
            match inst.op {
                Op::DefStart => {
                    open = Some(DefSpan {
                        start: i,
                        end: i,
                        name: String::new(),
                    });
                }
                Op::DefName => {
                    if let Some(span) = open.as_mut() {
                        span.name = inst.text.clone();
                    }
                }
                Op::DefEnd => {
                    if let Some(mut span) = open.take() {
                        span.end = i;
                        spans.push(span);
                    }
                }
                _ => {}
            }
        }
        spans
    }

    // ── Manipulation ────────────────────────────────────────────────────

    /// Appends another program, folding streaming deltas into message
    /// form: text deltas become `TxtChunk`s of an open assistant message,
    /// thinking deltas a thinking block, tool-call deltas accumulate into
    /// complete `CallStart..CallEnd` blocks (argument fragments buffer as
    /// a string until the call closes), and `RespDone` terminates the
    /// message. Appending the chunk sequence of a streamed response
    /// therefore yields the same messages the non-streaming response
    /// would contain. Plain (non-streaming) instructions append as-is.
    pub fn append(&mut self, other: &Program) {
        let mut state = self.tail_state();
        for inst in &other.code {
            match inst.op {
                Op::StreamStart => {
                    self.ensure_open_message(&mut state);
                }
                Op::StreamDelta => {
                    self.ensure_open_message(&mut state);
                    self.close_open_think(&mut state);
                    self.merge_text_tail(Op::TxtChunk, &inst.text);
                }
                Op::StreamThinkDelta => {
                    self.ensure_open_message(&mut state);
                    if !state.open_think {
                        self.code.push(Instruction::new(Op::ThinkStart));
                        state.open_think = true;
                    }
                    self.merge_text_tail(Op::ThinkChunk, &inst.text);
                }
                Op::StreamToolDelta => {
                    self.ensure_open_message(&mut state);
                    self.close_open_think(&mut state);
                    let payload = inst.json.clone().unwrap_or(Value::Null);
                    let id = payload.get("id").and_then(Value::as_str);
                    let name = payload.get("name").and_then(Value::as_str);
                    let index = payload.get("index").and_then(Value::as_i64).unwrap_or(0);
                    // A delta naming the call opens a new block; bare
                    // argument fragments extend the open one.
                    if id.is_some() || name.is_some() {
                        self.close_open_call(&mut state);
                        self.code.push(Instruction::with_text(
                            Op::CallStart,
                            id.map(str::to_string)
                                .unwrap_or_else(|| format!("call_{index}")),
                        ));
                        self.code
                            .push(Instruction::with_text(Op::CallName, name.unwrap_or_default()));
                        state.open_call = true;
                    }
                    if let Some(fragment) = payload.get("arguments").and_then(Value::as_str) {
                        if !state.open_call {
                            self.code.push(Instruction::with_text(
                                Op::CallStart,
                                format!("call_{index}"),
                            ));
                            self.code.push(Instruction::with_text(Op::CallName, ""));
                            state.open_call = true;
                        }
                        self.merge_args_tail(fragment);
                    }
                }
                Op::RespDone => {
                    if state.plain_msg {
                        self.code.push(inst.clone());
                        continue;
                    }
                    self.close_open_think(&mut state);
                    self.close_open_call(&mut state);
                    if state.open_msg {
                        self.code.push(inst.clone());
                        self.code.push(Instruction::new(Op::MsgEnd));
                        state.open_msg = false;
                    } else if !self.has_opcode(Op::RespDone) {
                        self.code.push(inst.clone());
                    }
                }
                Op::RespId | Op::RespModel => {
                    if !self.has_opcode(inst.op) {
                        // Metadata belongs ahead of the message being
                        // assembled.
                        match (state.open_msg, self.open_message_start()) {
                            (true, Some(at)) => self.code.insert(at, inst.clone()),
                            _ => self.code.push(inst.clone()),
                        }
                    }
                }
                Op::MsgStart => {
                    self.close_open_think(&mut state);
                    self.close_open_call(&mut state);
                    if state.open_msg && !state.plain_msg {
                        self.code.push(Instruction::new(Op::MsgEnd));
                    }
                    self.code.push(inst.clone());
                    state.open_msg = true;
                    state.plain_msg = true;
                }
                Op::MsgEnd => {
                    self.code.push(inst.clone());
                    state = TailState::default();
                }
                _ => self.code.push(inst.clone()),
            }
        }
        self.buffers.extend(other.buffers.iter().cloned());
    }

    /// Closes any structures left open by streamed appends: thinking
    /// block, tool-call block (parsing accumulated argument fragments),
    /// and the message itself.
    pub fn finalize_stream(&mut self) {
        let mut state = self.tail_state();
        self.close_open_think(&mut state);
        self.close_open_call(&mut state);
        if state.open_msg {
            self.code.push(Instruction::new(Op::MsgEnd));
        }
    }

    fn tail_state(&self) -> TailState {
        let mut state = TailState::default();
        for inst in &self.code {
            match inst.op {
                Op::MsgStart => {
                    state = TailState {
                        open_msg: true,
                        ..TailState::default()
                    };
                }
                Op::MsgEnd => state = TailState::default(),
                Op::ThinkStart => state.open_think = true,
                Op::ThinkEnd => state.open_think = false,
                Op::CallStart => state.open_call = true,
                Op::CallEnd => state.open_call = false,
                _ => {}
            }
        }
        state
    }

    /// Extends a trailing instruction of the same opcode, or pushes a new
    /// one.
    fn merge_text_tail(&mut self, op: Op, text: &str) {
        let mergeable = self
            .code
            .last()
            .map(|last| last.op == op)
            .unwrap_or(false);
        if mergeable {
            if let Some(last) = self.code.last_mut() {
                last.text.push_str(text);
            }
        } else {
            self.code.push(Instruction::with_text(op, text));
        }
    }

    /// Extends a trailing buffered `CallArgs` fragment, or starts one.
    fn merge_args_tail(&mut self, fragment: &str) {
        let mergeable = self
            .code
            .last()
            .map(|last| last.op == Op::CallArgs)
            .unwrap_or(false);
        if mergeable {
            if let Some(last) = self.code.last_mut() {
                if let Some(Value::String(partial)) = last.json.as_mut() {
                    partial.push_str(fragment);
                }
            }
        } else {
            self.code.push(Instruction::with_json(
                Op::CallArgs,
                Value::String(fragment.to_string()),
            ));
        }
    }

    fn ensure_open_message(&mut self, state: &mut TailState) {
        if !state.open_msg {
            self.code.push(Instruction::new(Op::MsgStart));
            self.code.push(Instruction::new(Op::RoleAssistant));
            state.open_msg = true;
            state.plain_msg = false;
        }
    }

    fn close_open_think(&mut self, state: &mut TailState) {
        if state.open_think {
            self.code.push(Instruction::new(Op::ThinkEnd));
            state.open_think = false;
        }
    }

    fn close_open_call(&mut self, state: &mut TailState) {
        if !state.open_call {
            return;
        }
        // Accumulated argument fragments become real JSON once complete.
        if let Some(last_start) = self.code.iter().rposition(|inst| inst.op == Op::CallStart) {
            if let Some(args) = self.code[last_start..]
                .iter_mut()
                .find(|inst| inst.op == Op::CallArgs)
            {
                if let Some(Value::String(raw)) = args.json.as_ref() {
                    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                        args.json = Some(parsed);
                    }
                }
            }
        }
        self.code.push(Instruction::new(Op::CallEnd));
        state.open_call = false;
    }

    fn open_message_start(&self) -> Option<usize> {
        self.code.iter().rposition(|inst| inst.op == Op::MsgStart)
    }

    pub fn insert_before(&mut self, index: usize, insts: impl IntoIterator<Item = Instruction>) {
        let index = index.min(self.code.len());
        self.code.splice(index..index, insts);
    }

    pub fn insert_after(&mut self, index: usize, insts: impl IntoIterator<Item = Instruction>) {
        self.insert_before(index.saturating_add(1), insts);
    }

    /// Produces a standalone single-message program from a span.
    pub fn extract_message(&self, span: &MessageSpan) -> Program {
        let end = span.end.min(self.code.len().saturating_sub(1));
        Program {
            code: self.code[span.start..=end].to_vec(),
            buffers: Vec::new(),
        }
    }

    /// Rebuilds the program without the given message spans.
    pub fn remove_messages(&self, spans: &[MessageSpan]) -> Program {
        let mut drop = vec![false; self.code.len()];
        for span in spans {
            for flag in drop
                .iter_mut()
                .take(span.end.saturating_add(1).min(self.code.len()))
                .skip(span.start)
            {
                *flag = true;
            }
        }
        Program {
            code: self
                .code
                .iter()
                .enumerate()
                .filter(|(i, _)| !drop[*i])
                .map(|(_, inst)| inst.clone())
                .collect(),
            buffers: self.buffers.clone(),
        }
    }

    /// Inserts a new system message before the first message (or appends
    /// one when the program has no messages).
    pub fn prepend_system_prompt(&mut self, text: impl Into<String>) {
        let insts = vec![
            Instruction::new(Op::MsgStart),
            Instruction::new(Op::RoleSystem),
            Instruction::with_text(Op::TxtChunk, text),
            Instruction::new(Op::MsgEnd),
        ];
        match self.code.iter().position(|inst| inst.op == Op::MsgStart) {
            Some(at) => self.insert_before(at, insts),
            None => self.code.extend(insts),
        }
    }

    // ── Text extraction ─────────────────────────────────────────────────

    /// Concatenated text of all system messages, newline-joined.
    pub fn system_prompt(&self) -> String {
        let mut parts = Vec::new();
        for span in self.messages() {
            if span.role == Some(Role::System) {
                let text = self.message_text(&span);
                if !text.is_empty() {
                    parts.push(text);
                }
            }
        }
        parts.join("\n")
    }

    pub fn last_user_message(&self) -> Option<MessageSpan> {
        self.messages()
            .into_iter()
            .rev()
            .find(|span| span.role == Some(Role::User))
    }

    /// Concatenated `TxtChunk` text within a message span.
    pub fn message_text(&self, span: &MessageSpan) -> String {
        let mut out = String::new();
        let end = span.end.min(self.code.len());
        for inst in &self.code[span.start..end] {
            if inst.op == Op::TxtChunk {
                out.push_str(&inst.text);
            }
        }
        out
    }

    pub fn count_messages(&self) -> usize {
        self.messages().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Program {
        let mut p = Program::new();
        p.emit_text(Op::SetModel, "prov/m");
        p.emit(Op::MsgStart);
        p.emit(Op::RoleSystem);
        p.emit_text(Op::TxtChunk, "be nice");
        p.emit(Op::MsgEnd);
        p.emit(Op::MsgStart);
        p.emit(Op::RoleUser);
        p.emit_text(Op::TxtChunk, "hi ");
        p.emit_text(Op::TxtChunk, "there");
        p.emit(Op::MsgEnd);
        p
    }

    #[test]
    fn model_get_set() {
        let mut p = sample();
        assert_eq!(p.model(), Some("prov/m"));
        p.set_model("other");
        assert_eq!(p.model(), Some("other"));

        let mut empty = Program::new();
        assert_eq!(empty.model(), None);
        empty.set_model("m");
        assert_eq!(empty.code[0].op, Op::SetModel);
    }

    #[test]
    fn streaming_flag() {
        let mut p = sample();
        assert!(!p.is_streaming());
        p.set_streaming(true);
        assert!(p.is_streaming());
        // Flag lands after the model configuration.
        assert_eq!(p.code[1].op, Op::SetStream);
        p.set_streaming(false);
        assert!(!p.is_streaming());
    }

    #[test]
    fn message_spans_and_text() {
        let p = sample();
        let msgs = p.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Some(Role::System));
        assert_eq!(msgs[1].role, Some(Role::User));
        assert_eq!(p.message_text(&msgs[1]), "hi there");
        assert_eq!(p.system_prompt(), "be nice");
        assert_eq!(p.last_user_message(), Some(msgs[1].clone()));
    }

    #[test]
    fn tool_spans() {
        let mut p = Program::new();
        p.emit(Op::DefStart);
        p.emit_text(Op::DefName, "now");
        p.emit_text(Op::DefDesc, "current time");
        p.emit_json(Op::DefSchema, json!({"type": "object"}));
        p.emit(Op::DefEnd);
        p.emit(Op::MsgStart);
        p.emit(Op::RoleAssistant);
        p.emit_text(Op::CallStart, "call_1");
        p.emit_text(Op::CallName, "now");
        p.emit_json(Op::CallArgs, json!({}));
        p.emit(Op::CallEnd);
        p.emit(Op::MsgEnd);
        p.emit(Op::MsgStart);
        p.emit(Op::RoleTool);
        p.emit_text(Op::ResultStart, "call_1");
        p.emit_text(Op::ResultData, "12:00");
        p.emit(Op::ResultEnd);
        p.emit(Op::MsgEnd);

        let defs = p.tool_defs();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "now");

        let calls = p.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "call_1");
        assert_eq!(calls[0].name, "now");

        let results = p.tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].call_id, "call_1");
    }

    #[test]
    fn spans_match_fresh_scan_after_mutation() {
        let mut p = sample();
        let before = p.messages();
        p.insert_before(
            before[1].start,
            vec![
                Instruction::new(Op::MsgStart),
                Instruction::new(Op::RoleAssistant),
                Instruction::with_text(Op::TxtChunk, "hello"),
                Instruction::new(Op::MsgEnd),
            ],
        );
        let after = p.messages();
        assert_eq!(after.len(), 3);
        for span in &after {
            assert_eq!(p.code[span.start].op, Op::MsgStart);
            assert_eq!(p.code[span.end].op, Op::MsgEnd);
        }
        assert_eq!(after[1].role, Some(Role::Assistant));
    }

    #[test]
    fn extract_and_remove_messages() {
        let p = sample();
        let msgs = p.messages();
        let one = p.extract_message(&msgs[0]);
        assert_eq!(one.count_messages(), 1);
        assert_eq!(one.code[0].op, Op::MsgStart);

        let stripped = p.remove_messages(&msgs[..1]);
        assert_eq!(stripped.count_messages(), 1);
        assert_eq!(stripped.model(), Some("prov/m"));
    }

    #[test]
    fn prepend_system_prompt_lands_before_first_message() {
        let mut p = sample();
        p.prepend_system_prompt("note");
        let msgs = p.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, Some(Role::System));
        assert_eq!(p.message_text(&msgs[0]), "note");
        // Model configuration stays ahead of the new message.
        assert_eq!(p.code[0].op, Op::SetModel);
    }

    #[test]
    fn appending_stream_chunks_yields_message_form() {
        let mut c1 = Program::new();
        c1.emit_text(Op::RespId, "resp-1");
        c1.emit_text(Op::RespModel, "m");
        c1.emit(Op::StreamStart);
        c1.emit_text(Op::StreamDelta, "he");

        let mut c2 = Program::new();
        c2.emit_text(Op::StreamDelta, "llo");
        c2.emit_json(
            Op::StreamToolDelta,
            json!({"index": 0, "id": "call_1", "name": "now", "arguments": "{\"tz\""}),
        );

        let mut c3 = Program::new();
        c3.emit_json(Op::StreamToolDelta, json!({"index": 0, "arguments": ":\"utc\"}"}));
        c3.emit_text(Op::RespDone, "tool_calls");

        let mut assembled = Program::new();
        assembled.append(&c1);
        assembled.append(&c2);
        assembled.append(&c3);

        let msgs = assembled.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Some(Role::Assistant));
        assert_eq!(assembled.message_text(&msgs[0]), "hello");

        let calls = assembled.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "call_1");
        assert_eq!(calls[0].name, "now");
        // Buffered argument fragments parse once the call completes.
        let args = assembled.code[calls[0].start..=calls[0].end]
            .iter()
            .find(|inst| inst.op == Op::CallArgs)
            .and_then(|inst| inst.json.clone())
            .unwrap();
        assert_eq!(args, json!({"tz": "utc"}));

        // Metadata landed outside the message.
        assert!(assembled.code[msgs[0].start..=msgs[0].end]
            .iter()
            .all(|inst| inst.op != Op::RespId));
        // Terminal marker precedes the message end.
        assert_eq!(assembled.code[msgs[0].end - 1].op, Op::RespDone);
    }

    #[test]
    fn finalize_stream_closes_open_structures() {
        let mut chunk = Program::new();
        chunk.emit(Op::StreamStart);
        chunk.emit_text(Op::StreamThinkDelta, "mulling");
        let mut assembled = Program::new();
        assembled.append(&chunk);
        assembled.finalize_stream();
        let msgs = assembled.messages();
        assert_eq!(msgs.len(), 1);
        assert!(assembled.has_opcode(Op::ThinkEnd));
    }

    #[test]
    fn append_merges_code_and_buffers() {
        let mut a = sample();
        let mut b = Program::new();
        b.emit(Op::MsgStart);
        b.emit(Op::RoleAssistant);
        b.emit_text(Op::TxtChunk, "yo");
        b.emit(Op::MsgEnd);
        b.buffers.push(vec![1, 2, 3]);
        a.append(&b);
        assert_eq!(a.count_messages(), 3);
        assert_eq!(a.buffers.len(), 1);
    }
}
