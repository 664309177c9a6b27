//! `stools`: strips completed tool interactions from the history.
//!
//! A *tool interaction* is one assistant message carrying tool calls plus
//! the consecutive tool-result messages that follow it. With two or more
//! interactions, every earlier assistant message is re-emitted text-only
//! and its tool-result messages are dropped; only the last interaction
//! survives intact. Non-message instructions always pass through.

use async_trait::async_trait;

use ail::{Instruction, Op, Program, Role};

use crate::context::RequestContext;
use crate::error::RelayError;
use crate::plugin::{BeforeHook, Plugin};
use crate::provider::Provider;

pub struct StripTools;

/// Message spans grouped into tool interactions; indices into the span
/// list.
pub(crate) struct Interaction {
    pub assistant: usize,
    pub end: usize,
}

pub(crate) fn span_has_calls(prog: &Program, span: &ail::MessageSpan) -> bool {
    prog.code[span.start..=span.end]
        .iter()
        .any(|inst| inst.op == Op::CallStart)
}

pub(crate) fn find_interactions(
    prog: &Program,
    spans: &[ail::MessageSpan],
) -> Vec<Interaction> {
    let mut interactions = Vec::new();
    let mut i = 0;
    while i < spans.len() {
        if spans[i].role == Some(Role::Assistant) && span_has_calls(prog, &spans[i]) {
            let mut end = i;
            let mut j = i + 1;
            while j < spans.len() && spans[j].role == Some(Role::Tool) {
                end = j;
                j += 1;
            }
            interactions.push(Interaction { assistant: i, end });
            i = end;
        }
        i += 1;
    }
    interactions
}

impl Plugin for StripTools {
    fn name(&self) -> &str {
        "stools"
    }

    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }
}

#[async_trait]
impl BeforeHook for StripTools {
    async fn before(
        &self,
        _params: &str,
        _provider: &Provider,
        _ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        let spans = prog.messages();
        let interactions = find_interactions(&prog, &spans);
        if interactions.len() <= 1 {
            return Ok(prog);
        }

        #[derive(Clone, Copy)]
        enum Action {
            Drop,
            TextOnly,
        }
        let mut actions: Vec<Option<Action>> = vec![None; spans.len()];
        for interaction in &interactions[..interactions.len() - 1] {
            let assistant = &spans[interaction.assistant];
            let has_text = prog.code[assistant.start..=assistant.end]
                .iter()
                .any(|inst| inst.op == Op::TxtChunk);
            actions[interaction.assistant] = Some(if has_text {
                Action::TextOnly
            } else {
                Action::Drop
            });
            for j in interaction.assistant + 1..=interaction.end {
                actions[j] = Some(Action::Drop);
            }
        }

        // Rebuild, copying untouched instructions and re-emitting stripped
        // assistant messages without their call blocks.
        let mut out = Program::new();
        out.buffers = prog.buffers.clone();
        let mut span_idx = 0usize;
        let mut i = 0usize;
        while i < prog.code.len() {
            if prog.code[i].op == Op::MsgStart && span_idx < spans.len() {
                let span = &spans[span_idx];
                let action = actions[span_idx];
                span_idx += 1;
                match action {
                    None => {
                        for inst in &prog.code[span.start..=span.end] {
                            out.code.push(inst.clone());
                        }
                    }
                    Some(Action::Drop) => {}
                    Some(Action::TextOnly) => {
                        out.code.push(Instruction::new(Op::MsgStart));
                        let mut in_call = false;
                        for inst in &prog.code[span.start + 1..span.end] {
                            match inst.op {
                                Op::CallStart => in_call = true,
                                Op::CallEnd => in_call = false,
                                _ if !in_call => out.code.push(inst.clone()),
                                _ => {}
                            }
                        }
                        out.code.push(Instruction::new(Op::MsgEnd));
                    }
                }
                i = span.end + 1;
                continue;
            }
            out.code.push(prog.code[i].clone());
            i += 1;
        }
        Ok(out)
    }
}
