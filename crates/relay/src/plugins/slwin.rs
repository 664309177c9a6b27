//! `slwin`: keeps a fixed-size window of messages.
//!
//! Syntax: `slwin` (keep 1 from the start, 10 from the end), `slwin:15`
//! (keep 15 from the end), `slwin:15:3` (keep 3 from the start, 15 from
//! the end). Messages outside the window are removed; non-message
//! instructions always survive. Overlapping windows are a no-op.

use async_trait::async_trait;

use ail::Program;

use crate::context::RequestContext;
use crate::error::RelayError;
use crate::plugin::{BeforeHook, Plugin};
use crate::provider::Provider;

pub struct SlidingWindow;

fn parse_params(params: &str) -> (usize, usize) {
    let mut keep_end = 10usize;
    let mut keep_start = 1usize;
    if params.is_empty() {
        return (keep_end, keep_start);
    }
    let mut parts = params.splitn(2, ':');
    if let Some(value) = parts.next().and_then(|p| p.parse::<usize>().ok()) {
        if value > 0 {
            keep_end = value;
        }
    }
    if let Some(value) = parts.next().and_then(|p| p.parse::<usize>().ok()) {
        keep_start = value;
    }
    (keep_end, keep_start)
}

impl Plugin for SlidingWindow {
    fn name(&self) -> &str {
        "slwin"
    }

    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }
}

#[async_trait]
impl BeforeHook for SlidingWindow {
    async fn before(
        &self,
        params: &str,
        _provider: &Provider,
        _ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        let (keep_end, keep_start) = parse_params(params);
        let spans = prog.messages();
        let total = spans.len();
        if total <= keep_start + keep_end {
            return Ok(prog);
        }

        let drop: Vec<ail::MessageSpan> = spans
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i >= keep_start && *i < total - keep_end)
            .map(|(_, span)| span)
            .collect();
        Ok(prog.remove_messages(&drop))
    }
}
