//! `kvtools`: strips completed tool interactions like `stools`, but
//! caches each removed tool result in a KV store first and injects a
//! synthetic `get_tool_result` definition so the model can recall any of
//! them on demand.
//!
//! Params select the backend: `kvtools` (configured default),
//! `kvtools:redis=redis://…` (explicit backend and DSN).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use ail::{Instruction, Op, Program};

use super::stools::find_interactions;
use crate::context::RequestContext;
use crate::error::RelayError;
use crate::kv::{self, Store};
use crate::plugin::{
    build_tool_def, BeforeHook, HandlerInvoker, Plugin, RecursiveHandler, ToolCallContext,
    ToolHandler, ToolPlugin,
};
use crate::provider::Provider;
use crate::sink::ResponseSink;

const TOOL_NAME: &str = "get_tool_result";
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

fn kv_key(trace_id: &str, call_id: &str) -> String {
    format!("kvtools:{trace_id}:{call_id}")
}

/// The handler half: serves `get_tool_result` lookups and owns the
/// lazily opened store.
pub struct KvToolsHandler {
    default_backend: String,
    default_dsn: String,
    store: Mutex<Option<Arc<dyn Store>>>,
}

impl KvToolsHandler {
    fn ensure_store(&self, params: &str) -> Arc<dyn Store> {
        let mut guard = self.store.lock().expect("kvtools store poisoned");
        if let Some(store) = guard.as_ref() {
            return store.clone();
        }
        let (backend, dsn) = if params.is_empty() {
            (self.default_backend.as_str(), self.default_dsn.as_str())
        } else {
            match params.split_once('=') {
                Some((backend, dsn)) => (backend, dsn),
                None => (params, ""),
            }
        };
        let store = kv::open(backend, dsn).unwrap_or_else(|e| {
            warn!(backend, error = %e, "kv backend open failed, falling back to memory");
            kv::open("memory", "").expect("memory backend always available")
        });
        *guard = Some(store.clone());
        store
    }
}

#[async_trait]
impl ToolHandler for KvToolsHandler {
    fn tool_name(&self) -> &str {
        "kvtools"
    }

    fn tool_defs(&self, _params: &str) -> Vec<Instruction> {
        build_tool_def(
            TOOL_NAME,
            "Retrieve the result of a previous tool call by its ID. Use this when you need \
             data from a tool call that was made earlier in the conversation but whose result \
             is no longer in context.",
            Some(json!({
                "type": "object",
                "properties": {
                    "tool_call_id": {
                        "type": "string",
                        "description": "The ID of a previous tool call whose result you want to retrieve."
                    }
                },
                "required": ["tool_call_id"]
            })),
        )
    }

    async fn handle_tool_call(
        &self,
        params: &str,
        _call_id: &str,
        args: Option<&Value>,
        tcx: &ToolCallContext<'_>,
    ) -> Result<Option<String>, RelayError> {
        // Malformed arguments and a missing id are distinct tool errors.
        if let Some(value) = args {
            if !value.is_object() {
                return Ok(Some(format!(
                    "invalid arguments: expected an object, got {value}"
                )));
            }
        }
        let wanted = args
            .and_then(|value| value.get("tool_call_id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if wanted.is_empty() {
            return Ok(Some("tool_call_id is required".to_string()));
        }
        let store = self.ensure_store(params);
        match store.get(&kv_key(tcx.trace_id, wanted)).await {
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(Some(format!(
                "tool result not found for call_id: {wanted}"
            ))),
        }
    }
}

/// The plugin: the tool-plugin base (definition injection + dispatch
/// loop) with a cache-and-strip step layered into Before.
pub struct KvTools {
    base: ToolPlugin<KvToolsHandler>,
}

impl KvTools {
    pub fn new(default_backend: impl Into<String>, default_dsn: impl Into<String>) -> Self {
        KvTools {
            base: ToolPlugin::new(KvToolsHandler {
                default_backend: default_backend.into(),
                default_dsn: default_dsn.into(),
                store: Mutex::new(None),
            }),
        }
    }

    /// Caches tool results from all completed interactions but the last,
    /// strips those interactions, and prepends a note listing the cached
    /// call ids.
    async fn cache_and_strip(
        &self,
        params: &str,
        ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        let spans = prog.messages();
        let interactions = find_interactions(&prog, &spans);
        if interactions.len() <= 1 {
            return Ok(prog);
        }

        let store = self.base.handler.ensure_store(params);
        let to_cache = &interactions[..interactions.len() - 1];

        // Cache every tool result in the older interactions.
        let results = prog.tool_results();
        for interaction in to_cache {
            for span in &spans[interaction.assistant + 1..=interaction.end] {
                for result in &results {
                    if result.start >= span.start && result.end <= span.end {
                        let data = prog.code[result.start..=result.end]
                            .iter()
                            .find(|inst| inst.op == Op::ResultData)
                            .map(|inst| inst.text.clone())
                            .unwrap_or_default();
                        if let Err(e) = store
                            .set(
                                &kv_key(&ctx.trace_id, &result.call_id),
                                &data,
                                Some(CACHE_TTL),
                            )
                            .await
                        {
                            warn!(call_id = %result.call_id, error = %e, "kv cache write failed");
                        }
                    }
                }
            }
        }

        // Collect the cached call ids for the note.
        let calls = prog.tool_calls();
        let mut cached_ids = Vec::new();
        for interaction in to_cache {
            let assistant = &spans[interaction.assistant];
            for call in &calls {
                if call.start >= assistant.start && call.end <= assistant.end {
                    cached_ids.push(call.call_id.clone());
                }
            }
        }

        // Strip the older interactions.
        let mut to_remove = Vec::new();
        for interaction in to_cache {
            for span in &spans[interaction.assistant..=interaction.end] {
                to_remove.push(span.clone());
            }
        }
        let mut out = prog.remove_messages(&to_remove);

        if !cached_ids.is_empty() {
            out.prepend_system_prompt(format!(
                "Previous tool call results have been cached and removed from context to save \
                 tokens. You can retrieve any of them using {TOOL_NAME} with these call IDs: {}",
                cached_ids.join(", ")
            ));
        }
        Ok(out)
    }
}

impl Plugin for KvTools {
    fn name(&self) -> &str {
        "kvtools"
    }

    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }

    fn as_recursive(&self) -> Option<&dyn RecursiveHandler> {
        Some(self)
    }
}

#[async_trait]
impl BeforeHook for KvTools {
    async fn before(
        &self,
        params: &str,
        _provider: &Provider,
        ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        // Cache-and-strip first, then let the base inject the def.
        let prog = self.cache_and_strip(params, ctx, prog).await?;
        Ok(self.base.inject_defs(params, prog))
    }
}

#[async_trait]
impl RecursiveHandler for KvTools {
    async fn recursive_handler(
        &self,
        params: &str,
        invoker: &HandlerInvoker,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<bool, RelayError> {
        self.base
            .run_recursive(params, invoker, prog, sink, ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderStyle;
    use ail::Role;
    use std::collections::HashMap;

    fn test_provider() -> Provider {
        Provider {
            name: "test".into(),
            base_url: None,
            style: ProviderStyle::Wire(ail::Style::ChatCompletions),
            commands: HashMap::new(),
            exported_models: Default::default(),
            private: false,
            api_key_env: None,
        }
    }

    fn conversation(rounds: usize) -> Program {
        let mut p = Program::new();
        p.set_model("m");
        p.emit(Op::MsgStart);
        p.emit(Op::RoleUser);
        p.emit_text(Op::TxtChunk, "question");
        p.emit(Op::MsgEnd);
        for round in 0..rounds {
            p.emit(Op::MsgStart);
            p.emit(Op::RoleAssistant);
            p.emit_text(Op::CallStart, format!("call_{round}"));
            p.emit_text(Op::CallName, "lookup");
            p.emit_json(Op::CallArgs, json!({}));
            p.emit(Op::CallEnd);
            p.emit(Op::MsgEnd);
            p.emit(Op::MsgStart);
            p.emit(Op::RoleTool);
            p.emit_text(Op::ResultStart, format!("call_{round}"));
            p.emit_text(Op::ResultData, format!("result {round}"));
            p.emit(Op::ResultEnd);
            p.emit(Op::MsgEnd);
        }
        p
    }

    #[tokio::test]
    async fn caches_strips_and_notes_earlier_interactions() {
        let plugin = KvTools::new("memory", "");
        let mut ctx = RequestContext::new();
        ctx.ensure_trace_id();

        let out = plugin
            .before("", &test_provider(), &ctx, conversation(3))
            .await
            .unwrap();

        // Only the last interaction's result message remains.
        assert_eq!(out.tool_results().len(), 1);
        assert_eq!(out.tool_results()[0].call_id, "call_2");

        // A system note lists the cached ids.
        let note = out.system_prompt();
        assert!(note.contains("call_0"));
        assert!(note.contains("call_1"));
        assert!(!note.contains("call_2"));

        // The synthetic definition is injected.
        let defs = out.tool_defs();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, TOOL_NAME);

        // Earlier results are retrievable through the handler.
        let request = Program::new();
        let tcx = ToolCallContext {
            trace_id: &ctx.trace_id,
            request: &request,
        };
        let recalled = plugin
            .base
            .handler
            .handle_tool_call("", "x", Some(&json!({"tool_call_id": "call_0"})), &tcx)
            .await
            .unwrap();
        assert_eq!(recalled.as_deref(), Some("result 0"));

        let missing = plugin
            .base
            .handler
            .handle_tool_call("", "x", Some(&json!({"tool_call_id": "nope"})), &tcx)
            .await
            .unwrap();
        assert!(missing.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn bad_lookup_arguments_are_distinct_tool_errors() {
        let plugin = KvTools::new("memory", "");
        let request = Program::new();
        let tcx = ToolCallContext {
            trace_id: "t",
            request: &request,
        };

        // Non-object arguments are rejected as invalid.
        let invalid = plugin
            .base
            .handler
            .handle_tool_call("", "x", Some(&json!("call_0")), &tcx)
            .await
            .unwrap()
            .unwrap();
        assert!(invalid.starts_with("invalid arguments"), "got: {invalid}");

        // A well-formed object without the id gets the missing-field
        // message instead.
        let missing = plugin
            .base
            .handler
            .handle_tool_call("", "x", Some(&json!({})), &tcx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(missing, "tool_call_id is required");

        let absent = plugin
            .base
            .handler
            .handle_tool_call("", "x", None, &tcx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(absent, "tool_call_id is required");
    }

    #[tokio::test]
    async fn single_interaction_only_injects_the_def() {
        let plugin = KvTools::new("memory", "");
        let out = plugin
            .before("", &test_provider(), &RequestContext::new(), conversation(1))
            .await
            .unwrap();
        assert_eq!(out.tool_results().len(), 1);
        assert_eq!(out.tool_defs().len(), 1);
        // No note was prepended.
        let first = out.messages();
        assert_eq!(first[0].role, Some(Role::User));
    }
}
