use std::collections::HashSet;

/// Request-scoped state threaded through the pipeline and every plugin
/// hook. Cloned (cheaply) when a recursive plugin derives a guarded
/// sub-request context.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Unique id correlating logs, KV keys, and sampler artifacts.
    /// Generated once at the outermost entry and inherited by recursive
    /// invocations.
    pub trace_id: String,

    /// Incoming client bearer token, collected by the endpoint adapter.
    pub bearer: Option<String>,

    /// Set when a `virtual:*` plugin rewrote the model; the provider loop
    /// then skips exports filtering for the rest of the request.
    pub exports_bypass: bool,

    /// Wire style the client speaks, when the endpoint has one. Recursive
    /// plugins that write responses themselves use it to pick an emitter.
    pub client_style: Option<ail::Style>,

    /// Raw-IR endpoints negotiate binary vs. text output per request.
    pub binary_output: bool,

    /// Re-entry sentinels installed by recursive plugins. Each plugin uses
    /// its own key so different recursive plugins can nest.
    guards: HashSet<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext::default()
    }

    pub fn ensure_trace_id(&mut self) {
        if self.trace_id.is_empty() {
            self.trace_id = uuid::Uuid::new_v4().to_string();
        }
    }

    pub fn has_guard(&self, key: &str) -> bool {
        self.guards.contains(key)
    }

    pub fn with_guard(&self, key: &str) -> Self {
        let mut child = self.clone();
        child.guards.insert(key.to_string());
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_are_per_key_and_inherited() {
        let ctx = RequestContext::new();
        assert!(!ctx.has_guard("tool:kvtools"));
        let guarded = ctx.with_guard("tool:kvtools");
        assert!(guarded.has_guard("tool:kvtools"));
        assert!(!guarded.has_guard("dspy"));
        let nested = guarded.with_guard("dspy");
        assert!(nested.has_guard("tool:kvtools"));
        assert!(nested.has_guard("dspy"));
    }

    #[test]
    fn trace_id_is_stable_once_set() {
        let mut ctx = RequestContext::new();
        ctx.ensure_trace_id();
        let first = ctx.trace_id.clone();
        ctx.ensure_trace_id();
        assert_eq!(ctx.trace_id, first);
    }
}
