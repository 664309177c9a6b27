use std::sync::Arc;

use tracing::{debug, error};

use ail::Program;

use super::{HandlerInvoker, Plugin, PluginInstance};
use crate::context::RequestContext;
use crate::drivers::UpstreamMeta;
use crate::error::RelayError;
use crate::provider::Provider;
use crate::sink::ResponseSink;

/// The ordered plugin chain resolved for one request. Dispatchers walk
/// the instances in insertion order; each non-erroring step feeds its
/// output to the next.
#[derive(Default, Clone)]
pub struct PluginChain {
    plugins: Vec<PluginInstance>,
}

impl PluginChain {
    pub fn new() -> Self {
        PluginChain::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>, params: impl Into<String>) {
        self.plugins.push(PluginInstance::new(plugin, params));
    }

    pub fn add_instance(&mut self, instance: PluginInstance) {
        self.plugins.push(instance);
    }

    pub fn plugins(&self) -> &[PluginInstance] {
        &self.plugins
    }

    /// Comma-joined `name[:params]` labels for `X-Plugins-Executed`.
    pub fn executed_header(&self) -> Option<String> {
        if self.plugins.is_empty() {
            return None;
        }
        Some(
            self.plugins
                .iter()
                .map(PluginInstance::label)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// First matching model rewrite, with the rewriter's name.
    pub async fn run_model_rewrite(&self, model: &str) -> (String, Option<String>) {
        for instance in &self.plugins {
            if let Some(rewrite) = instance.plugin.as_model_rewrite() {
                if let Some(rewritten) = rewrite.rewrite_model(model).await {
                    debug!(
                        plugin = %instance.plugin.name(),
                        from = %model,
                        to = %rewritten,
                        "model rewrite matched"
                    );
                    return (rewritten, Some(instance.plugin.name().to_string()));
                }
            }
        }
        (model.to_string(), None)
    }

    pub fn run_request_init(&self, ctx: &RequestContext, prog: &Program) {
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_request_init() {
                hook.on_request_init(ctx, prog);
            }
        }
    }

    pub async fn run_before(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        let mut current = prog;
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_before() {
                debug!(plugin = %instance.plugin.name(), "running before hook");
                current = hook
                    .before(&instance.params, provider, ctx, current)
                    .await
                    .map_err(|e| {
                        error!(plugin = %instance.plugin.name(), error = %e, "before hook failed");
                        e
                    })?;
            }
        }
        Ok(current)
    }

    pub async fn run_after(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: &UpstreamMeta,
        res_prog: Program,
    ) -> Result<Program, RelayError> {
        let mut current = res_prog;
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_after() {
                debug!(plugin = %instance.plugin.name(), "running after hook");
                current = hook
                    .after(&instance.params, provider, ctx, req_prog, upstream, current)
                    .await
                    .map_err(|e| {
                        error!(plugin = %instance.plugin.name(), error = %e, "after hook failed");
                        e
                    })?;
            }
        }
        Ok(current)
    }

    pub async fn run_after_chunk(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: &UpstreamMeta,
        chunk: Program,
    ) -> Result<Program, RelayError> {
        let mut current = chunk;
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_stream_chunk() {
                current = hook
                    .after_chunk(&instance.params, provider, ctx, req_prog, upstream, current)
                    .await
                    .map_err(|e| {
                        error!(plugin = %instance.plugin.name(), error = %e, "chunk hook failed");
                        e
                    })?;
            }
        }
        Ok(current)
    }

    pub async fn run_stream_end(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: &UpstreamMeta,
        assembled: &Program,
    ) {
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_stream_end() {
                if let Err(e) = hook
                    .stream_end(&instance.params, provider, ctx, req_prog, upstream, assembled)
                    .await
                {
                    // Side hooks never decide the request outcome.
                    error!(plugin = %instance.plugin.name(), error = %e, "stream end hook failed");
                }
            }
        }
    }

    /// Runs every error hook. A hook's own failure is logged and
    /// swallowed; this never fails the chain.
    pub async fn run_error(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: Option<&UpstreamMeta>,
        error: &RelayError,
    ) {
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_error() {
                if let Err(e) = hook
                    .on_error(&instance.params, provider, ctx, req_prog, upstream, error)
                    .await
                {
                    error!(plugin = %instance.plugin.name(), error = %e, "error hook failed");
                }
            }
        }
    }

    /// Walks recursive handlers in order; the first returning `true` owns
    /// the response and iteration halts.
    pub async fn run_recursive_handlers(
        &self,
        invoker: &HandlerInvoker,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<bool, RelayError> {
        for instance in &self.plugins {
            if let Some(hook) = instance.plugin.as_recursive() {
                debug!(plugin = %instance.plugin.name(), "running recursive handler");
                let handled = hook
                    .recursive_handler(&instance.params, invoker, prog, sink, ctx)
                    .await;
                match handled {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::provider::ProviderStyle;

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

    struct Tagger(&'static str);
    impl Plugin for Tagger {
        fn name(&self) -> &str {
            self.0
        }
        fn as_before(&self) -> Option<&dyn BeforeHook> {
            Some(self)
        }
    }
    #[async_trait]
    impl BeforeHook for Tagger {
        async fn before(
            &self,
            _params: &str,
            _provider: &Provider,
            _ctx: &RequestContext,
            mut prog: Program,
        ) -> Result<Program, RelayError> {
            prog.emit_text(ail::Op::TxtChunk, self.0);
            Ok(prog)
        }
    }
    use super::super::BeforeHook;
    use super::super::ErrorHook;

    #[tokio::test]
    async fn before_hooks_run_in_insertion_order() {
        let mut chain = PluginChain::new();
        chain.add(Arc::new(Tagger("one")), "");
        chain.add(Arc::new(Tagger("two")), "");
        let prog = chain
            .run_before(&test_provider(), &RequestContext::new(), Program::new())
            .await
            .unwrap();
        let texts: Vec<&str> = prog.code.iter().map(|inst| inst.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    struct FailingErrorHook {
        calls: AtomicUsize,
    }
    impl Plugin for FailingErrorHook {
        fn name(&self) -> &str {
            "failing"
        }
        fn as_error(&self) -> Option<&dyn ErrorHook> {
            Some(self)
        }
    }
    #[async_trait]
    impl ErrorHook for FailingErrorHook {
        async fn on_error(
            &self,
            _params: &str,
            _provider: &Provider,
            _ctx: &RequestContext,
            _req_prog: &Program,
            _upstream: Option<&UpstreamMeta>,
            _error: &RelayError,
        ) -> Result<(), RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Internal("hook blew up".into()))
        }
    }

    #[tokio::test]
    async fn error_hook_failures_are_swallowed() {
        let hook = Arc::new(FailingErrorHook {
            calls: AtomicUsize::new(0),
        });
        let mut chain = PluginChain::new();
        chain.add(hook.clone(), "");
        chain
            .run_error(
                &test_provider(),
                &RequestContext::new(),
                &Program::new(),
                None,
                &RelayError::Provider("upstream down".into()),
            )
            .await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executed_header_joins_labels() {
        let mut chain = PluginChain::new();
        assert_eq!(chain.executed_header(), None);
        chain.add(Arc::new(Tagger("stools")), "");
        chain.add(Arc::new(Tagger("slwin")), "15");
        assert_eq!(
            chain.executed_header().as_deref(),
            Some("stools,slwin:15")
        );
    }
}
