//! The plugin system: capability traits, instances, the registry, and
//! chain resolution from model-name suffixes.
//!
//! A plugin is a value with an identity; optional capabilities are
//! discovered through the `as_*` accessors, which keeps the chain
//! dispatcher a simple loop over kind-tests.

mod chain;
mod invoker;
mod tool_plugin;

pub use chain::PluginChain;
pub use invoker::{EndpointHandler, HandlerInvoker, ResponseParser};
pub use tool_plugin::{build_tool_def, ToolCallContext, ToolHandler, ToolPlugin};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use ail::Program;

use crate::context::RequestContext;
use crate::drivers::UpstreamMeta;
use crate::error::RelayError;
use crate::provider::Provider;
use crate::sink::ResponseSink;

/// Base trait for all plugins. Capabilities default to absent.
pub trait Plugin: Send + Sync {
    /// Stable identifier.
    fn name(&self) -> &str;

    fn as_model_rewrite(&self) -> Option<&dyn ModelRewrite> {
        None
    }
    fn as_request_init(&self) -> Option<&dyn RequestInit> {
        None
    }
    fn as_before(&self) -> Option<&dyn BeforeHook> {
        None
    }
    fn as_after(&self) -> Option<&dyn AfterHook> {
        None
    }
    fn as_stream_chunk(&self) -> Option<&dyn StreamChunkHook> {
        None
    }
    fn as_stream_end(&self) -> Option<&dyn StreamEndHook> {
        None
    }
    fn as_error(&self) -> Option<&dyn ErrorHook> {
        None
    }
    fn as_recursive(&self) -> Option<&dyn RecursiveHandler> {
        None
    }
}

/// Rewrites the model name before plugin resolution. Runs in a loop until
/// the model stabilizes, so chained virtual→virtual mappings resolve.
/// An exact match must NOT rewrite (that would loop forever).
#[async_trait]
pub trait ModelRewrite: Send + Sync {
    /// `Some(new_model)` when matched, `None` otherwise.
    async fn rewrite_model(&self, model: &str) -> Option<String>;
}

/// Called once per request with the original parsed program, before any
/// mutation.
pub trait RequestInit: Send + Sync {
    fn on_request_init(&self, ctx: &RequestContext, prog: &Program);
}

/// Runs before the request is sent to a provider. May return a different
/// program; an error aborts this provider attempt.
#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn before(
        &self,
        params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError>;
}

/// Runs on a complete non-streaming response.
#[async_trait]
pub trait AfterHook: Send + Sync {
    async fn after(
        &self,
        params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: &UpstreamMeta,
        res_prog: Program,
    ) -> Result<Program, RelayError>;
}

/// Runs per streaming chunk. Errors skip the chunk only.
#[async_trait]
pub trait StreamChunkHook: Send + Sync {
    async fn after_chunk(
        &self,
        params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: &UpstreamMeta,
        chunk: Program,
    ) -> Result<Program, RelayError>;
}

/// Runs once after stream completion with the fully assembled program.
#[async_trait]
pub trait StreamEndHook: Send + Sync {
    async fn stream_end(
        &self,
        params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: &UpstreamMeta,
        assembled: &Program,
    ) -> Result<(), RelayError>;
}

/// Runs when a provider call fails. Its own failure is logged and
/// swallowed by the chain.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(
        &self,
        params: &str,
        provider: &Provider,
        ctx: &RequestContext,
        req_prog: &Program,
        upstream: Option<&UpstreamMeta>,
        error: &RelayError,
    ) -> Result<(), RelayError>;
}

/// Runs before normal provider iteration; returning `true` means the
/// plugin owns the response and iteration is skipped.
#[async_trait]
pub trait RecursiveHandler: Send + Sync {
    async fn recursive_handler(
        &self,
        params: &str,
        invoker: &HandlerInvoker,
        prog: &Program,
        sink: &mut dyn ResponseSink,
        ctx: &RequestContext,
    ) -> Result<bool, RelayError>;
}

/// A plugin reference plus its per-use parameter string.
#[derive(Clone)]
pub struct PluginInstance {
    pub plugin: Arc<dyn Plugin>,
    pub params: String,
}

impl PluginInstance {
    pub fn new(plugin: Arc<dyn Plugin>, params: impl Into<String>) -> Self {
        PluginInstance {
            plugin,
            params: params.into(),
        }
    }

    /// `name[:params]`, as reported in `X-Plugins-Executed`.
    pub fn label(&self) -> String {
        if self.params.is_empty() {
            self.plugin.name().to_string()
        } else {
            format!("{}:{}", self.plugin.name(), self.params)
        }
    }
}

/// Process-wide plugin registry, written during provisioning and
/// read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    /// Model-rewrite plugins included in every chain (virtual aliases,
    /// fuzz) so the preamble's rewrite loop sees them without a suffix.
    rewriters: Vec<Arc<dyn Plugin>>,
    head: Vec<PluginInstance>,
    tail: Vec<PluginInstance>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Registers a plugin that joins every chain ahead of the suffix
    /// instances (in addition to being resolvable by name).
    pub fn register_rewriter(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins
            .insert(plugin.name().to_string(), plugin.clone());
        self.rewriters.push(plugin);
    }

    pub fn push_head(&mut self, instance: PluginInstance) {
        self.head.push(instance);
    }

    pub fn push_tail(&mut self, instance: PluginInstance) {
        self.tail.push(instance);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn head(&self) -> &[PluginInstance] {
        &self.head
    }

    pub fn tail(&self) -> &[PluginInstance] {
        &self.tail
    }

    /// Resolves the chain for a model string: head list, global rewrite
    /// plugins, the `+plugin[:params]` suffix instances, tail list.
    /// Unknown suffix names are skipped with a warning.
    pub fn resolve_chain(&self, model: &str) -> PluginChain {
        let mut chain = PluginChain::new();
        for instance in &self.head {
            chain.add_instance(instance.clone());
        }
        for rewriter in &self.rewriters {
            chain.add(rewriter.clone(), "");
        }
        let (_, suffixes) = parse_model_suffix(model);
        for (name, params) in suffixes {
            match self.get(&name) {
                Some(plugin) => chain.add(plugin, params),
                None => warn!(plugin = %name, "unknown plugin suffix, skipping"),
            }
        }
        for instance in &self.tail {
            chain.add_instance(instance.clone());
        }
        chain
    }
}

/// Splits `base+p1:params+p2` into the base model and its plugin
/// suffixes.
pub fn parse_model_suffix(model: &str) -> (String, Vec<(String, String)>) {
    let mut pieces = model.split('+');
    let base = pieces.next().unwrap_or_default().to_string();
    let mut suffixes = Vec::new();
    for piece in pieces {
        if piece.is_empty() {
            continue;
        }
        match piece.split_once(':') {
            Some((name, params)) => suffixes.push((name.to_string(), params.to_string())),
            None => suffixes.push((piece.to_string(), String::new())),
        }
    }
    (base, suffixes)
}
