//! Virtual providers: model aliasing with no upstream.
//!
//! A virtual provider rewrites `"<provider>/<alias>[+plugins]"` to its
//! mapped target (which may itself carry plugin suffixes) so the request
//! routes to a real provider. The rewrite plugin is named `virtual:<name>`;
//! the pipeline preamble uses that prefix to flag the exports bypass.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use super::{ListModelsCommand, ListedModel};
use crate::context::RequestContext;
use crate::error::RelayError;
use crate::plugin::{ModelRewrite, Plugin};
use crate::provider::Provider;

pub struct VirtualAlias {
    provider_name: String,
    plugin_name: String,
    mappings: HashMap<String, String>,
}

impl VirtualAlias {
    pub fn new(provider_name: impl Into<String>, mappings: HashMap<String, String>) -> Self {
        let provider_name = provider_name.into();
        VirtualAlias {
            plugin_name: format!("virtual:{provider_name}"),
            provider_name,
            mappings,
        }
    }
}

impl Plugin for VirtualAlias {
    fn name(&self) -> &str {
        &self.plugin_name
    }

    fn as_model_rewrite(&self) -> Option<&dyn ModelRewrite> {
        Some(self)
    }
}

#[async_trait]
impl ModelRewrite for VirtualAlias {
    async fn rewrite_model(&self, model: &str) -> Option<String> {
        // Expect "<virtualProvider>/<model>[+plugins]".
        let (prefix, rest) = model.split_once('/')?;
        if !prefix.eq_ignore_ascii_case(&self.provider_name) {
            return None;
        }

        let (base, suffix) = match rest.find('+') {
            Some(at) => rest.split_at(at),
            None => (rest, ""),
        };
        let target = self.mappings.get(base).filter(|t| !t.is_empty())?;

        // Target plugins come first, then the caller's own suffixes.
        let rewritten = format!("{target}{suffix}");
        debug!(provider = %self.provider_name, from = %model, to = %rewritten, "virtual alias resolved");
        Some(rewritten)
    }
}

/// `list_models` for a virtual provider: the alias names themselves.
pub struct VirtualListModels {
    provider_name: String,
    mappings: HashMap<String, String>,
}

impl VirtualListModels {
    pub fn new(provider_name: impl Into<String>, mappings: HashMap<String, String>) -> Self {
        VirtualListModels {
            provider_name: provider_name.into(),
            mappings,
        }
    }
}

#[async_trait]
impl ListModelsCommand for VirtualListModels {
    async fn do_list_models(
        &self,
        _provider: &Provider,
        _ctx: &RequestContext,
    ) -> Result<Vec<ListedModel>, RelayError> {
        let mut models: Vec<ListedModel> = self
            .mappings
            .keys()
            .map(|alias| ListedModel {
                object: "model".into(),
                id: alias.clone(),
                name: alias.clone(),
                created: None,
                owned_by: self.provider_name.clone(),
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}
