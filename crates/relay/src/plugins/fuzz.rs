//! Fuzzy model-name matching.
//!
//! Waterfalls over provisioned providers, lazily fetching each one's
//! model list via `list_models`, and rewrites a partial model name to the
//! first id containing it. An exact id match deliberately does not
//! rewrite, so the preamble's rewrite loop terminates.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::context::RequestContext;
use crate::plugin::{ModelRewrite, Plugin};
use crate::provider::Provider;

pub struct Fuzz {
    providers: Vec<Arc<Provider>>,
    cache: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl Fuzz {
    pub fn new(providers: Vec<Arc<Provider>>) -> Self {
        Fuzz {
            providers,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached model ids for a provider, fetched on first use. A provider
    /// without a listing capability (or a failing one) yields no ids.
    async fn models_for(&self, provider: &Arc<Provider>) -> Arc<Vec<String>> {
        if let Some(cached) = self
            .cache
            .read()
            .expect("fuzz cache poisoned")
            .get(&provider.name)
        {
            return cached.clone();
        }

        let mut ids = Vec::new();
        if let Some(cmd) = provider.list_models() {
            match cmd
                .do_list_models(provider, &RequestContext::new())
                .await
            {
                Ok(models) => ids = models.into_iter().map(|model| model.id).collect(),
                Err(e) => {
                    debug!(provider = %provider.name, error = %e, "list_models failed");
                }
            }
        }
        let ids = Arc::new(ids);
        self.cache
            .write()
            .expect("fuzz cache poisoned")
            .insert(provider.name.clone(), ids.clone());
        ids
    }

    /// `None` on exact match (no rewrite) and on miss.
    async fn try_match(&self, provider: &Arc<Provider>, partial: &str) -> Option<String> {
        let models = self.models_for(provider).await;
        if models.iter().any(|id| id == partial) {
            return None;
        }
        models
            .iter()
            .find(|id| id.contains(partial))
            .map(|id| {
                debug!(provider = %provider.name, partial, resolved = %id, "fuzz matched");
                id.clone()
            })
    }

    fn provider_named(&self, name: &str) -> Option<&Arc<Provider>> {
        self.providers
            .iter()
            .find(|provider| provider.name == name)
    }
}

impl Plugin for Fuzz {
    fn name(&self) -> &str {
        "fuzz"
    }

    fn as_model_rewrite(&self) -> Option<&dyn ModelRewrite> {
        Some(self)
    }
}

#[async_trait]
impl ModelRewrite for Fuzz {
    async fn rewrite_model(&self, model: &str) -> Option<String> {
        // Plugin suffixes are preserved verbatim.
        let (base, suffix) = match model.find('+') {
            Some(at) => model.split_at(at),
            None => (model, ""),
        };

        // With a provider prefix, scope to that provider only.
        if let Some((prefix, partial)) = base.split_once('/') {
            let provider = self.provider_named(&prefix.to_ascii_lowercase())?;
            let matched = self.try_match(provider, partial).await?;
            return Some(format!("{}/{matched}{suffix}", provider.name));
        }

        // No prefix: waterfall over all providers.
        for provider in &self.providers {
            if let Some(matched) = self.try_match(provider, base).await {
                return Some(format!("{}/{matched}{suffix}", provider.name));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ListModelsCommand, ListedModel};
    use crate::error::RelayError;
    use crate::provider::{Command, ProviderStyle};
    use std::collections::{HashMap, HashSet};

    struct FixedList(Vec<&'static str>);
    #[async_trait]
    impl ListModelsCommand for FixedList {
        async fn do_list_models(
            &self,
            _provider: &Provider,
            _ctx: &RequestContext,
        ) -> Result<Vec<ListedModel>, RelayError> {
            Ok(self
                .0
                .iter()
                .map(|id| ListedModel {
                    id: id.to_string(),
                    ..Default::default()
                })
                .collect())
        }
    }

    fn provider(name: &str, models: Vec<&'static str>) -> Arc<Provider> {
        let mut commands = HashMap::new();
        commands.insert(
            "list_models".to_string(),
            Command::ListModels(Arc::new(FixedList(models))),
        );
        Arc::new(Provider {
            name: name.into(),
            base_url: None,
            style: ProviderStyle::Wire(ail::Style::ChatCompletions),
            commands,
            exported_models: HashSet::new(),
            private: false,
            api_key_env: None,
        })
    }

    fn fuzz() -> Fuzz {
        Fuzz::new(vec![
            provider("openai", vec!["gpt-4-0613", "gpt-3.5-turbo"]),
            provider("anthropic", vec!["claude-3-opus"]),
        ])
    }

    #[tokio::test]
    async fn exact_match_does_not_rewrite() {
        let fuzz = Fuzz::new(vec![provider("openai", vec!["gpt-4"])]);
        assert_eq!(fuzz.rewrite_model("openai/gpt-4").await, None);
    }

    #[tokio::test]
    async fn partial_match_preserves_plugin_suffix() {
        let fuzz = fuzz();
        assert_eq!(
            fuzz.rewrite_model("openai/gpt-4+fuzz+logger").await.as_deref(),
            Some("openai/gpt-4-0613+fuzz+logger")
        );
    }

    #[tokio::test]
    async fn waterfall_over_all_providers() {
        let fuzz = fuzz();
        assert_eq!(
            fuzz.rewrite_model("claude-3").await.as_deref(),
            Some("anthropic/claude-3-opus")
        );
    }

    #[tokio::test]
    async fn scoped_miss_does_not_waterfall() {
        let fuzz = fuzz();
        assert_eq!(fuzz.rewrite_model("openai/claude-3").await, None);
    }

    #[tokio::test]
    async fn missing_list_capability_yields_no_match() {
        let bare = Arc::new(Provider {
            name: "bare".into(),
            base_url: None,
            style: ProviderStyle::Wire(ail::Style::ChatCompletions),
            commands: HashMap::new(),
            exported_models: HashSet::new(),
            private: false,
            api_key_env: None,
        });
        let fuzz = Fuzz::new(vec![bare]);
        assert_eq!(fuzz.rewrite_model("bare/gpt").await, None);
    }
}
