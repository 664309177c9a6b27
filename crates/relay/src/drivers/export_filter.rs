use std::sync::Arc;

use async_trait::async_trait;

use super::{ListModelsCommand, ListedModel};
use crate::context::RequestContext;
use crate::error::RelayError;
use crate::provider::Provider;

/// Wraps a `list_models` command and filters its results to the
/// provider's exports set, so every consumer (the `/models` endpoint, the
/// fuzz matcher) sees only exported models. Private providers return an
/// empty list without calling upstream.
pub struct ExportFilteredListModels {
    pub inner: Arc<dyn ListModelsCommand>,
}

impl ExportFilteredListModels {
    pub fn new(inner: Arc<dyn ListModelsCommand>) -> Self {
        ExportFilteredListModels { inner }
    }
}

#[async_trait]
impl ListModelsCommand for ExportFilteredListModels {
    async fn do_list_models(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
    ) -> Result<Vec<ListedModel>, RelayError> {
        if provider.private {
            return Ok(Vec::new());
        }
        let models = self.inner.do_list_models(provider, ctx).await?;
        if provider.exported_models.is_empty() {
            return Ok(models);
        }
        Ok(models
            .into_iter()
            .filter(|model| provider.exported_models.contains(&model.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderStyle;
    use std::collections::HashMap;

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
                    object: "model".into(),
                    ..Default::default()
                })
                .collect())
        }
    }

    fn provider(private: bool, exports: &[&str]) -> Provider {
        Provider {
            name: "p".into(),
            base_url: None,
            style: ProviderStyle::Wire(ail::Style::ChatCompletions),
            commands: HashMap::new(),
            exported_models: exports.iter().map(|m| m.to_string()).collect(),
            private,
            api_key_env: None,
        }
    }

    #[tokio::test]
    async fn filters_to_exports() {
        let cmd = ExportFilteredListModels::new(Arc::new(FixedList(vec!["a", "b", "c"])));
        let ctx = RequestContext::new();

        let all = cmd
            .do_list_models(&provider(false, &[]), &ctx)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let filtered = cmd
            .do_list_models(&provider(false, &["b"]), &ctx)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "b");

        let hidden = cmd
            .do_list_models(&provider(true, &[]), &ctx)
            .await
            .unwrap();
        assert!(hidden.is_empty());
    }
}
