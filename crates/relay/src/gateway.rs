use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::AuthService;
use crate::error::RelayError;
use crate::plugin::{parse_model_suffix, PluginRegistry};
use crate::provider::Provider;

/// A named ordering of candidate providers.
#[derive(Debug, Clone)]
pub struct RouterDef {
    pub name: String,
    pub order: Vec<String>,
}

/// Process-wide gateway state: the provider table, routers, plugin
/// registry, and auth service. Built once during provisioning and
/// read-only afterwards; requests share it behind an `Arc`.
pub struct Gateway {
    providers: Vec<Arc<Provider>>,
    by_name: HashMap<String, Arc<Provider>>,
    routers: HashMap<String, RouterDef>,
    pub registry: PluginRegistry,
    pub auth: AuthService,
}

impl Gateway {
    pub fn new(
        providers: Vec<Arc<Provider>>,
        routers: Vec<RouterDef>,
        registry: PluginRegistry,
        auth: AuthService,
    ) -> Self {
        let by_name = providers
            .iter()
            .map(|provider| (provider.name.clone(), provider.clone()))
            .collect();
        Gateway {
            providers,
            by_name,
            routers: routers
                .into_iter()
                .map(|router| (router.name.clone(), router))
                .collect(),
            registry,
            auth,
        }
    }

    /// All provisioned providers, in configuration order.
    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<Provider>> {
        self.by_name.get(name)
    }

    pub fn router(&self, name: &str) -> Result<&RouterDef, RelayError> {
        self.routers
            .get(name)
            .ok_or_else(|| RelayError::RouterMisconfig(format!("router {name} not found")))
    }

    /// Resolves the candidate provider order and the model to send
    /// upstream. A `provider/` prefix naming a known provider puts it
    /// first (the rest of the router's order follows for failover) and
    /// strips the prefix from the model; otherwise every provider in the
    /// router's order is a candidate for the bare model. Plugin suffixes
    /// are not part of the upstream model.
    pub fn resolve_order_and_model(
        &self,
        router: &RouterDef,
        model: &str,
    ) -> (Vec<String>, String) {
        let (base, _) = parse_model_suffix(model);
        if let Some((prefix, rest)) = base.split_once('/') {
            if self.by_name.contains_key(prefix) {
                let mut order = vec![prefix.to_string()];
                order.extend(
                    router
                        .order
                        .iter()
                        .filter(|name| name.as_str() != prefix)
                        .cloned(),
                );
                return (order, rest.to_string());
            }
        }
        (router.order.clone(), base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderStyle;

    fn provider(name: &str) -> Arc<Provider> {
        Arc::new(Provider {
            name: name.into(),
            base_url: None,
            style: ProviderStyle::Wire(ail::Style::ChatCompletions),
            commands: HashMap::new(),
            exported_models: Default::default(),
            private: false,
            api_key_env: None,
        })
    }

    fn gateway() -> Gateway {
        Gateway::new(
            vec![provider("openai"), provider("anthropic")],
            vec![RouterDef {
                name: "default".into(),
                order: vec!["openai".into(), "anthropic".into()],
            }],
            PluginRegistry::new(),
            AuthService::default(),
        )
    }

    #[test]
    fn prefixed_model_scopes_to_provider_first() {
        let gw = gateway();
        let router = gw.router("default").unwrap();
        let (order, model) = gw.resolve_order_and_model(router, "openai/gpt-4+fuzz");
        assert_eq!(order, vec!["openai".to_string(), "anthropic".to_string()]);
        assert_eq!(model, "gpt-4");

        let (order, model) = gw.resolve_order_and_model(router, "anthropic/claude-3-opus");
        assert_eq!(order[0], "anthropic");
        assert_eq!(model, "claude-3-opus");
    }

    #[test]
    fn bare_model_waterfalls_in_router_order() {
        let gw = gateway();
        let router = gw.router("default").unwrap();
        let (order, model) = gw.resolve_order_and_model(router, "claude-3+slwin:5");
        assert_eq!(order, vec!["openai".to_string(), "anthropic".to_string()]);
        assert_eq!(model, "claude-3");
    }

    #[test]
    fn unknown_prefix_is_part_of_the_model() {
        let gw = gateway();
        let router = gw.router("default").unwrap();
        let (order, model) = gw.resolve_order_and_model(router, "ft/custom-model");
        assert_eq!(order.len(), 2);
        assert_eq!(model, "ft/custom-model");
    }

    #[test]
    fn missing_router_is_a_misconfiguration() {
        let gw = gateway();
        assert!(matches!(
            gw.router("nope"),
            Err(RelayError::RouterMisconfig(_))
        ));
    }
}
