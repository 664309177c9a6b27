//! YAML configuration and gateway provisioning.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::auth::AuthService;
use crate::drivers::{
    ExportFilteredListModels, HttpDriver, VirtualAlias, VirtualListModels,
};
use crate::gateway::{Gateway, RouterDef};
use crate::plugin::PluginRegistry;
use crate::plugins::{Dspy, Fuzz, KvTools, Logger, Sampler, SlidingWindow, StripTools};
use crate::provider::{Command, Provider, ProviderStyle};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub require_auth: bool,

    /// Named provider orderings. When absent, a `default` router over
    /// every configured provider is created.
    #[serde(default)]
    pub routers: Vec<RouterConfig>,

    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub plugins: PluginConfig,

    #[serde(default)]
    pub kv: KvConfig,
}

#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    pub providers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// `openai-chat-completions` (default), `anthropic-messages`,
    /// `google-genai`, or `virtual`.
    #[serde(default)]
    pub style: String,

    #[serde(default)]
    pub base_url: Option<Url>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Externally visible models; empty means all.
    #[serde(default)]
    pub exports: Vec<String>,

    #[serde(default)]
    pub private: bool,

    /// Virtual alias → target model mappings.
    #[serde(default)]
    pub models: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub fuzz: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig { fuzz: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct KvConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub dsn: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            backend: "memory".to_string(),
            dsn: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn default_router_name(&self) -> String {
        self.routers
            .first()
            .map(|router| router.name.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Builds the runtime gateway: providers with their commands, the
    /// routers, and the plugin registry.
    pub fn provision(&self) -> Result<Gateway, ConfigError> {
        let auth = AuthService::new(self.require_auth);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        let driver = Arc::new(HttpDriver::new(client.clone(), auth.clone()));

        let mut registry = PluginRegistry::new();
        let mut providers = Vec::new();

        for pc in &self.providers {
            let style = ProviderStyle::parse(&pc.style).ok_or_else(|| {
                ConfigError::Invalid(format!("provider {}: unknown style {:?}", pc.name, pc.style))
            })?;

            let mut commands = HashMap::new();
            match style {
                ProviderStyle::Virtual => {
                    registry.register_rewriter(Arc::new(VirtualAlias::new(
                        pc.name.clone(),
                        pc.models.clone(),
                    )));
                    commands.insert(
                        "list_models".to_string(),
                        Command::ListModels(Arc::new(ExportFilteredListModels::new(Arc::new(
                            VirtualListModels::new(pc.name.clone(), pc.models.clone()),
                        )))),
                    );
                }
                ProviderStyle::Wire(_) => {
                    if pc.base_url.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "provider {}: base_url is required",
                            pc.name
                        )));
                    }
                    commands.insert(
                        "inference".to_string(),
                        Command::Inference(driver.clone()),
                    );
                    commands.insert(
                        "list_models".to_string(),
                        Command::ListModels(Arc::new(ExportFilteredListModels::new(
                            driver.clone(),
                        ))),
                    );
                }
            }

            providers.push(Arc::new(Provider {
                name: pc.name.clone(),
                base_url: pc.base_url.clone(),
                style,
                commands,
                exported_models: pc.exports.iter().cloned().collect::<HashSet<_>>(),
                private: pc.private,
                api_key_env: pc.api_key_env.clone(),
            }));
        }

        // Suffix-resolvable plugins.
        if self.plugins.fuzz {
            registry.register_rewriter(Arc::new(Fuzz::new(providers.clone())));
        }
        registry.register(Arc::new(Logger));
        registry.register(Arc::new(StripTools));
        registry.register(Arc::new(SlidingWindow));
        let kv_dsn = std::env::var("RELAY_KV_DSN").unwrap_or_else(|_| self.kv.dsn.clone());
        registry.register(Arc::new(KvTools::new(self.kv.backend.clone(), kv_dsn)));
        registry.register(Arc::new(Dspy::new(client)));

        // The sampler joins the tail list when enabled, so its Before
        // hook sees the fully prepared upstream program.
        if let Ok(dir) = std::env::var("SAMPLER") {
            if !dir.is_empty() {
                registry.push_tail(crate::plugin::PluginInstance::new(
                    Arc::new(Sampler::new(dir)),
                    "",
                ));
            }
        }

        let routers = if self.routers.is_empty() {
            vec![RouterDef {
                name: "default".to_string(),
                order: self.providers.iter().map(|pc| pc.name.clone()).collect(),
            }]
        } else {
            self.routers
                .iter()
                .map(|rc| RouterDef {
                    name: rc.name.clone(),
                    order: rc.providers.clone(),
                })
                .collect()
        };

        Ok(Gateway::new(providers, routers, registry, auth))
    }
}
