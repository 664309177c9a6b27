use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use url::Url;

use crate::drivers::{InferenceCommand, ListModelsCommand};

/// The wire style a provider speaks, or `Virtual` for alias-only
/// providers that never receive upstream traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStyle {
    Wire(ail::Style),
    Virtual,
}

impl ProviderStyle {
    pub fn wire(self) -> Option<ail::Style> {
        match self {
            ProviderStyle::Wire(style) => Some(style),
            ProviderStyle::Virtual => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderStyle::Wire(style) => style.as_str(),
            ProviderStyle::Virtual => "virtual",
        }
    }

    /// Parses a configuration style string. The empty string defaults to
    /// OpenAI chat completions.
    pub fn parse(name: &str) -> Option<ProviderStyle> {
        match name {
            "virtual" => Some(ProviderStyle::Virtual),
            "openai-chat-completions" | "openai" | "" => {
                Some(ProviderStyle::Wire(ail::Style::ChatCompletions))
            }
            "anthropic-messages" | "anthropic" => Some(ProviderStyle::Wire(ail::Style::Anthropic)),
            "google-genai" | "google" => Some(ProviderStyle::Wire(ail::Style::GoogleGenAi)),
            _ => None,
        }
    }
}

/// An opaque provider capability, keyed in the commands table.
#[derive(Clone)]
pub enum Command {
    Inference(Arc<dyn InferenceCommand>),
    ListModels(Arc<dyn ListModelsCommand>),
}

/// Runtime descriptor of one upstream (or virtual) provider. Built during
/// provisioning and read-only for the process lifetime.
pub struct Provider {
    pub name: String,
    pub base_url: Option<Url>,
    pub style: ProviderStyle,
    pub commands: HashMap<String, Command>,

    /// Models this provider exposes externally. Empty means no filtering.
    pub exported_models: HashSet<String>,

    /// A private provider exports nothing and rejects direct inference;
    /// it is only reachable as a virtual-alias target.
    pub private: bool,

    /// Environment variable holding the upstream credential.
    pub api_key_env: Option<String>,
}

impl Provider {
    pub fn is_model_exported(&self, model: &str) -> bool {
        if self.private {
            return false;
        }
        if self.exported_models.is_empty() {
            return true;
        }
        self.exported_models.contains(model)
    }

    pub fn inference(&self) -> Option<Arc<dyn InferenceCommand>> {
        match self.commands.get("inference") {
            Some(Command::Inference(cmd)) => Some(cmd.clone()),
            _ => None,
        }
    }

    pub fn list_models(&self) -> Option<Arc<dyn ListModelsCommand>> {
        match self.commands.get("list_models") {
            Some(Command::ListModels(cmd)) => Some(cmd.clone()),
            _ => None,
        }
    }
}
