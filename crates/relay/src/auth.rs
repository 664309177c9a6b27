use axum::http::HeaderMap;
use reqwest::RequestBuilder;

use crate::error::RelayError;
use crate::provider::Provider;

/// Anthropic-style upstreams require a version header alongside the key.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Credential collection: extracts the client's bearer token on the way
/// in, injects per-provider credentials on the way out.
#[derive(Debug, Clone, Default)]
pub struct AuthService {
    /// Reject requests that carry no bearer token.
    pub require_auth: bool,
}

impl AuthService {
    pub fn new(require_auth: bool) -> Self {
        AuthService { require_auth }
    }

    /// Collects the incoming bearer token from request headers.
    pub fn collect_incoming(&self, headers: &HeaderMap) -> Result<Option<String>, RelayError> {
        let bearer = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.to_string());
        if self.require_auth && bearer.is_none() {
            return Err(RelayError::AuthFailed("missing bearer token".into()));
        }
        Ok(bearer)
    }

    /// Resolves the upstream credential for a provider from its
    /// configured environment variable.
    pub fn target_credential(&self, provider: &Provider) -> Option<String> {
        provider
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }

    /// Applies the provider's credential in the header style its wire
    /// format expects.
    pub fn apply_target_auth(
        &self,
        provider: &Provider,
        mut request: RequestBuilder,
    ) -> RequestBuilder {
        let Some(key) = self.target_credential(provider) else {
            return request;
        };
        match provider.style.wire() {
            Some(ail::Style::Anthropic) => {
                request = request
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION);
            }
            Some(ail::Style::GoogleGenAi) => {
                request = request.header("x-goog-api-key", key);
            }
            _ => {
                request = request.bearer_auth(key);
            }
        }
        request
    }
}
