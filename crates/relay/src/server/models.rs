//! Aggregated `/v1/models` listing across the default router's
//! providers. Listings are already export-filtered at provisioning time,
//! so private providers and unexported models never appear.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::json;
use tracing::warn;

use crate::context::RequestContext;
use crate::gateway::Gateway;

pub async fn list_models(
    gateway: &Arc<Gateway>,
    router_name: &str,
    headers: &HeaderMap,
) -> axum::response::Response {
    let router = match gateway.router(router_name) {
        Ok(router) => router.clone(),
        Err(e) => return super::respond::plain_error(e.status(), &e.to_string()),
    };

    let mut ctx = RequestContext::new();
    ctx.bearer = gateway.auth.collect_incoming(headers).ok().flatten();

    let mut data = Vec::new();
    for name in &router.order {
        let Some(provider) = gateway.provider(name) else {
            continue;
        };
        let Some(cmd) = provider.list_models() else {
            continue;
        };
        match cmd.do_list_models(provider, &ctx).await {
            Ok(models) => {
                for model in models {
                    data.push(json!({
                        "object": "model",
                        "id": format!("{}/{}", provider.name, model.id),
                        "created": model.created,
                        "owned_by": provider.name,
                    }));
                }
            }
            Err(e) => {
                warn!(provider = %provider.name, error = %e, "list_models failed");
            }
        }
    }

    axum::response::Response::builder()
        .status(axum::http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(
            serde_json::to_vec(&json!({"object": "list", "data": data})).unwrap_or_default(),
        ))
        .unwrap_or_default()
}
