//! Provider command interfaces and drivers.

mod export_filter;
mod http_driver;
mod virtual_alias;

pub use export_filter::ExportFilteredListModels;
pub use http_driver::HttpDriver;
pub use virtual_alias::{VirtualAlias, VirtualListModels};

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ail::Program;

use crate::context::RequestContext;
use crate::error::RelayError;
use crate::provider::Provider;

/// One model as reported by a provider's listing.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ListedModel {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub object: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub owned_by: String,
}

/// Status and headers of the upstream HTTP exchange, handed to the
/// response-side plugin hooks.
#[derive(Debug, Clone)]
pub struct UpstreamMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// One item on a driver's streaming channel. The producer closes the
/// channel after the terminal item (completion, error, or cancellation).
#[derive(Debug)]
pub enum StreamItem {
    Chunk(Program),
    Error(RelayError),
}

/// The unified inference capability. A driver takes an AIL program,
/// converts it to the provider's native format, performs the HTTP call,
/// and parses the result back into AIL.
#[async_trait]
pub trait InferenceCommand: Send + Sync {
    async fn do_inference(
        &self,
        provider: &Provider,
        prog: &Program,
        ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, Program), RelayError>;

    async fn do_inference_stream(
        &self,
        provider: &Provider,
        prog: &Program,
        ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, mpsc::Receiver<StreamItem>), RelayError>;
}

/// Lists the models a provider offers.
#[async_trait]
pub trait ListModelsCommand: Send + Sync {
    async fn do_list_models(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
    ) -> Result<Vec<ListedModel>, RelayError>;
}
