//! The generic upstream driver: style-driven emit → HTTP call → parse.

use axum::http::StatusCode;
use futures::TryStreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, error};
use url::Url;

use ail::{codec_for, Program, Style};

use super::{InferenceCommand, ListModelsCommand, ListedModel, StreamItem, UpstreamMeta};
use crate::auth::AuthService;
use crate::context::RequestContext;
use crate::error::RelayError;
use crate::provider::Provider;
use crate::sse;

use async_trait::async_trait;

pub struct HttpDriver {
    client: reqwest::Client,
    auth: AuthService,
}

impl HttpDriver {
    pub fn new(client: reqwest::Client, auth: AuthService) -> Self {
        HttpDriver { client, auth }
    }

    fn wire_style(provider: &Provider) -> Result<Style, RelayError> {
        provider.style.wire().ok_or_else(|| {
            RelayError::Provider(format!("provider {} has no wire style", provider.name))
        })
    }

    fn base_url(provider: &Provider) -> Result<&Url, RelayError> {
        provider.base_url.as_ref().ok_or_else(|| {
            RelayError::Provider(format!("provider {} has no base url", provider.name))
        })
    }

    fn join(base: &Url, endpoint: &str) -> Result<Url, RelayError> {
        let mut url = base.clone();
        let path = format!("{}/{}", base.path().trim_end_matches('/'), endpoint);
        url.set_path(&path);
        Ok(url)
    }

    fn inference_url(
        provider: &Provider,
        style: Style,
        prog: &Program,
        streaming: bool,
    ) -> Result<Url, RelayError> {
        let base = Self::base_url(provider)?;
        match style {
            Style::ChatCompletions => Self::join(base, "chat/completions"),
            Style::Anthropic => Self::join(base, "messages"),
            Style::GoogleGenAi => {
                let model = prog.model().unwrap_or_default();
                let action = if streaming {
                    "streamGenerateContent"
                } else {
                    "generateContent"
                };
                let mut url = Self::join(base, &format!("models/{model}:{action}"))?;
                if streaming {
                    url.set_query(Some("alt=sse"));
                }
                Ok(url)
            }
        }
    }

    fn build_request(
        &self,
        provider: &Provider,
        url: Url,
        body: Vec<u8>,
        ctx: &RequestContext,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);
        request = self.auth.apply_target_auth(provider, request);
        // Providers without a configured credential see the client's own
        // bearer token, so pass-through deployments keep working.
        if self.auth.target_credential(provider).is_none() {
            if let Some(bearer) = &ctx.bearer {
                request = request.bearer_auth(bearer);
            }
        }
        request
    }
}

#[async_trait]
impl InferenceCommand for HttpDriver {
    async fn do_inference(
        &self,
        provider: &Provider,
        prog: &Program,
        ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, Program), RelayError> {
        let style = Self::wire_style(provider)?;
        let codec = codec_for(style);
        let url = Self::inference_url(provider, style, prog, false)?;
        debug!(provider = %provider.name, model = ?prog.model(), %url, "inference request");

        let body = codec
            .emit_request(prog)
            .map_err(|e| RelayError::Emit(e.to_string()))?;
        let response = self.build_request(provider, url, body, ctx).send().await?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let headers = response.headers().clone();
        let meta = UpstreamMeta { status, headers };
        let payload = response.bytes().await?;

        if !status.is_success() {
            error!(provider = %provider.name, %status, "upstream returned error");
            return Err(RelayError::Provider(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }

        let res_prog = codec
            .parse_response(&payload)
            .map_err(|e| RelayError::Provider(format!("response parse failed: {e}")))?;
        Ok((meta, res_prog))
    }

    async fn do_inference_stream(
        &self,
        provider: &Provider,
        prog: &Program,
        ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, mpsc::Receiver<StreamItem>), RelayError> {
        let style = Self::wire_style(provider)?;
        let codec = codec_for(style);
        let url = Self::inference_url(provider, style, prog, true)?;
        debug!(provider = %provider.name, model = ?prog.model(), %url, "inference stream request");

        let body = codec
            .emit_request(prog)
            .map_err(|e| RelayError::Emit(e.to_string()))?;
        let response = self.build_request(provider, url, body, ctx).send().await?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let headers = response.headers().clone();
        let meta = UpstreamMeta {
            status,
            headers: headers.clone(),
        };

        let (tx, rx) = mpsc::channel::<StreamItem>(16);
        let provider_name = provider.name.clone();
        tokio::spawn(async move {
            if !status.is_success() {
                let payload = response.bytes().await.unwrap_or_default();
                error!(provider = %provider_name, %status, "upstream stream returned error");
                let _ = tx
                    .send(StreamItem::Error(RelayError::Provider(format!(
                        "{} - {}",
                        status,
                        String::from_utf8_lossy(&payload)
                    ))))
                    .await;
                return;
            }

            let is_sse = headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"))
                .unwrap_or(false);

            if !is_sse {
                // The upstream answered without streaming; deliver the
                // whole response as a single chunk.
                let payload = match response.bytes().await {
                    Ok(payload) => payload,
                    Err(e) => {
                        let _ = tx.send(StreamItem::Error(e.into())).await;
                        return;
                    }
                };
                match codec.parse_response(&payload) {
                    Ok(chunk) => {
                        let _ = tx.send(StreamItem::Chunk(chunk)).await;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StreamItem::Error(RelayError::Provider(e.to_string())))
                            .await;
                    }
                }
                return;
            }

            let stream = response.bytes_stream().map_err(std::io::Error::other);
            let reader = StreamReader::new(stream);
            let mut lines = FramedRead::new(reader, LinesCodec::new());

            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = tx
                            .send(StreamItem::Error(RelayError::Provider(e.to_string())))
                            .await;
                        return;
                    }
                };
                let Some(payload) = sse::data_line(&line) else {
                    continue;
                };
                if payload == sse::DONE {
                    return;
                }
                if payload.is_empty() {
                    continue;
                }
                match codec.parse_stream_chunk(payload.as_bytes()) {
                    Ok(chunk) => {
                        if tx.send(StreamItem::Chunk(chunk)).await.is_err() {
                            // Receiver dropped: the request was cancelled.
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StreamItem::Error(RelayError::Provider(e.to_string())))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok((meta, rx))
    }
}

#[async_trait]
impl ListModelsCommand for HttpDriver {
    async fn do_list_models(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
    ) -> Result<Vec<ListedModel>, RelayError> {
        let style = Self::wire_style(provider)?;
        let url = Self::join(Self::base_url(provider)?, "models")?;

        let mut request = self.client.get(url);
        request = self.auth.apply_target_auth(provider, request);
        if self.auth.target_credential(provider).is_none() {
            if let Some(bearer) = &ctx.bearer {
                request = request.bearer_auth(bearer);
            }
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Provider(format!(
                "list_models returned {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;

        let mut models = Vec::new();
        match style {
            Style::ChatCompletions | Style::Anthropic => {
                if let Some(data) = body.get("data").and_then(Value::as_array) {
                    for item in data {
                        let id = item
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        if id.is_empty() {
                            continue;
                        }
                        models.push(ListedModel {
                            object: "model".into(),
                            name: item
                                .get("display_name")
                                .and_then(Value::as_str)
                                .unwrap_or(&id)
                                .to_string(),
                            created: item.get("created").and_then(Value::as_i64),
                            owned_by: item
                                .get("owned_by")
                                .and_then(Value::as_str)
                                .unwrap_or(&provider.name)
                                .to_string(),
                            id,
                        });
                    }
                }
            }
            Style::GoogleGenAi => {
                if let Some(data) = body.get("models").and_then(Value::as_array) {
                    for item in data {
                        let raw = item.get("name").and_then(Value::as_str).unwrap_or_default();
                        let id = raw.strip_prefix("models/").unwrap_or(raw).to_string();
                        if id.is_empty() {
                            continue;
                        }
                        models.push(ListedModel {
                            object: "model".into(),
                            name: item
                                .get("displayName")
                                .and_then(Value::as_str)
                                .unwrap_or(&id)
                                .to_string(),
                            created: None,
                            owned_by: provider.name.clone(),
                            id,
                        });
                    }
                }
            }
        }
        Ok(models)
    }
}
