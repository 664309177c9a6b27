//! End-to-end gateway scenarios over the axum application, with wiremock
//! upstreams or scripted drivers standing in for providers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ail::{Op, Program};
use relay::config::Config;
use relay::context::RequestContext;
use relay::drivers::{InferenceCommand, StreamItem, UpstreamMeta};
use relay::error::RelayError;
use relay::gateway::{Gateway, RouterDef};
use relay::plugin::{
    build_tool_def, BeforeHook, Plugin, PluginRegistry, StreamEndHook, ToolCallContext,
    ToolHandler, ToolPlugin,
};
use relay::provider::{Command, Provider, ProviderStyle};
use relay::server::{build_router, AppState};

fn app_for(gateway: Gateway, router: &str) -> axum::Router {
    build_router(AppState::new(Arc::new(gateway), router))
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn mock_models(server: &MockServer, ids: &[&str]) {
    let data: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data})))
        .mount(server)
        .await;
}

fn provisioned(yaml: &str) -> Gateway {
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    config.provision().unwrap()
}

// ── Scenario: simple text round-trip ────────────────────────────────────

#[tokio::test]
async fn simple_text_round_trip() {
    let server = MockServer::start().await;
    mock_models(&server, &["m"]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "model": "m",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let gateway = provisioned(&format!(
        "providers:\n  - name: prov\n    base_url: {}\n",
        server.uri()
    ));
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "prov/m",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-real-provider-id").unwrap(), "prov");
    assert_eq!(response.headers().get("x-real-model-id").unwrap(), "m");
    let body = body_string(response).await;
    assert!(body.contains("\"content\":\"hello\""), "body: {body}");
}

// ── Scenario: fuzz partial match resolves the upstream model ────────────

#[tokio::test]
async fn fuzz_partial_match_rewrites_model() {
    let server = MockServer::start().await;
    mock_models(&server, &["gpt-4-0613", "gpt-3.5-turbo"]).await;
    // Only the fuzz-resolved model id is answered.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4-0613"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "resolved"},
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let gateway = provisioned(&format!(
        "providers:\n  - name: openai\n    base_url: {}\n",
        server.uri()
    ));
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "openai/gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-real-model-id").unwrap(),
        "gpt-4-0613"
    );
    let body = body_string(response).await;
    assert!(body.contains("resolved"));
}

// ── Scenario: virtual alias bypasses the exports filter ─────────────────

#[tokio::test]
async fn virtual_alias_resolves_and_bypasses_exports() {
    let server = MockServer::start().await;
    mock_models(&server, &[]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "cheap answer"},
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    // The target provider is private, so only the virtual bypass reaches
    // it.
    let gateway = provisioned(&format!(
        "routers:\n  - name: default\n    providers: [openai, fast]\n\
         providers:\n  - name: openai\n    base_url: {}\n    private: true\n\
         \x20 - name: fast\n    style: virtual\n    models:\n      cheap: openai/gpt-4o-mini+stools\n",
        server.uri()
    ));
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "fast/cheap+logger",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-real-model-id").unwrap(),
        "gpt-4o-mini"
    );
    assert_eq!(response.headers().get("x-real-provider-id").unwrap(), "openai");
    let executed = response
        .headers()
        .get("x-plugins-executed")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(executed.contains("stools"), "executed: {executed}");
    assert!(executed.contains("logger"), "executed: {executed}");
    let body = body_string(response).await;
    assert!(body.contains("cheap answer"));
}

// ── Scenario: every candidate rejects the model on exports grounds ──────

#[tokio::test]
async fn all_candidates_reject_model_is_structured_404() {
    let server_x = MockServer::start().await;
    let server_z = MockServer::start().await;
    mock_models(&server_x, &[]).await;
    mock_models(&server_z, &["other"]).await;

    let gateway = provisioned(&format!(
        "routers:\n  - name: default\n    providers: [x, z]\n\
         providers:\n  - name: x\n    base_url: {}\n    private: true\n\
         \x20 - name: z\n    base_url: {}\n    exports: [other]\n",
        server_x.uri(),
        server_z.uri()
    ));
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "x/y",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["code"], "model_not_found");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

// ── Failover ────────────────────────────────────────────────────────────

#[tokio::test]
async fn upstream_failure_fails_over_to_next_provider() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    mock_models(&server_a, &["m"]).await;
    mock_models(&server_b, &["m"]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("a is down"))
        .mount(&server_a)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "b answered"},
                "finish_reason": "stop"
            }]
        })))
        .mount(&server_b)
        .await;

    let gateway = provisioned(&format!(
        "routers:\n  - name: default\n    providers: [a, b]\n\
         providers:\n  - name: a\n    base_url: {}\n  - name: b\n    base_url: {}\n",
        server_a.uri(),
        server_b.uri()
    ));
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-real-provider-id").unwrap(), "b");
    let body = body_string(response).await;
    assert!(body.contains("b answered"));
}

/// Before-hook failures abort the attempt and advance to the next
/// candidate.
struct FailBeforeOn;

impl Plugin for FailBeforeOn {
    fn name(&self) -> &str {
        "failon"
    }
    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }
}

#[async_trait]
impl BeforeHook for FailBeforeOn {
    async fn before(
        &self,
        params: &str,
        provider: &Provider,
        _ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        if provider.name == params {
            return Err(RelayError::plugin("failon", "induced failure"));
        }
        Ok(prog)
    }
}

#[tokio::test]
async fn before_hook_error_fails_over() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    mock_models(&server_a, &["m"]).await;
    mock_models(&server_b, &["m"]).await;
    for server in [&server_a, &server_b] {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "ok"},
                    "finish_reason": "stop"
                }]
            })))
            .mount(server)
            .await;
    }

    let mut gateway = provisioned(&format!(
        "routers:\n  - name: default\n    providers: [a, b]\n\
         providers:\n  - name: a\n    base_url: {}\n  - name: b\n    base_url: {}\n",
        server_a.uri(),
        server_b.uri()
    ));
    gateway.registry.register(Arc::new(FailBeforeOn));
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "m+failon:a",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-real-provider-id").unwrap(), "b");
}

// ── Scenario: streaming chunks assembled ────────────────────────────────

struct ScriptedStreamDriver {
    chunks: Vec<Program>,
}

#[async_trait]
impl InferenceCommand for ScriptedStreamDriver {
    async fn do_inference(
        &self,
        _provider: &Provider,
        _prog: &Program,
        _ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, Program), RelayError> {
        Err(RelayError::Provider("non-streaming unsupported".into()))
    }

    async fn do_inference_stream(
        &self,
        _provider: &Provider,
        _prog: &Program,
        _ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, mpsc::Receiver<StreamItem>), RelayError> {
        let (tx, rx) = mpsc::channel(8);
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(StreamItem::Chunk(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok((
            UpstreamMeta {
                status: StatusCode::OK,
                headers: Default::default(),
            },
            rx,
        ))
    }
}

#[derive(Default)]
struct CaptureStreamEnd {
    text: Mutex<String>,
}

impl Plugin for CaptureStreamEnd {
    fn name(&self) -> &str {
        "capture"
    }
    fn as_stream_end(&self) -> Option<&dyn StreamEndHook> {
        Some(self)
    }
}

#[async_trait]
impl StreamEndHook for CaptureStreamEnd {
    async fn stream_end(
        &self,
        _params: &str,
        _provider: &Provider,
        _ctx: &RequestContext,
        _req_prog: &Program,
        _upstream: &UpstreamMeta,
        assembled: &Program,
    ) -> Result<(), RelayError> {
        let text = assembled
            .messages()
            .first()
            .map(|span| assembled.message_text(span))
            .unwrap_or_default();
        *self.text.lock().unwrap() = text;
        Ok(())
    }
}

fn scripted_provider(name: &str, cmd: Arc<dyn InferenceCommand>) -> Arc<Provider> {
    let mut commands = HashMap::new();
    commands.insert("inference".to_string(), Command::Inference(cmd));
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

#[tokio::test]
async fn streaming_chunks_reach_client_and_assemble() {
    let mut c1 = Program::new();
    c1.emit_text(Op::RespId, "r1");
    c1.emit_text(Op::RespModel, "m");
    c1.emit(Op::StreamStart);
    c1.emit_text(Op::StreamDelta, "he");
    let mut c2 = Program::new();
    c2.emit_text(Op::StreamDelta, "llo");
    let mut c3 = Program::new();
    c3.emit_text(Op::RespDone, "stop");

    let driver = Arc::new(ScriptedStreamDriver {
        chunks: vec![c1, c2, c3],
    });
    let capture = Arc::new(CaptureStreamEnd::default());

    let mut registry = PluginRegistry::new();
    registry.register(capture.clone());
    let gateway = Gateway::new(
        vec![scripted_provider("prov", driver)],
        vec![RouterDef {
            name: "default".into(),
            order: vec!["prov".into()],
        }],
        registry,
        Default::default(),
    );
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "prov/m+capture",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = body_string(response).await;
    assert!(body.starts_with(": ok\n\n"), "body: {body}");
    let frames: Vec<&str> = body
        .split("\n\n")
        .filter(|frame| frame.starts_with("data: "))
        .collect();
    assert_eq!(frames.len(), 4, "body: {body}");
    assert!(frames[0].contains("\"he\""));
    assert!(frames[1].contains("\"llo\""));
    assert!(frames[2].contains("\"finish_reason\":\"stop\""));
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    assert_eq!(capture.text.lock().unwrap().as_str(), "hello");
}

// ── Scenario: on-router tool loop ───────────────────────────────────────

struct ClockHandler;

#[async_trait]
impl ToolHandler for ClockHandler {
    fn tool_name(&self) -> &str {
        "myclock"
    }
    fn tool_defs(&self, _params: &str) -> Vec<ail::Instruction> {
        build_tool_def("now", "current time", Some(json!({"type": "object"})))
    }
    async fn handle_tool_call(
        &self,
        _params: &str,
        _call_id: &str,
        _args: Option<&Value>,
        _tcx: &ToolCallContext<'_>,
    ) -> Result<Option<String>, RelayError> {
        Ok(Some("2024-01-01T00:00:00Z".to_string()))
    }
}

struct ScriptedDriver {
    responses: Mutex<VecDeque<Program>>,
    seen: Mutex<Vec<Program>>,
}

#[async_trait]
impl InferenceCommand for ScriptedDriver {
    async fn do_inference(
        &self,
        _provider: &Provider,
        prog: &Program,
        _ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, Program), RelayError> {
        self.seen.lock().unwrap().push(prog.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RelayError::Provider("script exhausted".into()))?;
        Ok((
            UpstreamMeta {
                status: StatusCode::OK,
                headers: Default::default(),
            },
            response,
        ))
    }

    async fn do_inference_stream(
        &self,
        _provider: &Provider,
        _prog: &Program,
        _ctx: &RequestContext,
    ) -> Result<(UpstreamMeta, mpsc::Receiver<StreamItem>), RelayError> {
        Err(RelayError::Provider("streaming unsupported".into()))
    }
}

// ── Raw-IR endpoint ─────────────────────────────────────────────────────

#[tokio::test]
async fn raw_ail_endpoint_round_trips_text_and_binary() {
    let mut reply = Program::new();
    reply.emit(Op::MsgStart);
    reply.emit(Op::RoleAssistant);
    reply.emit_text(Op::TxtChunk, "hello from ail");
    reply.emit_text(Op::RespDone, "stop");
    reply.emit(Op::MsgEnd);

    let driver = Arc::new(ScriptedDriver {
        responses: Mutex::new(VecDeque::from([reply.clone(), reply])),
        seen: Mutex::new(Vec::new()),
    });
    let gateway = Gateway::new(
        vec![scripted_provider("prov", driver)],
        vec![RouterDef {
            name: "default".into(),
            order: vec!["prov".into()],
        }],
        PluginRegistry::new(),
        Default::default(),
    );
    let app = app_for(gateway, "default");

    let mut request_prog = Program::new();
    request_prog.set_model("prov/m");
    request_prog.emit(Op::MsgStart);
    request_prog.emit(Op::RoleUser);
    request_prog.emit_text(Op::TxtChunk, "hi");
    request_prog.emit(Op::MsgEnd);

    // Text in, text out.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/ail")
                .header("content-type", "text/x-ail")
                .body(Body::from(request_prog.disasm()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let parsed = Program::asm(&body_string(response).await).unwrap();
    let msgs = parsed.messages();
    assert_eq!(parsed.message_text(&msgs[0]), "hello from ail");

    // Binary in (sniffed by magic), binary out.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/ail")
                .body(Body::from(request_prog.to_bytes().unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-ail"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed = Program::from_bytes(&bytes).unwrap();
    let msgs = parsed.messages();
    assert_eq!(parsed.message_text(&msgs[0]), "hello from ail");
}

#[tokio::test]
async fn raw_ail_rejects_empty_body() {
    let gateway = Gateway::new(
        Vec::new(),
        vec![RouterDef {
            name: "default".into(),
            order: Vec::new(),
        }],
        PluginRegistry::new(),
        Default::default(),
    );
    let app = app_for(gateway, "default");
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/ail")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tool_loop_dispatches_and_returns_final_text() {
    let mut round1 = Program::new();
    round1.emit_text(Op::RespId, "r1");
    round1.emit(Op::MsgStart);
    round1.emit(Op::RoleAssistant);
    round1.emit_text(Op::CallStart, "call_7");
    round1.emit_text(Op::CallName, "now");
    round1.emit_json(Op::CallArgs, json!({}));
    round1.emit(Op::CallEnd);
    round1.emit_text(Op::RespDone, "tool_calls");
    round1.emit(Op::MsgEnd);

    let mut round2 = Program::new();
    round2.emit_text(Op::RespId, "r2");
    round2.emit(Op::MsgStart);
    round2.emit(Op::RoleAssistant);
    round2.emit_text(Op::TxtChunk, "it's new year");
    round2.emit_text(Op::RespDone, "stop");
    round2.emit(Op::MsgEnd);

    let driver = Arc::new(ScriptedDriver {
        responses: Mutex::new(VecDeque::from([round1, round2])),
        seen: Mutex::new(Vec::new()),
    });

    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(ToolPlugin::new(ClockHandler)));
    let gateway = Gateway::new(
        vec![scripted_provider("prov", driver.clone())],
        vec![RouterDef {
            name: "default".into(),
            order: vec!["prov".into()],
        }],
        registry,
        Default::default(),
    );
    let app = app_for(gateway, "default");

    let response = app
        .oneshot(chat_request(json!({
            "model": "prov/m+myclock",
            "messages": [{"role": "user", "content": "what time is it"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    // The client only sees the final round.
    assert!(body.contains("it's new year"), "body: {body}");
    assert!(!body.contains("call_7"), "body: {body}");

    // The second upstream round carried the synthetic tool result.
    let seen = driver.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let results = seen[1].tool_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].call_id, "call_7");
    let data = seen[1]
        .code
        .iter()
        .find(|inst| inst.op == Op::ResultData)
        .map(|inst| inst.text.clone())
        .unwrap();
    assert_eq!(data, "2024-01-01T00:00:00Z");
    // Both rounds saw the injected definition.
    assert!(seen[0].tool_defs().iter().any(|def| def.name == "now"));
}
