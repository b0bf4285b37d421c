//! End-to-end HTTP tests: the router served on an ephemeral port.

use std::sync::Arc;

use kiln_engine::{
    Collaborators, Engine, EngineConfig, LogPublisher, MemoryFunctionRepo,
    MemoryProjectSettings, MemorySourceStore, NullDownstream, SourceFile,
};
use kiln_gateway::routes;
use kiln_gateway::state::AppState;
use serde_json::json;

const GAMESPACE: &str = "1";
const APP: &str = "testapp";
const VERSION: &str = "0.1";
const COMMIT: &str = "f1e2d3";

const TEST_JS: &str = r#"
function simple_call(args) {
    return "simple_call_test_" + args["arg1"];
}
simple_call.allow_call = true;

function simple_call_sum(args) {
    return args["arg1"] + args["arg2"];
}
simple_call_sum.allow_call = true;

function error_call(args) {
    throw new Error(args["code"], args["message"]);
}
error_call.allow_call = true;

function simple_call_disallowed() {
    return "simple_call_test";
}
"#;

async fn serve() -> String {
    let sources = Arc::new(MemorySourceStore::new());
    let settings = Arc::new(MemoryProjectSettings::new());
    sources.put(
        GAMESPACE,
        APP,
        COMMIT,
        vec![SourceFile::new("test.js", TEST_JS)],
    );
    settings.bind_version(GAMESPACE, APP, VERSION, COMMIT);

    let collaborators = Collaborators {
        sources,
        settings,
        functions: Arc::new(MemoryFunctionRepo::new()),
        downstream: Arc::new(NullDownstream),
        publisher: Arc::new(LogPublisher),
    };
    let engine = Arc::new(
        Engine::new(EngineConfig::default().js_workers(2), collaborators).unwrap(),
    );

    let router = routes::router(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn call_url(base: &str, method: &str) -> String {
    format!("{base}/call/{APP}/{VERSION}/{method}")
}

async fn post_call(
    base: &str,
    method: &str,
    args: serde_json::Value,
) -> (u16, serde_json::Value) {
    let response = client()
        .post(call_url(base, method))
        .header("x-gamespace", GAMESPACE)
        .header("x-account", "100")
        .header("x-access-scopes", "exec_func_call")
        .json(&args)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let body = response.json().await.unwrap();
    (status, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn call_returns_the_value() {
    let base = serve().await;

    let (status, body) = post_call(&base, "simple_call", json!({"arg1": "argument_a"})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!("simple_call_test_argument_a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn scalar_results_are_stringified() {
    let base = serve().await;

    let (status, body) = post_call(&base, "simple_call_sum", json!({"arg1": 5, "arg2": 7})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!("12"));
}

#[tokio::test(flavor = "multi_thread")]
async fn user_errors_map_to_the_envelope() {
    let base = serve().await;

    let (status, body) =
        post_call(&base, "error_call", json!({"code": 408, "message": "Welp"})).await;
    assert_eq!(status, 408);
    assert_eq!(body["code"], json!(408));
    assert_eq!(body["message"], json!("Welp"));

    let (status, body) =
        post_call(&base, "error_call", json!({"code": 500, "message": "Whoops"})).await;
    assert_eq!(status, 500);
    assert_eq!(body["message"], json!("Whoops"));
}

#[tokio::test(flavor = "multi_thread")]
async fn disallowed_and_missing_are_404() {
    let base = serve().await;

    let (status, _) = post_call(&base, "simple_call_disallowed", json!({})).await;
    assert_eq!(status, 404);

    let (status, _) = post_call(&base, "simple_call_missing", json!({})).await;
    assert_eq!(status, 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_identity_is_401_and_missing_scope_403() {
    let base = serve().await;

    let response = client()
        .post(call_url(&base, "simple_call"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = client()
        .post(call_url(&base, "simple_call"))
        .header("x-gamespace", GAMESPACE)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_reports_engine_state() {
    let base = serve().await;

    let response = client()
        .get(format!("{base}/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["workers"], json!(2));
}
