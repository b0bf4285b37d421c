//! Integration tests for one-shot calls against application builds.

mod common;

use common::{APP, COMMIT, GAMESPACE, VERSION, default_fixture, env, quick_release_fixture};
use kiln_engine::{BuildKey, ExecError};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread")]
async fn simple_call() {
    let fx = default_fixture();

    let result = fx
        .engine
        .call_app(APP, VERSION, "simple_call", json!({"arg1": "argument_a"}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("simple_call_test_argument_a"));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn simple_sum() {
    let fx = default_fixture();

    let result = fx
        .engine
        .call_app(APP, VERSION, "simple_call_sum", json!({"arg1": 5, "arg2": 7}), env())
        .await
        .unwrap();
    assert_eq!(result, json!(12));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn error_call_passes_code_through() {
    let fx = default_fixture();

    let err = fx
        .engine
        .call_app(
            APP,
            VERSION,
            "error_call",
            json!({"code": 408, "message": "Welp"}),
            env(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 408);
    assert_eq!(err.message(), "Welp");

    let err = fx
        .engine
        .call_app(
            APP,
            VERSION,
            "error_call",
            json!({"code": 500, "message": "Whoops"}),
            env(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 500);
    assert_eq!(err.message(), "Whoops");

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disallowed_missing_and_private_are_404() {
    let fx = default_fixture();

    for method in ["simple_call_disallowed", "simple_call_missing", "_private"] {
        let err = fx
            .engine
            .call_app(APP, VERSION, method, json!({}), env())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404, "{method} should be 404");
    }

    // The fixed top-level blacklist.
    for method in ["release", "released", "init"] {
        let err = fx
            .engine
            .call_app(APP, VERSION, method, json!({}), env())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NoSuchMethod), "{method}");
    }

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn object_result_round_trips() {
    let fx = default_fixture();

    let result = fx
        .engine
        .call_app(APP, VERSION, "object_call", json!({}), env())
        .await
        .unwrap();
    let reparsed: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();
    assert_eq!(
        reparsed,
        json!({"list": [1, 2, 3], "name": "kiln", "nested": {"on": true}})
    );

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn async_function_resolves_through_the_bridge() {
    let fx = default_fixture();

    let result = fx
        .engine
        .call_app(APP, VERSION, "slow_async", json!({}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("done"));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn downstream_failure_rejects_with_code_and_prefix() {
    let fx = default_fixture();

    // NullDownstream fails every request with 503; the script catches the
    // rejection and reports what it saw. The upstream body arrives behind
    // the `Internal error: ` prefix.
    let result = fx
        .engine
        .call_app(APP, VERSION, "downstream_code", json!({}), env())
        .await
        .unwrap();
    assert_eq!(result["code"], json!(503));
    let reason = result["reason"].as_str().unwrap();
    assert!(
        reason.starts_with("Internal error: "),
        "unexpected reason: {reason}"
    );

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_script_times_out_and_worker_recovers() {
    let fx = default_fixture();

    let started = Instant::now();
    let err = fx
        .engine
        .call_app(APP, VERSION, "busy_loop", json!({}), env())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 408);
    assert!(
        started.elapsed() < fx.engine.config().js_call_timeout,
        "micro-timeout should fire well before the call timeout"
    );

    // The isolate accepts the next job.
    let result = fx
        .engine
        .call_app(APP, VERSION, "simple_call", json!({"arg1": "after"}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("simple_call_test_after"));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_application_is_a_build_error() {
    let fx = default_fixture();

    let err = fx
        .engine
        .call_app("nosuch", VERSION, "simple_call", json!({}), env())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_build_is_destroyed_and_rematerialized() {
    let fx = quick_release_fixture();
    let key = BuildKey::new(GAMESPACE, APP, COMMIT);

    fx.engine
        .call_app(APP, VERSION, "simple_call", json!({"arg1": "x"}), env())
        .await
        .unwrap();
    assert!(fx.engine.build_cache().contains(&key));
    assert_eq!(fx.engine.build_cache().ref_count(&key), Some(0));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !fx.engine.build_cache().contains(&key),
        "idle build should be destroyed"
    );

    // A new call re-materializes the build.
    let result = fx
        .engine
        .call_app(APP, VERSION, "simple_call", json!({"arg1": "again"}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("simple_call_test_again"));
    assert!(fx.engine.build_cache().contains(&key));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_calls_share_one_build() {
    let fx = default_fixture();
    let key = BuildKey::new(GAMESPACE, APP, COMMIT);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = &fx.engine;
        handles.push(async move {
            engine
                .call_app(
                    APP,
                    VERSION,
                    "simple_call",
                    json!({"arg1": format!("n{i}")}),
                    env(),
                )
                .await
        });
    }
    let results = futures::future::join_all(handles).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(format!("simple_call_test_n{i}")));
    }

    // One cache entry, no leaked references.
    assert_eq!(fx.engine.build_cache().len(), 1);
    assert_eq!(fx.engine.build_cache().ref_count(&key), Some(0));

    fx.engine.shutdown().await;
}
