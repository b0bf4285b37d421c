//! Integration tests for sessions: lifecycle, blacklists, parallelism.

mod common;

use std::sync::Arc;
use std::time::Instant;

use common::{APP, COMMIT, GAMESPACE, VERSION, default_fixture, env};
use kiln_engine::{BuildKey, LogSink};
use parking_lot::Mutex;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn session_echo_and_blacklists() {
    let fx = default_fixture();

    let session = fx
        .engine
        .open_session(APP, VERSION, "TestClass", json!({}), env(), None)
        .await
        .unwrap();

    let result = session.call("test_call", json!({})).await.unwrap();
    assert_eq!(result, json!("test"));

    let err = session.call("_test_disallowed", json!({})).await.unwrap_err();
    assert_eq!(err.code(), 404);

    let err = session.call("test_missing", json!({})).await.unwrap_err();
    assert_eq!(err.code(), 404);

    let err = session.call("release", json!({})).await.unwrap_err();
    assert_eq!(err.code(), 404);

    session.release(1000, "done").await.unwrap();
    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_and_disallowed_classes_are_rejected() {
    let fx = default_fixture();

    let err = fx
        .engine
        .open_session(APP, VERSION, "MissingClassName", json!({}), env(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    let err = fx
        .engine
        .open_session(APP, VERSION, "TestDisallowedClass", json!({}), env(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_hold_and_release_build_references() {
    let fx = default_fixture();
    let key = BuildKey::new(GAMESPACE, APP, COMMIT);

    let first = fx
        .engine
        .open_session(APP, VERSION, "TestClass", json!({}), env(), None)
        .await
        .unwrap();
    let second = fx
        .engine
        .open_session(APP, VERSION, "TestClass", json!({}), env(), None)
        .await
        .unwrap();
    assert_eq!(fx.engine.build_cache().ref_count(&key), Some(2));

    first.release(1000, "bye").await.unwrap();
    assert_eq!(fx.engine.build_cache().ref_count(&key), Some(1));

    // Releasing twice is a no-op.
    first.release(1000, "bye again").await.unwrap();
    assert_eq!(fx.engine.build_cache().ref_count(&key), Some(1));

    second.release(1000, "bye").await.unwrap();
    assert_eq!(fx.engine.build_cache().ref_count(&key), Some(0));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_sessions_do_not_share_instance_state() {
    let fx = default_fixture();

    let a = fx
        .engine
        .open_session(APP, VERSION, "Counter", json!({}), env(), None)
        .await
        .unwrap();
    let b = fx
        .engine
        .open_session(APP, VERSION, "Counter", json!({}), env(), None)
        .await
        .unwrap();

    assert_eq!(a.call("bump", json!({})).await.unwrap(), json!(1));
    assert_eq!(a.call("bump", json!({})).await.unwrap(), json!(2));
    assert_eq!(b.call("bump", json!({})).await.unwrap(), json!(1));

    a.release(1000, "").await.unwrap();
    b.release(1000, "").await.unwrap();
    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_sessions_sleep_concurrently() {
    let fx = default_fixture();

    let a = fx
        .engine
        .open_session(APP, VERSION, "SlowSum", json!({}), env(), None)
        .await
        .unwrap();
    let b = fx
        .engine
        .open_session(APP, VERSION, "SlowSum", json!({}), env(), None)
        .await
        .unwrap();

    let started = Instant::now();
    let (ra, rb) = tokio::join!(
        a.call("sum", json!({"a": 1, "b": 2})),
        b.call("sum", json!({"a": 100, "b": 200})),
    );
    let elapsed = started.elapsed();

    assert_eq!(ra.unwrap(), json!(3));
    assert_eq!(rb.unwrap(), json!(300));
    assert!(
        elapsed.as_secs_f64() < 1.0,
        "two 0.5 s sleeps must overlap, took {elapsed:?}"
    );

    a.release(1000, "").await.unwrap();
    b.release(1000, "").await.unwrap();
    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn release_invokes_released_with_code_and_reason() {
    let fx = default_fixture();

    let session = fx
        .engine
        .open_session(APP, VERSION, "ReleaseProbe", json!({}), env(), None)
        .await
        .unwrap();
    assert_eq!(session.call("noop", json!({})).await.unwrap(), json!("ok"));
    session.release(4000, "client gone").await.unwrap();

    // The released() hook ran inside the shared context.
    let code = fx
        .engine
        .call_app(APP, VERSION, "get_released_code", json!({}), env())
        .await
        .unwrap();
    assert_eq!(code, json!(4000));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn session_log_reaches_the_sink() {
    let fx = default_fixture();

    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink: LogSink = {
        let lines = lines.clone();
        Arc::new(move |message: &str| lines.lock().push(message.to_string()))
    };

    let build = fx
        .engine
        .create_debug_build(
            vec![kiln_engine::SourceFile::new(
                "logger.js",
                r#"
                function Logger() {
                }
                Logger.prototype.say = async function(args) {
                    log("hello from script");
                    return "said";
                };
                Logger.allow_session = true;
                "#,
            )],
            env(),
        )
        .await
        .unwrap();

    let session = fx
        .engine
        .open_debug_session(build, "Logger", json!({}), env(), Some(sink), None)
        .await
        .unwrap();
    assert_eq!(session.call("say", json!({})).await.unwrap(), json!("said"));
    assert_eq!(lines.lock().as_slice(), ["hello from script"]);

    session.release(1000, "").await.unwrap();
    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn debug_build_supports_eval() {
    let fx = default_fixture();

    let build = fx
        .engine
        .create_debug_build(
            vec![kiln_engine::SourceFile::new("empty.js", "var x = 40;")],
            env(),
        )
        .await
        .unwrap();

    let result = build.eval("x + 2", env(), None).await.unwrap();
    assert_eq!(result, json!(42));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_is_only_visible_to_server_builds() {
    let fx = default_fixture();

    // App build: no admin object.
    let result = fx
        .engine
        .call_app(APP, VERSION, "admin_visible", json!({}), env())
        .await
        .unwrap();
    assert_eq!(result, json!(false));

    // Server build for the same gamespace.
    fx.sources.put(
        GAMESPACE,
        kiln_engine::SERVER_PROJECT,
        "s1",
        vec![kiln_engine::SourceFile::new(
            "server.js",
            r#"
            function test_sum(args) {
                return args["arg1"] + args["arg2"];
            }
            test_sum.allow_call = true;

            function admin_visible(args) {
                return typeof admin !== "undefined";
            }
            admin_visible.allow_call = true;

            function test_disallowed(args) {
                return "wow!";
            }
            "#,
        )],
    );
    fx.settings.bind_server(GAMESPACE, "s1");

    let sum = fx
        .engine
        .call_server(GAMESPACE, "test_sum", json!({"arg1": 5, "arg2": 7}), env())
        .await
        .unwrap();
    assert_eq!(sum, json!(12));

    let visible = fx
        .engine
        .call_server(GAMESPACE, "admin_visible", json!({}), env())
        .await
        .unwrap();
    assert_eq!(visible, json!(true));

    let err = fx
        .engine
        .call_server(GAMESPACE, "test_disallowed", json!({}), env())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    fx.engine.shutdown().await;
}
