//! Integration tests for the standalone-function path.

mod common;

use common::{GAMESPACE, default_fixture, env};
use serde_json::json;

const HELPER_FN: &str = r#"
function format_greeting(name) {
    return "hello, " + name;
}
"#;

const GREET_FN: &str = r#"
async function main(args) {
    return format_greeting(args["name"]);
}

function shout(args) {
    return format_greeting(args["name"]).toUpperCase();
}

shout.allow_call = true;

function hidden(args) {
    return "secret";
}
"#;

fn seed_functions(fx: &common::Fixture) {
    fx.functions
        .put(GAMESPACE, "format_greeting", HELPER_FN, vec![]);
    fx.functions.put(
        GAMESPACE,
        "greet",
        GREET_FN,
        vec!["format_greeting".to_string()],
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn function_call_defaults_to_main() {
    let fx = default_fixture();
    seed_functions(&fx);

    // `main` carries no allow_call marker; the legacy entry rule exposes it.
    let result = fx
        .engine
        .call_function(None, "greet", None, json!({"name": "kiln"}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("hello, kiln"));

    // Marked functions stay callable by name.
    let result = fx
        .engine
        .call_function(None, "greet", Some("shout"), json!({"name": "kiln"}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("HELLO, KILN"));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_name_match_exposes_the_entry_function() {
    let fx = default_fixture();
    fx.functions.put(
        GAMESPACE,
        "doubler",
        r#"
        function doubler(args) {
            return args["n"] * 2;
        }
        "#,
        vec![],
    );

    // No allow_call marker, but the method name matches the requested
    // function.
    let result = fx
        .engine
        .call_function(None, "doubler", Some("doubler"), json!({"n": 21}), env())
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unexposed_functions_stay_hidden() {
    let fx = default_fixture();
    seed_functions(&fx);

    let err = fx
        .engine
        .call_function(None, "greet", Some("hidden"), json!({}), env())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_function_is_404() {
    let fx = default_fixture();

    let err = fx
        .engine
        .call_function(None, "nope", None, json!({}), env())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn function_sessions_keep_state_per_build() {
    let fx = default_fixture();
    fx.functions.put(
        GAMESPACE,
        "tally",
        r#"
        var total = 0;

        function tally(args) {
            total += args["n"];
            return total;
        }

        function released(args) {
            total = 0;
        }
        "#,
        vec![],
    );

    let session = fx
        .engine
        .open_function_session(None, "tally", env(), None, None)
        .await
        .unwrap();

    assert_eq!(session.call("tally", json!({"n": 3})).await.unwrap(), json!(3));
    assert_eq!(session.call("tally", json!({"n": 4})).await.unwrap(), json!(7));

    session.release(1000, "").await.unwrap();
    fx.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn main_is_callable_by_default_method() {
    let fx = default_fixture();
    fx.functions.put(
        GAMESPACE,
        "main",
        r#"
        function main(args) {
            return "entry";
        }
        "#,
        vec![],
    );

    // Default method is `main`; exposure passes via the name match when the
    // function row itself is called `main`.
    let result = fx
        .engine
        .call_function(None, "main", None, json!({}), env())
        .await
        .unwrap();
    assert_eq!(result, json!("entry"));

    fx.engine.shutdown().await;
}
