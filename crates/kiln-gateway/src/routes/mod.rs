//! Route wiring for the four logical endpoints plus health.

mod call;
mod session;

use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/call/{app}/{version}/{method}", post(call::call_app))
        .route("/server/{gamespace}/{method}", post(call::call_server))
        .route("/session/{app}/{version}/{class}", get(session::session_ws))
        .route("/debug/{app}/{version}/{class}", get(session::debug_ws))
        .route("/healthz", get(call::healthz))
        .with_state(state)
}

/// Non-object, non-array, non-string results are stringified on the wire;
/// null passes through.
pub(crate) fn present(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Null
        | serde_json::Value::String(_)
        | serde_json::Value::Array(_)
        | serde_json::Value::Object(_) => value,
        other => serde_json::Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::present;
    use serde_json::json;

    #[test]
    fn scalars_are_stringified() {
        assert_eq!(present(json!(12)), json!("12"));
        assert_eq!(present(json!(true)), json!("true"));
    }

    #[test]
    fn containers_and_strings_pass_through() {
        assert_eq!(present(json!("text")), json!("text"));
        assert_eq!(present(json!([1, 2])), json!([1, 2]));
        assert_eq!(present(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(present(json!(null)), json!(null));
    }
}
