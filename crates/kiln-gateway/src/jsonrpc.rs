//! Minimal JSON-RPC 2.0 framing for session sockets.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// An incoming request (or notification, when `id` is absent).
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Json,
    #[serde(default)]
    pub id: Option<Json>,
}

impl Request {
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Corrupted JSON-RPC message: {e}"))
    }

    /// A string field out of `params`.
    pub fn param_str(&self, name: &str) -> Option<String> {
        self.params
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// An arbitrary field out of `params`, defaulting to null.
    pub fn param(&self, name: &str) -> Json {
        self.params.get(name).cloned().unwrap_or(Json::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// An outgoing response.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Json>,
}

impl Response {
    pub fn result(id: Option<Json>, result: Json) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Json>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","error":{"code":500,"message":"encoding failed"},"id":null}"#
                .to_string()
        })
    }
}

/// A server → client notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Json,
}

impl Notification {
    pub fn log(message: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "log",
            params: serde_json::json!({"message": message}),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_call_requests() {
        let request = Request::parse(
            r#"{"jsonrpc": "2.0", "method": "call", "params": {"method_name": "test_call", "arguments": {"a": 1}}, "id": 7}"#,
        )
        .unwrap();
        assert_eq!(request.method, "call");
        assert_eq!(request.param_str("method_name").as_deref(), Some("test_call"));
        assert_eq!(request.param("arguments"), json!({"a": 1}));
        assert_eq!(request.id, Some(json!(7)));
    }

    #[test]
    fn corrupted_messages_are_reported() {
        assert!(Request::parse("{nope").is_err());
    }

    #[test]
    fn responses_serialize_one_of_result_or_error() {
        let ok = Response::result(Some(json!(1)), json!("fine")).to_text();
        assert!(ok.contains("\"result\""));
        assert!(!ok.contains("\"error\""));

        let err = Response::error(Some(json!(1)), 404, "No such method").to_text();
        assert!(err.contains("\"error\""));
        assert!(!err.contains("\"result\""));
    }

    #[test]
    fn log_notification_shape() {
        let text = Notification::log("hello").to_text();
        let parsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["method"], json!("log"));
        assert_eq!(parsed["params"]["message"], json!("hello"));
        assert!(parsed.get("id").is_none());
    }
}
