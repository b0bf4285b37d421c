//! The call handler and the host↔script promise bridge plumbing.
//!
//! A [`Handler`] carries the environment, the expiring key→value cache and
//! the log/debug sinks across one script invocation and all of its promise
//! continuations. The per-context [`Bridge`] holds the "current" handler
//! anchor: it is set before every script entry and restored by every
//! promise-completion delivery right before `resolve`/`reject` runs.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rquickjs::{CaughtError, Ctx, Function, Object, Value};
use serde_json::Value as Json;

use crate::env::Env;
use crate::error::ExecError;
use crate::value::engine_js_error;

/// Sink receiving `log(...)` output from scripts.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Expiring key→value cache attached to handlers and sessions.
#[derive(Clone)]
pub struct HandlerCache {
    inner: moka::sync::Cache<String, Json>,
}

impl HandlerCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Json> {
        self.inner.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Json) {
        self.inner.insert(key.into(), value);
    }
}

/// Per-invocation record read by every host API function.
pub struct Handler {
    pub env: Env,
    cache: Option<HandlerCache>,
    log: Option<LogSink>,
    debug: Option<LogSink>,
}

impl Handler {
    pub fn new(env: Env, cache: Option<HandlerCache>) -> Self {
        Self {
            env,
            cache,
            log: None,
            debug: None,
        }
    }

    /// Handler with no environment; only used when a script calls the host
    /// outside any tracked invocation.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new(Env::default(), None))
    }

    pub fn with_log(mut self, log: Option<LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn with_debug(mut self, debug: Option<LogSink>) -> Self {
        self.debug = debug;
        self
    }

    /// Whether stack traces should be attached to execution errors.
    pub fn debug_enabled(&self) -> bool {
        self.debug.is_some()
    }

    /// Append a script log line to the attached sinks and the server log.
    pub fn log(&self, message: &str) {
        tracing::info!(target: "kiln::script", "{message}");
        if let Some(log) = &self.log {
            log(message);
        }
        if let Some(debug) = &self.debug {
            debug(message);
        }
    }

    pub fn cache_get(&self, key: &str) -> Option<Json> {
        self.cache.as_ref().and_then(|c| c.get(key))
    }

    pub fn cache_set(&self, key: &str, value: Json) {
        if let Some(cache) = &self.cache {
            cache.set(key, value);
        }
    }
}

/// Per-context anchor for the current handler.
#[derive(Default)]
pub struct Bridge {
    current: Mutex<Option<Arc<Handler>>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current(&self, handler: Arc<Handler>) {
        *self.current.lock() = Some(handler);
    }

    pub fn current(&self) -> Arc<Handler> {
        self.current
            .lock()
            .clone()
            .unwrap_or_else(Handler::detached)
    }
}

// ---------------------------------------------------------------------------
// Script-side error classification
// ---------------------------------------------------------------------------

/// Map a caught script failure onto the engine taxonomy.
pub(crate) fn classify_caught(ctx: &Ctx<'_>, caught: CaughtError<'_>, debug: bool) -> ExecError {
    match caught {
        CaughtError::Error(err) => {
            let text = err.to_string();
            if text.contains("interrupted") {
                ExecError::Terminated
            } else {
                ExecError::execution(500, text)
            }
        }
        CaughtError::Exception(exception) => {
            let message: String = exception
                .get::<_, Option<String>>("message")
                .ok()
                .flatten()
                .unwrap_or_default();
            if message.contains("interrupted") {
                return ExecError::Terminated;
            }
            let stack = exception.get::<_, Option<String>>("stack").ok().flatten();
            classify_error_object(&exception, &message, stack, debug)
        }
        CaughtError::Value(value) => classify_thrown(ctx, &value, debug),
    }
}

/// Classify an arbitrary thrown/rejected script value.
pub(crate) fn classify_thrown(_ctx: &Ctx<'_>, value: &Value<'_>, debug: bool) -> ExecError {
    if let Some(object) = value.as_object() {
        let message: String = object
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .unwrap_or_default();
        if message.contains("interrupted") {
            return ExecError::Terminated;
        }
        let stack = object.get::<_, Option<String>>("stack").ok().flatten();
        return classify_error_object(object, &message, stack, debug);
    }

    let text = value
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "Internal Script Error".to_string());
    ExecError::execution(500, text)
}

fn classify_error_object(
    object: &Object<'_>,
    message: &str,
    stack: Option<String>,
    debug: bool,
) -> ExecError {
    let name: Option<String> = object.get::<_, Option<String>>("name").ok().flatten();

    // `throw new Error(code, message)` produces an APIUserError carrying a
    // JSON [code, message] tuple in its message.
    if name.as_deref() == Some("APIUserError") {
        if let Ok(Json::Array(parts)) = serde_json::from_str::<Json>(message) {
            if parts.len() == 2 {
                let code = parts[0].as_u64().unwrap_or(500) as u16;
                let text = parts[1].as_str().unwrap_or_default().to_string();
                return ExecError::api(code, text);
            }
        }
        return ExecError::api(500, message.to_string());
    }

    // Errors raised with explicit numeric `code` / `message` properties
    // keep their code.
    if let Ok(Some(code)) = object.get::<_, Option<f64>>("code") {
        if code.is_finite() && code > 0.0 {
            return ExecError::api(code as u16, message.to_string());
        }
    }

    ExecError::Execution {
        code: 500,
        message: message.to_string(),
        stack: if debug { stack } else { None },
    }
}

/// Build the script-side error value handed to `reject` for a failed host
/// call: an APIUserError constructed through the stdlib helper.
pub(crate) fn error_value<'js>(
    ctx: &Ctx<'js>,
    code: u16,
    message: &str,
) -> Result<Value<'js>, ExecError> {
    let helper: Function = ctx
        .globals()
        .get("__hosterror")
        .map_err(engine_js_error)?;
    helper
        .call((code as i32, message.to_string()))
        .map_err(engine_js_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn handler_cache_roundtrip() {
        let cache = HandlerCache::new(10, Duration::from_secs(60));
        cache.set("store:gold", serde_json::json!({"price": 5}));
        assert_eq!(
            cache.get("store:gold"),
            Some(serde_json::json!({"price": 5}))
        );
        assert_eq!(cache.get("store:iron"), None);
    }

    #[test]
    fn detached_handler_has_no_cache() {
        let handler = Handler::detached();
        handler.cache_set("k", serde_json::json!(1));
        assert_eq!(handler.cache_get("k"), None);
        assert!(!handler.debug_enabled());
    }

    #[test]
    fn bridge_current_falls_back_to_detached() {
        let bridge = Bridge::new();
        assert_eq!(bridge.current().env, Env::default());

        let handler = Arc::new(Handler::new(Env::new("100", "42"), None));
        bridge.set_current(handler);
        assert_eq!(bridge.current().env.gamespace_id, "100");
    }
}
