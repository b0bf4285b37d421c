//! Sessions: live script instances receiving method calls until released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rquickjs::{Object, Persistent};
use serde_json::{Value as Json, json};
use tokio::time::timeout;
use tracing::info;

use crate::bridge::{Handler, HandlerCache, LogSink};
use crate::build::Build;
use crate::config::EngineConfig;
use crate::env::Env;
use crate::error::{ExecError, ExecResult};
use crate::worker::Job;

/// Names never callable as top-level functions.
pub const CALL_BLACKLIST: [&str; 3] = ["release", "released", "init"];

/// Names never callable as session methods.
pub const SESSION_BLACKLIST: [&str; 1] = ["release"];

/// Whether a top-level call target is off limits.
pub fn is_blacklisted_call(method: &str) -> bool {
    method.is_empty() || method.starts_with('_') || CALL_BLACKLIST.contains(&method)
}

/// Whether a session method is off limits.
pub fn is_blacklisted_session_call(method: &str) -> bool {
    method.is_empty() || method.starts_with('_') || SESSION_BLACKLIST.contains(&method)
}

/// Runs once when the session drops its build reference.
pub(crate) type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A live instance of a session-enabled class.
///
/// Holds exactly one reference on its build while alive. Method calls are
/// dispatched one at a time by the caller; release is idempotent.
pub struct Session {
    id: String,
    build: Arc<Build>,
    instance: Persistent<Object<'static>>,
    env: Env,
    cache: HandlerCache,
    log: Option<LogSink>,
    debug: Option<LogSink>,
    released: AtomicBool,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl Session {
    /// Construct `new Class(args, env)` inside the build and wrap the
    /// instance.
    pub(crate) async fn open(
        build: Arc<Build>,
        class_name: &str,
        args: Json,
        env: Env,
        log: Option<LogSink>,
        debug: Option<LogSink>,
        config: &EngineConfig,
    ) -> ExecResult<Self> {
        let cache = HandlerCache::new(
            config.handler_cache_capacity,
            config.handler_cache_ttl,
        );
        let handler = Arc::new(
            Handler::new(env.clone(), Some(cache.clone()))
                .with_log(log.clone())
                .with_debug(debug.clone()),
        );
        let env_json = serde_json::to_value(&env)
            .map_err(|e| ExecError::engine(format!("serializing env: {e}")))?;

        let instance = build
            .worker()
            .request(|reply| Job::Construct {
                context: build.context(),
                bridge: build.bridge().clone(),
                handler,
                class_name: class_name.to_string(),
                args,
                env: env_json,
                reply,
            })
            .await?;

        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            build,
            instance,
            env,
            cache,
            log,
            debug,
            released: AtomicBool::new(false),
            on_release: Mutex::new(None),
        };
        info!(session = %session.id, build = %session.build.label(), "session opened");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) {
        *self.on_release.lock() = Some(hook);
    }

    fn handler(&self) -> Arc<Handler> {
        Arc::new(
            Handler::new(self.env.clone(), Some(self.cache.clone()))
                .with_log(self.log.clone())
                .with_debug(self.debug.clone()),
        )
    }

    /// Invoke a session method: `instance[method](args, args)`.
    pub async fn call(&self, method: &str, args: Json) -> ExecResult<Json> {
        if is_blacklisted_session_call(method) {
            return Err(ExecError::session(404, format!("No such method: {method}")));
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(ExecError::session(404, "Session is released"));
        }

        let reply = self
            .build
            .worker()
            .request(|reply| Job::CallMethod {
                context: self.build.context(),
                bridge: self.build.bridge().clone(),
                handler: self.handler(),
                instance: self.instance.clone(),
                method: method.to_string(),
                args,
                args_twice: true,
                optional: false,
                reply,
            })
            .await
            .map_err(|e| match e {
                ExecError::NoSuchMethod => {
                    ExecError::session(404, format!("No such method: {method}"))
                }
                other => other.into_public(),
            })?;

        self.build.settle(method, reply).await
    }

    /// Evaluate debug text against the session's build.
    pub async fn eval(&self, source: &str) -> ExecResult<Json> {
        self.build
            .eval(source, self.env.clone(), Some(self.cache.clone()))
            .await
    }

    /// Release the session: tell the instance it is going away (a missing
    /// `released` method is fine), then drop the build reference. Releasing
    /// an already-released session is a no-op.
    pub async fn release(&self, code: u16, reason: &str) -> ExecResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let args = json!({"code": code, "reason": reason});
        let released = self
            .build
            .worker()
            .request(|reply| Job::CallMethod {
                context: self.build.context(),
                bridge: self.build.bridge().clone(),
                handler: self.handler(),
                instance: self.instance.clone(),
                method: "released".to_string(),
                args,
                args_twice: false,
                optional: true,
                reply,
            })
            .await;

        match released {
            Ok(reply) => {
                // Bounded wait; a hung `released` must not leak the build ref.
                if let crate::worker::CallReply::Pending(settled) = reply {
                    let _ = timeout(self.build.call_timeout(), settled).await;
                }
            }
            Err(e) => info!(session = %self.id, error = %e, "error while releasing"),
        }

        if let Some(hook) = self.on_release.lock().take() {
            hook();
        }
        info!(session = %self.id, "session released");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A dropped-but-never-released session must still give back its
        // build reference.
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.on_release.lock().take() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_blacklists() {
        assert!(is_blacklisted_call("_private"));
        assert!(is_blacklisted_call("release"));
        assert!(is_blacklisted_call("released"));
        assert!(is_blacklisted_call("init"));
        assert!(is_blacklisted_call(""));
        assert!(!is_blacklisted_call("simple_call"));
    }

    #[test]
    fn session_blacklists() {
        assert!(is_blacklisted_session_call("_test_disallowed"));
        assert!(is_blacklisted_session_call("release"));
        assert!(!is_blacklisted_session_call("released"));
        assert!(!is_blacklisted_session_call("test_call"));
    }
}
