//! Standalone-function execution: builds synthesized from database-stored
//! `(name, code, imports)` rows instead of a repository commit.

use std::sync::Arc;

use serde_json::{Value as Json, json};
use tokio::time::timeout;
use tracing::info;

use crate::bridge::{HandlerCache, LogSink};
use crate::build::Build;
use crate::collaborators::{FunctionRepo, SourceFile};
use crate::config::EngineConfig;
use crate::env::Env;
use crate::error::{ExecError, ExecResult};
use crate::session::is_blacklisted_call;

/// Fetches and caches assembled function sources.
///
/// `saved_code` keeps the validated unit list per `(gamespace, function)`;
/// a miss re-fetches from the function repository.
pub(crate) struct FunctionSources {
    repo: Arc<dyn FunctionRepo>,
    saved_code: moka::sync::Cache<String, Arc<Vec<SourceFile>>>,
}

impl FunctionSources {
    pub fn new(repo: Arc<dyn FunctionRepo>, config: &EngineConfig) -> Self {
        Self {
            repo,
            saved_code: moka::sync::Cache::builder()
                .max_capacity(config.function_code_cache_capacity)
                .time_to_live(config.function_code_cache_ttl)
                .build(),
        }
    }

    pub async fn prepare(
        &self,
        gamespace: &str,
        application_name: Option<&str>,
        function_name: &str,
        use_cache: bool,
    ) -> ExecResult<Arc<Vec<SourceFile>>> {
        let key = format!("{gamespace}:{function_name}");
        if use_cache {
            if let Some(hit) = self.saved_code.get(&key) {
                return Ok(hit);
            }
        }

        info!(function = %function_name, "compiling function");
        let files = self
            .repo
            .get_with_deps(gamespace, function_name, application_name)
            .await
            .map_err(|e| ExecError::build(e.code, e.message))?;
        let files = Arc::new(files);
        self.saved_code.insert(key, files.clone());
        Ok(files)
    }
}

/// A session over a synthesized function build: repeated calls against the
/// build's top-level functions, with a shared expiring cache.
pub struct FunctionSession {
    build: Arc<Build>,
    function_name: String,
    env: Env,
    cache: HandlerCache,
    log: Option<LogSink>,
    debug: Option<LogSink>,
    released: std::sync::atomic::AtomicBool,
}

impl FunctionSession {
    pub(crate) fn new(
        build: Arc<Build>,
        function_name: String,
        env: Env,
        log: Option<LogSink>,
        debug: Option<LogSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            build,
            function_name,
            env,
            cache: HandlerCache::new(
                config.handler_cache_capacity,
                config.handler_cache_ttl,
            ),
            log,
            debug,
            released: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Call a top-level function; exposure follows the standalone rule
    /// (`allow_call === true` or the legacy entry-name match).
    pub async fn call(&self, method: &str, args: Json) -> ExecResult<Json> {
        if is_blacklisted_call(method) {
            return Err(ExecError::session(404, format!("No such method: {method}")));
        }
        self.build
            .call_with_exposure(
                method,
                args,
                self.env.clone(),
                self.log.clone(),
                self.debug.clone(),
                Some(self.function_name.clone()),
                Some(self.cache.clone()),
            )
            .await
            .map_err(|e| match e {
                ExecError::NoSuchMethod => {
                    ExecError::session(404, format!("No {method}() function found."))
                }
                other => other,
            })
    }

    /// Evaluate debug text against the synthesized build.
    pub async fn eval(&self, source: &str) -> ExecResult<Json> {
        self.build
            .eval(source, self.env.clone(), Some(self.cache.clone()))
            .await
    }

    /// Tell the build the session is going away; a missing `released`
    /// function is fine.
    pub async fn release(&self, code: u16, reason: &str) -> ExecResult<()> {
        if self
            .released
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }
        let args = json!({"code": code, "reason": reason});
        let released = self
            .build
            .call_internal(
                "released",
                args,
                self.env.clone(),
                Some(self.cache.clone()),
            );
        match timeout(self.build.call_timeout(), released).await {
            Ok(Err(e)) => info!(function = %self.function_name, error = %e, "error while releasing"),
            Err(_elapsed) => {
                info!(function = %self.function_name, "timeout while releasing")
            }
            Ok(Ok(_)) => {}
        }
        Ok(())
    }
}
