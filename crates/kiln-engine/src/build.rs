//! A build: a compiled, resident script environment for one
//! `(gamespace, project, commit)`.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::api::ApiDeps;
use crate::bridge::{Bridge, Handler, HandlerCache, LogSink};
use crate::collaborators::SourceFile;
use crate::config::EngineConfig;
use crate::env::Env;
use crate::error::{ExecError, ExecResult};
use crate::session::is_blacklisted_call;
use crate::worker::{CallReply, ContextId, Exposure, Job, WorkerHandle};

/// The build cache fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub gamespace: String,
    pub project: String,
    pub commit: String,
}

impl BuildKey {
    pub fn new(
        gamespace: impl Into<String>,
        project: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            gamespace: gamespace.into(),
            project: project.into(),
            commit: commit.into(),
        }
    }

    /// Stable numeric fingerprint of the key.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Compact build identity derived from the fingerprint.
    pub fn build_id(&self) -> String {
        format!("{:016x}", self.fingerprint())
    }
}

impl std::fmt::Display for BuildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.gamespace, self.project, self.commit)
    }
}

/// A live script environment pinned to one worker.
///
/// Cached builds are owned by the build cache, which tracks their refcount
/// and idle window; ad-hoc builds (debug sessions, standalone functions)
/// live as long as their `Arc`.
pub struct Build {
    label: String,
    key: Option<BuildKey>,
    worker: WorkerHandle,
    context: ContextId,
    bridge: Arc<Bridge>,
    server_mode: bool,
    call_timeout: Duration,
}

impl Build {
    /// Assemble a build on the given worker: fresh context, host globals,
    /// stdlib, then every user file in listing order.
    pub(crate) async fn create(
        key: Option<BuildKey>,
        worker: WorkerHandle,
        deps: Arc<ApiDeps>,
        files: Vec<SourceFile>,
        server_mode: bool,
        init_env: Env,
        config: &EngineConfig,
    ) -> ExecResult<Arc<Self>> {
        let label = key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| format!("adhoc/{}", init_env.gamespace_id));

        let context = worker
            .request(|reply| Job::CreateContext { reply })
            .await?;

        let bridge = Arc::new(Bridge::new());
        let handler = Arc::new(Handler::new(init_env, None));

        let init = worker
            .request(|reply| Job::InitContext {
                context,
                bridge: bridge.clone(),
                handler,
                deps,
                server_mode,
                files,
                reply,
            })
            .await;

        if let Err(e) = init {
            let _ = worker.submit(Job::DropContext { context });
            return Err(e);
        }

        if key.is_some() {
            info!(build = %label, worker = worker.name(), "created new build");
        }

        Ok(Arc::new(Self {
            label,
            key,
            worker,
            context,
            bridge,
            server_mode,
            call_timeout: config.js_call_timeout,
        }))
    }

    pub fn key(&self) -> Option<&BuildKey> {
        self.key.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn server_mode(&self) -> bool {
        self.server_mode
    }

    pub(crate) fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub(crate) fn context(&self) -> ContextId {
        self.context
    }

    pub(crate) fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// One-shot call of a whitelisted top-level function.
    pub async fn call(
        &self,
        method: &str,
        args: Json,
        env: Env,
        log: Option<LogSink>,
        debug: Option<LogSink>,
    ) -> ExecResult<Json> {
        self.call_with_exposure(method, args, env, log, debug, None, None)
            .await
    }

    /// One-shot call with the standalone-function exposure rule and an
    /// optional shared cache.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn call_with_exposure(
        &self,
        method: &str,
        args: Json,
        env: Env,
        log: Option<LogSink>,
        debug: Option<LogSink>,
        legacy_name: Option<String>,
        cache: Option<HandlerCache>,
    ) -> ExecResult<Json> {
        if is_blacklisted_call(method) {
            return Err(ExecError::NoSuchMethod);
        }

        let handler = Arc::new(
            Handler::new(env, cache)
                .with_log(log)
                .with_debug(debug),
        );

        let reply = self
            .worker
            .request(|reply| Job::CallFunction {
                context: self.context,
                bridge: self.bridge.clone(),
                handler,
                method: method.to_string(),
                args,
                exposure: Exposure::Public { legacy_name },
                reply,
            })
            .await
            .map_err(ExecError::into_public)?;

        self.settle(method, reply).await
    }

    /// Engine-internal call: no exposure marker required, missing target is
    /// not an error.
    pub(crate) async fn call_internal(
        &self,
        method: &str,
        args: Json,
        env: Env,
        cache: Option<HandlerCache>,
    ) -> ExecResult<Json> {
        let handler = Arc::new(Handler::new(env, cache));

        let reply = self
            .worker
            .request(|reply| Job::CallFunction {
                context: self.context,
                bridge: self.bridge.clone(),
                handler,
                method: method.to_string(),
                args,
                exposure: Exposure::Internal,
                reply,
            })
            .await
            .map_err(ExecError::into_public)?;

        self.settle(method, reply).await
    }

    /// Evaluate debug text with the caller's handler environment.
    pub async fn eval(
        &self,
        source: &str,
        env: Env,
        cache: Option<HandlerCache>,
    ) -> ExecResult<Json> {
        let handler = Arc::new(Handler::new(env, cache));
        self.worker
            .request(|reply| Job::Eval {
                context: self.context,
                bridge: self.bridge.clone(),
                handler,
                source: source.to_string(),
                reply,
            })
            .await
            .map_err(ExecError::into_public)
    }

    /// Await the settlement of a call reply, enforcing the host-side total
    /// timeout on the asynchronous stage only.
    pub(crate) async fn settle(&self, method: &str, reply: CallReply) -> ExecResult<Json> {
        match reply {
            CallReply::Immediate(value) => Ok(value),
            CallReply::Pending(settled) => {
                match timeout(self.call_timeout, settled).await {
                    Err(_elapsed) => {
                        // The script may be wedged mid-stretch; abort it.
                        self.worker.terminate();
                        Err(ExecError::api(
                            408,
                            format!(
                                "Total function '{}' call timeout ({})",
                                method,
                                self.call_timeout.as_secs()
                            ),
                        ))
                    }
                    Ok(Err(_recv)) => {
                        Err(ExecError::engine("worker dropped the settlement"))
                    }
                    Ok(Ok(result)) => result.map_err(ExecError::into_public),
                }
            }
        }
    }
}

impl Drop for Build {
    fn drop(&mut self) {
        if self
            .worker
            .submit(Job::DropContext {
                context: self.context,
            })
            .is_err()
        {
            warn!(build = %self.label, "worker gone before context release");
        }
    }
}
