//! The execution engine: worker pool, build cache and the public call
//! surface consumed by the gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value as Json;
use tracing::debug;

use crate::api::{ApiDeps, WebClient};
use crate::bridge::LogSink;
use crate::build::{Build, BuildKey};
use crate::cache::BuildCache;
use crate::collaborators::{Collaborators, SourceFile};
use crate::config::EngineConfig;
use crate::env::Env;
use crate::error::{ExecError, ExecResult};
use crate::functions::{FunctionSession, FunctionSources};
use crate::session::Session;
use crate::worker::{WorkerHandle, spawn_worker};

/// Per-gamespace singleton project name for privileged server code.
pub const SERVER_PROJECT: &str = "server";

/// Per-worker job queue depth (backpressure threshold).
const JOB_QUEUE_CAPACITY: usize = 1024;

/// Counters exposed by the health surface.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub calls: AtomicU64,
    pub calls_failed: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub builds_created: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            builds_created: self.builds_created.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub calls: u64,
    pub calls_failed: u64,
    pub sessions_opened: u64,
    pub builds_created: u64,
}

/// The script execution engine.
///
/// Owns the worker threads and the build cache; every endpoint of the
/// request router maps onto one method here.
pub struct Engine {
    config: EngineConfig,
    collaborators: Collaborators,
    deps: Arc<ApiDeps>,
    workers: Vec<WorkerHandle>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    next_worker: AtomicUsize,
    cache: Arc<BuildCache>,
    functions: FunctionSources,
    stats: Arc<EngineStats>,
}

impl Engine {
    /// Start the worker pool. Must be called from within a tokio runtime;
    /// host coroutines are spawned onto the current handle.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> ExecResult<Self> {
        let host = tokio::runtime::Handle::current();

        let mut workers = Vec::with_capacity(config.js_workers);
        let mut threads = Vec::with_capacity(config.js_workers);
        for index in 0..config.js_workers {
            let (handle, thread) = spawn_worker(
                format!("kiln-worker-{index}"),
                JOB_QUEUE_CAPACITY,
                config.js_micro_timeout,
                host.clone(),
            )?;
            workers.push(handle);
            threads.push(thread);
        }

        let deps = Arc::new(ApiDeps {
            downstream: collaborators.downstream.clone(),
            publisher: collaborators.publisher.clone(),
            web: Arc::new(WebClient::new()),
        });
        let cache = BuildCache::new(config.build_idle_release, host);
        let functions = FunctionSources::new(collaborators.functions.clone(), &config);

        Ok(Self {
            config,
            collaborators,
            deps,
            workers,
            threads: Mutex::new(threads),
            next_worker: AtomicUsize::new(0),
            cache,
            functions,
            stats: Arc::new(EngineStats::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn build_cache(&self) -> &Arc<BuildCache> {
        &self.cache
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    fn worker(&self) -> WorkerHandle {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    /// Resolve and pin a cached build; the returned key must be released.
    async fn acquire_build(
        &self,
        key: BuildKey,
        server_mode: bool,
        init_env: Env,
    ) -> ExecResult<Arc<Build>> {
        let worker = self.worker();
        let deps = self.deps.clone();
        let sources = self.collaborators.sources.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();
        let create_key = key.clone();

        self.cache
            .acquire(key, async move {
                let files = sources
                    .get_snapshot(
                        &create_key.gamespace,
                        &create_key.project,
                        &create_key.commit,
                    )
                    .await?;
                let build = Build::create(
                    Some(create_key),
                    worker,
                    deps,
                    files,
                    server_mode,
                    init_env,
                    &config,
                )
                .await?;
                stats.builds_created.fetch_add(1, Ordering::Relaxed);
                Ok(build)
            })
            .await
    }

    async fn acquire_app_build(
        &self,
        gamespace: &str,
        application_name: &str,
        application_version: &str,
    ) -> ExecResult<(BuildKey, Arc<Build>)> {
        let source = self
            .collaborators
            .settings
            .get(gamespace, application_name, application_version)
            .await?;
        let key = BuildKey::new(gamespace, application_name, source.current_commit);
        let init_env = Env::new(gamespace, "")
            .application(application_name, application_version);
        let build = self.acquire_build(key.clone(), false, init_env).await?;
        Ok((key, build))
    }

    async fn acquire_server_build(
        &self,
        gamespace: &str,
    ) -> ExecResult<(BuildKey, Arc<Build>)> {
        let source = self.collaborators.settings.get_server(gamespace).await?;
        let key = BuildKey::new(gamespace, SERVER_PROJECT, source.current_commit);
        let init_env = Env::new(gamespace, "");
        let build = self.acquire_build(key.clone(), true, init_env).await?;
        Ok((key, build))
    }

    /// One-shot call against an application build.
    pub async fn call_app(
        &self,
        application_name: &str,
        application_version: &str,
        method: &str,
        args: Json,
        env: Env,
    ) -> ExecResult<Json> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let (key, build) = self
            .acquire_app_build(&env.gamespace_id, application_name, application_version)
            .await?;
        let result = build.call(method, args, env, None, None).await;
        self.cache.release(&key);
        if result.is_err() {
            self.stats.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// One-shot call against the gamespace's server-code build; the `admin`
    /// API object is available there.
    pub async fn call_server(
        &self,
        gamespace: &str,
        method: &str,
        args: Json,
        env: Env,
    ) -> ExecResult<Json> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let (key, build) = self.acquire_server_build(gamespace).await?;
        let result = build.call(method, args, env, None, None).await;
        self.cache.release(&key);
        if result.is_err() {
            self.stats.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Open a session on an application build; the session holds one build
    /// reference until released.
    pub async fn open_session(
        &self,
        application_name: &str,
        application_version: &str,
        class_name: &str,
        args: Json,
        env: Env,
        log: Option<LogSink>,
    ) -> ExecResult<Session> {
        let (key, build) = self
            .acquire_app_build(&env.gamespace_id, application_name, application_version)
            .await?;

        match Session::open(build, class_name, args, env, log, None, &self.config).await {
            Ok(session) => {
                let cache = self.cache.clone();
                let hook_key = key.clone();
                session.set_release_hook(Box::new(move || cache.release(&hook_key)));
                self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
                Ok(session)
            }
            Err(e) => {
                self.cache.release(&key);
                Err(e)
            }
        }
    }

    /// Assemble an ad-hoc build from uploaded files; not cached.
    pub async fn create_debug_build(
        &self,
        files: Vec<SourceFile>,
        env: Env,
    ) -> ExecResult<Arc<Build>> {
        Build::create(
            None,
            self.worker(),
            self.deps.clone(),
            files,
            false,
            env,
            &self.config,
        )
        .await
    }

    /// Open a session on an ad-hoc debug build; every `log(...)` is
    /// mirrored to the debug sink.
    pub async fn open_debug_session(
        &self,
        build: Arc<Build>,
        class_name: &str,
        args: Json,
        env: Env,
        log: Option<LogSink>,
        debug: Option<LogSink>,
    ) -> ExecResult<Session> {
        let session =
            Session::open(build, class_name, args, env, log, debug, &self.config).await?;
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// One-shot call of a standalone function stored in the function
    /// repository.
    pub async fn call_function(
        &self,
        application_name: Option<&str>,
        function_name: &str,
        method_name: Option<&str>,
        args: Json,
        env: Env,
    ) -> ExecResult<Json> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let files = self
            .functions
            .prepare(&env.gamespace_id, application_name, function_name, true)
            .await?;
        let build = Build::create(
            None,
            self.worker(),
            self.deps.clone(),
            (*files).clone(),
            false,
            env.clone(),
            &self.config,
        )
        .await?;

        let method = method_name.unwrap_or("main");
        let result = build
            .call_with_exposure(
                method,
                args,
                env,
                None,
                None,
                Some(function_name.to_string()),
                None,
            )
            .await;
        if result.is_err() {
            self.stats.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Persistent session over a synthesized function build.
    pub async fn open_function_session(
        &self,
        application_name: Option<&str>,
        function_name: &str,
        env: Env,
        log: Option<LogSink>,
        debug: Option<LogSink>,
    ) -> ExecResult<FunctionSession> {
        let files = self
            .functions
            .prepare(&env.gamespace_id, application_name, function_name, true)
            .await?;
        let build = Build::create(
            None,
            self.worker(),
            self.deps.clone(),
            (*files).clone(),
            false,
            env.clone(),
            &self.config,
        )
        .await?;

        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(FunctionSession::new(
            build,
            function_name.to_string(),
            env,
            log,
            debug,
            &self.config,
        ))
    }

    /// Stop accepting jobs and join every worker thread.
    pub async fn shutdown(self) {
        debug!("engine shutting down");
        for worker in &self.workers {
            worker.send_shutdown().await;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await
        .ok();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.workers.len())
            .field("builds", &self.cache.len())
            .finish()
    }
}

/// Collaborator access for callers composing their own flows.
impl Engine {
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }
}
