//! Engine configuration.

use std::time::Duration;

/// Tunables for the execution engine.
///
/// Defaults follow the production service: one worker per CPU, a 10 s
/// per-call cap, a 500 ms cap on any synchronous JS stretch, and a 30 s
/// idle window before a build is destroyed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker threads / isolates.
    pub js_workers: usize,

    /// Host-side cap on one call, from job start to promise settlement.
    pub js_call_timeout: Duration,

    /// Cap on a single synchronous JS stretch before the isolate is
    /// interrupted.
    pub js_micro_timeout: Duration,

    /// Parallelism for source pre-compilation fetches.
    pub js_compile_workers: usize,

    /// Idle window after the refcount reaches zero before a build is
    /// destroyed.
    pub build_idle_release: Duration,

    /// Per-handler cache capacity.
    pub handler_cache_capacity: u64,

    /// Per-handler cache entry TTL.
    pub handler_cache_ttl: Duration,

    /// Standalone-function source cache capacity.
    pub function_code_cache_capacity: u64,

    /// Standalone-function source cache entry TTL.
    pub function_code_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            js_workers: cpus,
            js_call_timeout: Duration::from_secs(10),
            js_micro_timeout: Duration::from_millis(500),
            js_compile_workers: cpus,
            build_idle_release: Duration::from_secs(30),
            handler_cache_capacity: 10,
            handler_cache_ttl: Duration::from_secs(60),
            function_code_cache_capacity: 64,
            function_code_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn js_workers(mut self, workers: usize) -> Self {
        self.js_workers = workers.max(1);
        self
    }

    /// Set the host-side per-call timeout.
    pub fn js_call_timeout(mut self, timeout: Duration) -> Self {
        self.js_call_timeout = timeout;
        self
    }

    /// Set the synchronous-stretch micro-timeout.
    pub fn js_micro_timeout(mut self, timeout: Duration) -> Self {
        self.js_micro_timeout = timeout;
        self
    }

    /// Set the build idle-release window.
    pub fn build_idle_release(mut self, window: Duration) -> Self {
        self.build_idle_release = window;
        self
    }
}
