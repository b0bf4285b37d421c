//! kiln-engine — multi-tenant server-side script execution.
//!
//! Tenant projects compile into resident [`Build`]s held by a refcounted
//! cache; calls and [`Session`]s execute on a pool of worker threads, one
//! QuickJS isolate each. Host API calls suspend scripts through a deferred
//! promise bridge: the coroutine runs on the host scheduler and its
//! completion is delivered back to the owning worker, which restores the
//! call handler before resuming script code.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_engine::{
//!     Collaborators, Engine, EngineConfig, Env, LogPublisher, MemoryFunctionRepo,
//!     MemoryProjectSettings, MemorySourceStore, NullDownstream,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let collaborators = Collaborators {
//!         sources: Arc::new(MemorySourceStore::new()),
//!         settings: Arc::new(MemoryProjectSettings::new()),
//!         functions: Arc::new(MemoryFunctionRepo::new()),
//!         downstream: Arc::new(NullDownstream),
//!         publisher: Arc::new(LogPublisher),
//!     };
//!     let engine = Engine::new(EngineConfig::default(), collaborators).unwrap();
//!
//!     let env = Env::new("1", "100").application("brainout", "0.1");
//!     let result = engine
//!         .call_app("brainout", "0.1", "simple_call", serde_json::json!({}), env)
//!         .await;
//!     println!("{result:?}");
//!     engine.shutdown().await;
//! }
//! ```

mod api;
mod bridge;
mod build;
mod cache;
mod collaborators;
mod config;
mod engine;
mod env;
mod error;
mod functions;
mod session;
mod value;
mod worker;

/// Script helpers evaluated into every context before user code.
pub(crate) const STDLIB_JS: &str = include_str!("stdlib.js");

pub use api::WebClient;
pub use bridge::{Handler, HandlerCache, LogSink};
pub use build::{Build, BuildKey};
pub use cache::BuildCache;
pub use collaborators::{
    CollaboratorError, Collaborators, DirSourceStore, Downstream, DownstreamError, FunctionRepo,
    HttpDownstream, LogPublisher, MemoryFunctionRepo, MemoryProjectSettings, MemorySourceStore,
    MessagePublisher, NullDownstream, ProjectSettings, ProjectSource, SourceFile, SourceStore,
};
pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, EngineStatsSnapshot, SERVER_PROJECT};
pub use env::Env;
pub use error::{ExecError, ExecResult};
pub use functions::FunctionSession;
pub use session::{
    CALL_BLACKLIST, SESSION_BLACKLIST, Session, is_blacklisted_call,
    is_blacklisted_session_call,
};
pub use value::{FUNCTION_PLACEHOLDER, js_to_json, json_to_js};
