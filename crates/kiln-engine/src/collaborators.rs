//! Interfaces the engine consumes from the outside world.
//!
//! Source acquisition, settings persistence, standalone-function storage,
//! downstream RPC, and message publishing all live behind these traits.
//! The engine never talks to git, databases, or other services directly.
//!
//! Simple implementations are provided at the bottom: a directory-backed
//! source store, an HTTP downstream client, and in-memory stores used by
//! tests and small deployments.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as Json;
use thiserror::Error;

use crate::error::ExecError;

/// One source file of a snapshot, in listing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Repository binding and current commit for a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectSource {
    pub repo_url: String,
    pub branch: String,
    pub ssh_key: Option<String>,
    pub current_commit: String,
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct CollaboratorError {
    pub code: u16,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }
}

impl From<CollaboratorError> for ExecError {
    fn from(e: CollaboratorError) -> Self {
        ExecError::build(e.code, e.message)
    }
}

/// Downstream RPC failure; carries the upstream body verbatim.
#[derive(Error, Debug, Clone)]
#[error("{code}: {body}")]
pub struct DownstreamError {
    pub code: u16,
    pub body: String,
}

impl DownstreamError {
    pub fn new(code: u16, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }
}

impl From<DownstreamError> for ExecError {
    fn from(e: DownstreamError) -> Self {
        ExecError::api(e.code, format!("Internal error: {}", e.body))
    }
}

/// Produces the checked-out file listing for `(gamespace, project, commit)`.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn get_snapshot(
        &self,
        gamespace: &str,
        project: &str,
        commit: &str,
    ) -> Result<Vec<SourceFile>, CollaboratorError>;
}

/// Project settings and version→commit bindings.
#[async_trait]
pub trait ProjectSettings: Send + Sync {
    async fn get(
        &self,
        gamespace: &str,
        application_name: &str,
        application_version: &str,
    ) -> Result<ProjectSource, CollaboratorError>;

    async fn get_server(&self, gamespace: &str) -> Result<ProjectSource, CollaboratorError>;
}

/// Standalone function records stored as `(name, code, imports)` rows.
#[async_trait]
pub trait FunctionRepo: Send + Sync {
    /// The function plus its transitive imports, entry function last.
    async fn get_with_deps(
        &self,
        gamespace: &str,
        function_name: &str,
        application_name: Option<&str>,
    ) -> Result<Vec<SourceFile>, CollaboratorError>;
}

/// Generic internal RPC to upstream services (profile, store, social, ...).
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn request(
        &self,
        service: &str,
        method: &str,
        args: Json,
        timeout: Duration,
    ) -> Result<Json, DownstreamError>;
}

/// Fire-and-forget message publishing.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Json) -> Result<(), DownstreamError>;
}

/// Everything the engine needs from the outside, bundled.
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Arc<dyn SourceStore>,
    pub settings: Arc<dyn ProjectSettings>,
    pub functions: Arc<dyn FunctionRepo>,
    pub downstream: Arc<dyn Downstream>,
    pub publisher: Arc<dyn MessagePublisher>,
}

// ---------------------------------------------------------------------------
// Provided implementations
// ---------------------------------------------------------------------------

/// Reads snapshots from `<root>/<gamespace>/<project>/<commit>/*.js`,
/// in directory-listing order.
pub struct DirSourceStore {
    root: PathBuf,
}

impl DirSourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceStore for DirSourceStore {
    async fn get_snapshot(
        &self,
        gamespace: &str,
        project: &str,
        commit: &str,
    ) -> Result<Vec<SourceFile>, CollaboratorError> {
        let dir = self.root.join(gamespace).join(project).join(commit);
        let listing = tokio::fs::read_dir(&dir).await.map_err(|_| {
            CollaboratorError::not_found(format!("No such source for {project}@{commit}"))
        })?;

        let mut names = Vec::new();
        let mut listing = listing;
        while let Ok(Some(entry)) = listing.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".js") {
                names.push(name);
            }
        }

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let text = tokio::fs::read_to_string(dir.join(&name))
                .await
                .map_err(|e| CollaboratorError::new(500, format!("reading {name}: {e}")))?;
            files.push(SourceFile { name, text });
        }
        Ok(files)
    }
}

/// In-memory source store keyed by `(gamespace, project, commit)`.
#[derive(Default)]
pub struct MemorySourceStore {
    snapshots: RwLock<HashMap<(String, String, String), Vec<SourceFile>>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, gamespace: &str, project: &str, commit: &str, files: Vec<SourceFile>) {
        self.snapshots.write().insert(
            (gamespace.to_string(), project.to_string(), commit.to_string()),
            files,
        );
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn get_snapshot(
        &self,
        gamespace: &str,
        project: &str,
        commit: &str,
    ) -> Result<Vec<SourceFile>, CollaboratorError> {
        self.snapshots
            .read()
            .get(&(
                gamespace.to_string(),
                project.to_string(),
                commit.to_string(),
            ))
            .cloned()
            .ok_or_else(|| {
                CollaboratorError::not_found(format!("No such source for {project}@{commit}"))
            })
    }
}

/// In-memory version→commit bindings.
#[derive(Default)]
pub struct MemoryProjectSettings {
    versions: RwLock<HashMap<(String, String, String), ProjectSource>>,
    servers: RwLock<HashMap<String, ProjectSource>>,
}

impl MemoryProjectSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_version(&self, gamespace: &str, app: &str, version: &str, commit: &str) {
        self.versions.write().insert(
            (gamespace.to_string(), app.to_string(), version.to_string()),
            ProjectSource {
                current_commit: commit.to_string(),
                ..ProjectSource::default()
            },
        );
    }

    pub fn bind_server(&self, gamespace: &str, commit: &str) {
        self.servers.write().insert(
            gamespace.to_string(),
            ProjectSource {
                current_commit: commit.to_string(),
                ..ProjectSource::default()
            },
        );
    }
}

#[async_trait]
impl ProjectSettings for MemoryProjectSettings {
    async fn get(
        &self,
        gamespace: &str,
        application_name: &str,
        application_version: &str,
    ) -> Result<ProjectSource, CollaboratorError> {
        self.versions
            .read()
            .get(&(
                gamespace.to_string(),
                application_name.to_string(),
                application_version.to_string(),
            ))
            .cloned()
            .ok_or_else(|| {
                CollaboratorError::not_found(format!(
                    "No such source for {application_name}/{application_version}"
                ))
            })
    }

    async fn get_server(&self, gamespace: &str) -> Result<ProjectSource, CollaboratorError> {
        self.servers
            .read()
            .get(gamespace)
            .cloned()
            .ok_or_else(|| CollaboratorError::not_found("No default source"))
    }
}

/// In-memory `(name, code, imports)` function rows.
#[derive(Default)]
pub struct MemoryFunctionRepo {
    rows: RwLock<HashMap<(String, String), (String, Vec<String>)>>,
}

impl MemoryFunctionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, gamespace: &str, name: &str, code: &str, imports: Vec<String>) {
        self.rows.write().insert(
            (gamespace.to_string(), name.to_string()),
            (code.to_string(), imports),
        );
    }
}

#[async_trait]
impl FunctionRepo for MemoryFunctionRepo {
    async fn get_with_deps(
        &self,
        gamespace: &str,
        function_name: &str,
        _application_name: Option<&str>,
    ) -> Result<Vec<SourceFile>, CollaboratorError> {
        let rows = self.rows.read();
        let (code, imports) = rows
            .get(&(gamespace.to_string(), function_name.to_string()))
            .cloned()
            .ok_or_else(|| CollaboratorError::not_found("No such function"))?;

        let mut files = Vec::new();
        for import in &imports {
            let (source, _) = rows
                .get(&(gamespace.to_string(), import.clone()))
                .cloned()
                .ok_or_else(|| {
                    CollaboratorError::not_found(format!("No such function import: {import}"))
                })?;
            files.push(SourceFile::new(import.clone(), source));
        }
        // Entry function last so it may reference its imports.
        files.push(SourceFile::new(function_name, code));
        Ok(files)
    }
}

/// Downstream client that POSTs JSON to `<base>/<service>/<method>`.
pub struct HttpDownstream {
    base: String,
    client: reqwest::Client,
}

impl HttpDownstream {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn request(
        &self,
        service: &str,
        method: &str,
        args: Json,
        timeout: Duration,
    ) -> Result<Json, DownstreamError> {
        let url = format!("{}/{}/{}", self.base.trim_end_matches('/'), service, method);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&args)
            .send()
            .await
            .map_err(|e| DownstreamError::new(599, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DownstreamError::new(599, e.to_string()))?;

        if !status.is_success() {
            return Err(DownstreamError::new(status.as_u16(), body));
        }
        serde_json::from_str(&body).map_err(|e| DownstreamError::new(500, e.to_string()))
    }
}

/// Publisher that only logs; stands in when no broker is configured.
pub struct LogPublisher;

#[async_trait]
impl MessagePublisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: Json) -> Result<(), DownstreamError> {
        tracing::info!(topic = %topic, payload = %payload, "published message");
        Ok(())
    }
}

/// Downstream stub that fails every request; used where no services exist.
pub struct NullDownstream;

#[async_trait]
impl Downstream for NullDownstream {
    async fn request(
        &self,
        service: &str,
        method: &str,
        _args: Json,
        _timeout: Duration,
    ) -> Result<Json, DownstreamError> {
        Err(DownstreamError::new(
            503,
            format!("no downstream configured for {service}/{method}"),
        ))
    }
}
