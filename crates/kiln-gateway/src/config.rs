//! CLI options and the project settings file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kiln_engine::{EngineConfig, MemoryProjectSettings};
use serde::Deserialize;

/// Gateway options; every flag can also come from the environment.
#[derive(Parser, Debug)]
#[command(name = "kiln-gateway", version, about)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, env = "KILN_LISTEN", default_value = "0.0.0.0:9507")]
    pub listen: SocketAddr,

    /// Directory the checked-out sources live in
    /// (`<dir>/<gamespace>/<project>/<commit>/*.js`).
    #[arg(long, env = "KILN_SOURCE_DIR", default_value = "/opt/kiln/source")]
    pub source_dir: PathBuf,

    /// JSON file with version→commit bindings per gamespace.
    #[arg(long, env = "KILN_SETTINGS_FILE")]
    pub settings_file: Option<PathBuf>,

    /// Base URL of the internal services gateway; downstream API calls fail
    /// when unset.
    #[arg(long, env = "KILN_INTERNAL_BASE")]
    pub internal_base: Option<String>,

    /// Number of script worker threads (default: CPU count).
    #[arg(long, env = "KILN_JS_WORKERS")]
    pub js_workers: Option<usize>,

    /// Per-call timeout, seconds.
    #[arg(long, env = "KILN_JS_CALL_TIMEOUT")]
    pub js_call_timeout: Option<u64>,

    /// Synchronous-stretch timeout, milliseconds.
    #[arg(long, env = "KILN_JS_MICRO_TIMEOUT_MS")]
    pub js_micro_timeout_ms: Option<u64>,

    /// Idle seconds before an unused build is destroyed.
    #[arg(long, env = "KILN_BUILD_IDLE_RELEASE")]
    pub build_idle_release: Option<u64>,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, env = "KILN_LOG", default_value = "info")]
    pub log: String,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(workers) = self.js_workers {
            config = config.js_workers(workers);
        }
        if let Some(seconds) = self.js_call_timeout {
            config = config.js_call_timeout(Duration::from_secs(seconds));
        }
        if let Some(millis) = self.js_micro_timeout_ms {
            config = config.js_micro_timeout(Duration::from_millis(millis));
        }
        if let Some(seconds) = self.build_idle_release {
            config = config.build_idle_release(Duration::from_secs(seconds));
        }
        config
    }
}

/// On-disk settings shape:
///
/// ```json
/// {
///   "gamespaces": {
///     "1": {
///       "apps": {"brainout": {"0.1": "6f3a09c"}},
///       "server": "bb01d2e"
///     }
///   }
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub gamespaces: HashMap<String, GamespaceSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GamespaceSettings {
    #[serde(default)]
    pub apps: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub server: Option<String>,
}

impl SettingsFile {
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn into_settings(self) -> Arc<MemoryProjectSettings> {
        let settings = MemoryProjectSettings::new();
        for (gamespace, entry) in self.gamespaces {
            for (app, versions) in entry.apps {
                for (version, commit) in versions {
                    settings.bind_version(&gamespace, &app, &version, &commit);
                }
            }
            if let Some(commit) = entry.server {
                settings.bind_server(&gamespace, &commit);
            }
        }
        Arc::new(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_file_parses_bindings() {
        let file: SettingsFile = serde_json::from_str(
            r#"{
                "gamespaces": {
                    "1": {
                        "apps": {"brainout": {"0.1": "6f3a09c", "0.2": "77ab001"}},
                        "server": "bb01d2e"
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(file.gamespaces.len(), 1);
        let _settings = file.into_settings();
    }

    #[test]
    fn engine_config_applies_overrides() {
        let args = Args::parse_from([
            "kiln-gateway",
            "--js-workers",
            "3",
            "--js-call-timeout",
            "2",
        ]);
        let config = args.engine_config();
        assert_eq!(config.js_workers, 3);
        assert_eq!(config.js_call_timeout, Duration::from_secs(2));
    }
}
