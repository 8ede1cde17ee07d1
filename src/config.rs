//! TOML configuration for the meshtest daemon.
//!
//! Layered model: the file named by `MESHTEST_CONFIG`, then the standard
//! system location, then compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshtestConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshtestConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded meshtest configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `MESHTEST_CONFIG` environment variable.
    /// 2. `/etc/meshtest/meshtest.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("MESHTEST_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MESHTEST_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/meshtest/meshtest.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// SQLite storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/meshtest.db"),
        }
    }
}

/// HTTP API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Control-plane API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL, e.g. `http://api-service:8080`.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Networks managed by this orchestrator. Networks referenced by stored
    /// test parameters are always included as well.
    pub networks: Vec<String>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082".to_string(),
            request_timeout_secs: 1,
            networks: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = MeshtestConfig::default();
        assert_eq!(cfg.database.path, PathBuf::from("data/meshtest.db"));
        assert_eq!(cfg.api.bind, "0.0.0.0:8080");
        assert_eq!(cfg.control_plane.request_timeout_secs, 1);
        assert!(cfg.control_plane.networks.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[control_plane]
base_url = "http://api:9000"
networks = ["net1", "net2"]
"#;
        let cfg: MeshtestConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.control_plane.base_url, "http://api:9000");
        assert_eq!(cfg.control_plane.networks, vec!["net1", "net2"]);
        assert_eq!(cfg.control_plane.request_timeout_secs, 1);
        assert_eq!(cfg.api.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: MeshtestConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.database.path, PathBuf::from("data/meshtest.db"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshtest.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/x.db\"\n[logging]\njson = true\n").unwrap();

        let cfg = MeshtestConfig::load(&path).unwrap();
        assert_eq!(cfg.database.path, PathBuf::from("/tmp/x.db"));
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(MeshtestConfig::load(Path::new("/nonexistent/meshtest.toml")).is_err());
    }
}
