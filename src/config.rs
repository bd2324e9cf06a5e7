//! Engine configuration (`quire.toml`).
//!
//! Defines the typed configuration for the engine: lock timing, status
//! throttling, the index cache location and repository policy. Every field
//! has a default, so an empty or missing file is a valid configuration.
//!
//! ```toml
//! [lock]
//! timeout_ms = 60000
//! max_pending = 100
//!
//! [status]
//! throttle_ms = 100
//!
//! [index]
//! cache_root = "/var/cache/quire"
//!
//! [repositories]
//! allowed_branches = ["main", "master"]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable naming the config file to load.
pub const CONFIG_ENV: &str = "QUIRE_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
///
/// Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Repository lock settings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Status reporter settings.
    #[serde(default)]
    pub status: StatusConfig,

    /// Dataset index settings.
    #[serde(default)]
    pub index: IndexConfig,

    /// Working copy policy.
    #[serde(default)]
    pub repositories: RepositoriesConfig,
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

/// Repository lock settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How long a queued mutation waits before failing with a timeout.
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of waiters queued behind the holder.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl LockConfig {
    /// [`LockConfig::timeout_ms`] as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            max_pending: default_max_pending(),
        }
    }
}

const fn default_lock_timeout_ms() -> u64 {
    60_000
}

const fn default_max_pending() -> usize {
    100
}

// ---------------------------------------------------------------------------
// StatusConfig
// ---------------------------------------------------------------------------

/// Status reporter settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    /// Window within which consecutive busy updates of one operation are
    /// coalesced.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
}

impl StatusConfig {
    /// [`StatusConfig::throttle_ms`] as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
        }
    }
}

const fn default_throttle_ms() -> u64 {
    100
}

// ---------------------------------------------------------------------------
// IndexConfig
// ---------------------------------------------------------------------------

/// Dataset index settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Where index stores live. Defaults to `$XDG_CACHE_HOME/quire/index`,
    /// then `$HOME/.cache/quire/index`, then the system temp directory.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
}

impl IndexConfig {
    /// The effective cache root.
    #[must_use]
    pub fn cache_root(&self) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        let base = std::env::var_os("XDG_CACHE_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .filter(|v| !v.is_empty())
                    .map(|home| PathBuf::from(home).join(".cache"))
            })
            .unwrap_or_else(std::env::temp_dir);
        base.join("quire").join("index")
    }
}

// ---------------------------------------------------------------------------
// RepositoriesConfig
// ---------------------------------------------------------------------------

/// Working copy policy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoriesConfig {
    /// Branch names accepted by `init` and `clone`.
    #[serde(default = "default_allowed_branches")]
    pub allowed_branches: Vec<String>,
}

impl RepositoriesConfig {
    /// Whether `branch` may be used for a new working copy.
    #[must_use]
    pub fn allows(&self, branch: &str) -> bool {
        self.allowed_branches.iter().any(|b| b == branch)
    }
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            allowed_branches: default_allowed_branches(),
        }
    }
}

fn default_allowed_branches() -> Vec<String> {
    vec!["main".to_owned(), "master".to_owned()]
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// An error loading or parsing `quire.toml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Load from `$QUIRE_CONFIG` if set, else defaults.
    ///
    /// # Errors
    /// Same as [`EngineConfig::load`].
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_all_fields() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.lock.timeout(), Duration::from_secs(60));
        assert_eq!(cfg.lock.max_pending, 100);
        assert_eq!(cfg.status.window(), Duration::from_millis(100));
        assert_eq!(cfg.index.cache_root, None);
        assert!(cfg.repositories.allows("main"));
        assert!(cfg.repositories.allows("master"));
        assert!(!cfg.repositories.allows("develop"));
    }

    #[test]
    fn empty_string_is_defaults() {
        assert_eq!(EngineConfig::parse("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = EngineConfig::parse(
            r#"
[lock]
timeout_ms = 250

[repositories]
allowed_branches = ["trunk"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.lock.timeout_ms, 250);
        assert_eq!(cfg.lock.max_pending, 100);
        assert!(cfg.repositories.allows("trunk"));
        assert!(!cfg.repositories.allows("main"));
    }

    #[test]
    fn explicit_cache_root_wins() {
        let cfg = EngineConfig::parse("[index]\ncache_root = \"/tmp/q\"\n").unwrap();
        assert_eq!(cfg.index.cache_root(), PathBuf::from("/tmp/q"));
    }

    #[test]
    fn unknown_field_reports_line() {
        let err = EngineConfig::parse("[lock]\ntimeout_ms = 1\nbogus = true\n").unwrap_err();
        assert!(err.message.contains("line 3"), "{}", err.message);
    }

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(&dir.path().join("quire.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn load_attaches_path_to_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quire.toml");
        std::fs::write(&path, "[status]\nthrottle_ms = \"fast\"\n").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
    }
}
