//! Layered daemon configuration.
//!
//! Configuration is resolved in four layers, later layers winning:
//! built-in defaults, a TOML config file, environment variables, and
//! command-line flags (applied by the binary after loading).
//!
//! The config file is searched at `./grv.toml` and
//! `$HOME/.config/grv/config.toml`; a missing file is not an error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Default per-task backend timeout in seconds.
pub const DEFAULT_REVIEW_TIMEOUT_SECS: i64 = 600;

/// Default worker count for serve mode.
pub const DEFAULT_WORKERS: usize = 1;

/// Default queue capacity for serve mode.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at start-up.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the expected schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A required setting has no value after all layers were applied.
    #[error("missing required setting: {key}")]
    MissingKey {
        /// Dotted key name, e.g. `gerrit.http_url`.
        key: &'static str,
    },

    /// A setting has a value outside its accepted domain.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Dotted key name.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Selects which AI CLI performs the review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewCli {
    /// Claude Code (`claude`), the default backend.
    Claude,
    /// Codex CLI (`codex`).
    Codex,
}

impl ReviewCli {
    /// Name of the executable on `PATH`.
    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for ReviewCli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for ReviewCli {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            other => Err(ConfigError::InvalidValue {
                key: "review.cli",
                value: other.to_string(),
            }),
        }
    }
}

/// Gerrit connection settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GerritConfig {
    /// SSH alias (from `~/.ssh/config`) used for stream-events and git URLs.
    pub ssh_alias: String,
    /// Base URL of the REST API, e.g. `https://gerrit.example.com`.
    pub http_url: String,
    /// Username for HTTP basic auth.
    pub http_user: String,
    /// Password for HTTP basic auth.
    pub http_password: String,
}

/// Local workspace settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root directory for per-project checkouts.
    pub base_path: PathBuf,
}

/// Review execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Backend selector; invalid values are rejected at load time.
    pub cli: String,
    /// Per-task backend deadline in seconds; values <= 0 fall back to the
    /// default.
    pub timeout_seconds: i64,
    /// Pass the backend's permission-bypass flag. Unsafe; off by default.
    pub skip_permissions: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            cli: String::new(),
            timeout_seconds: DEFAULT_REVIEW_TIMEOUT_SECS,
            skip_permissions: false,
        }
    }
}

/// Event filter rules for serve mode.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FilterConfig {
    /// Projects to review. Empty means all projects.
    pub allow: Vec<String>,
    /// Projects never reviewed. Denial wins over allow.
    pub deny: Vec<String>,
}

/// Serve-mode settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Worker pool size. The default of 1 guarantees each project workspace
    /// has a single writer.
    pub workers: usize,
    /// Task queue capacity.
    pub queue_size: usize,
    /// Keep only the latest patchset per change in the queue.
    pub lazy_mode: bool,
    /// Project filter rules.
    pub filter: FilterConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            lazy_mode: false,
            filter: FilterConfig::default(),
        }
    }
}

/// Logger settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Optional log file path (append mode).
    pub file: Option<PathBuf>,
    /// Also log to stderr when a log file is configured.
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            verbose: false,
        }
    }
}

/// Resolved daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Gerrit connection settings.
    pub gerrit: GerritConfig,
    /// Local workspace settings.
    pub workspace: WorkspaceConfig,
    /// Review execution settings.
    pub review: ReviewConfig,
    /// Serve-mode settings.
    pub serve: ServeConfig,
    /// Logger settings.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from the default search paths plus environment
    /// variables, then validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an existing file cannot be read or parsed,
    /// or if validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match resolve_config_path(path) {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        cfg.apply_defaults();
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a specific TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fills empty settings with built-in defaults.
    pub fn apply_defaults(&mut self) {
        if self.gerrit.ssh_alias.is_empty() {
            self.gerrit.ssh_alias = "gerrit-review".to_string();
        }
        if self.workspace.base_path.as_os_str().is_empty() {
            self.workspace.base_path = PathBuf::from("/tmp/ai-review-repos");
        }
        if self.serve.workers == 0 {
            self.serve.workers = DEFAULT_WORKERS;
        }
        if self.serve.queue_size == 0 {
            self.serve.queue_size = DEFAULT_QUEUE_SIZE;
        }
    }

    /// Applies environment-variable overrides via the supplied lookup.
    ///
    /// Taking the lookup as a closure keeps this testable without mutating
    /// process-wide environment state.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GERRIT_SSH_ALIAS") {
            self.gerrit.ssh_alias = v;
        }
        if let Some(v) = lookup("GERRIT_HTTP_URL") {
            self.gerrit.http_url = v;
        }
        if let Some(v) = lookup("GERRIT_HTTP_USER") {
            self.gerrit.http_user = v;
        }
        if let Some(v) = lookup("GERRIT_HTTP_PASSWORD") {
            self.gerrit.http_password = v;
        }
        if let Some(v) = lookup("GIT_REPO_BASE_PATH") {
            self.workspace.base_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("REVIEW_CLI") {
            self.review.cli = v;
        }
        if let Some(v) = lookup("REVIEW_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.review.timeout_seconds = v;
        }
        if let Some(v) = lookup("REVIEW_SKIP_PERMISSIONS") {
            self.review.skip_permissions = parse_bool(&v);
        }
        if let Some(v) = lookup("SERVE_LAZY_MODE") {
            self.serve.lazy_mode = parse_bool(&v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_FILE") {
            self.logging.file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LOG_VERBOSE") {
            self.logging.verbose = parse_bool(&v);
        }
    }

    /// Checks that every required setting is present and well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKey`] or [`ConfigError::InvalidValue`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gerrit.ssh_alias.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "gerrit.ssh_alias",
            });
        }
        if self.gerrit.http_url.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "gerrit.http_url",
            });
        }
        if self.gerrit.http_user.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "gerrit.http_user",
            });
        }
        if self.gerrit.http_password.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "gerrit.http_password",
            });
        }
        if self.workspace.base_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingKey {
                key: "workspace.base_path",
            });
        }
        self.review_cli()?;
        Ok(())
    }

    /// The selected review backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unknown selectors.
    pub fn review_cli(&self) -> Result<ReviewCli, ConfigError> {
        self.review.cli.parse()
    }

    /// The per-task backend deadline, with the <= 0 fallback applied.
    #[must_use]
    pub fn review_timeout(&self) -> Duration {
        let secs = if self.review.timeout_seconds <= 0 {
            DEFAULT_REVIEW_TIMEOUT_SECS
        } else {
            self.review.timeout_seconds
        };
        Duration::from_secs(secs.unsigned_abs())
    }

    /// SSH clone/fetch URL for a project.
    #[must_use]
    pub fn git_url(&self, project: &str) -> String {
        format!("{}:{}", self.gerrit.ssh_alias, project)
    }

    /// Local checkout path for a project.
    ///
    /// Only the final path component of the project name is used, so a
    /// hostile project name cannot escape the workspace root.
    #[must_use]
    pub fn repo_path(&self, project: &str) -> PathBuf {
        let safe = Path::new(project)
            .file_name()
            .map_or_else(|| project.to_string(), |n| n.to_string_lossy().into_owned());
        self.workspace.base_path.join(safe)
    }

    /// The HTTP password as a secret, for handing to the REST client.
    #[must_use]
    pub fn http_password(&self) -> SecretString {
        SecretString::from(self.gerrit.http_password.clone())
    }

    /// Environment block forwarded to child processes that use the
    /// companion `gerrit-cli` tool.
    #[must_use]
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("GERRIT_SSH_ALIAS", self.gerrit.ssh_alias.clone()),
            ("GERRIT_HTTP_URL", self.gerrit.http_url.clone()),
            ("GERRIT_HTTP_USER", self.gerrit.http_user.clone()),
            ("GERRIT_HTTP_PASSWORD", self.gerrit.http_password.clone()),
            (
                "GIT_REPO_BASE_PATH",
                self.workspace.base_path.to_string_lossy().into_owned(),
            ),
        ]
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("grv.toml");
    if local.is_file() {
        return Some(local);
    }
    let home = std::env::var_os("HOME")?;
    let user = PathBuf::from(home).join(".config/grv/config.toml");
    user.is_file().then_some(user)
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.gerrit.http_url = "https://gerrit.example.com".to_string();
        cfg.gerrit.http_user = "reviewer".to_string();
        cfg.gerrit.http_password = "hunter2".to_string();
        cfg.apply_defaults();
        cfg
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let cfg = valid_config();
        assert_eq!(cfg.gerrit.ssh_alias, "gerrit-review");
        assert_eq!(cfg.workspace.base_path, PathBuf::from("/tmp/ai-review-repos"));
        assert_eq!(cfg.serve.workers, 1);
        assert_eq!(cfg.serve.queue_size, 100);
        assert!(!cfg.serve.lazy_mode);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_http_settings() {
        let mut cfg = valid_config();
        cfg.gerrit.http_url.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingKey {
                key: "gerrit.http_url"
            })
        ));
    }

    #[test]
    fn invalid_review_cli_is_rejected() {
        let mut cfg = valid_config();
        cfg.review.cli = "copilot".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                key: "review.cli",
                ..
            })
        ));
    }

    #[test]
    fn empty_review_cli_means_claude() {
        let cfg = valid_config();
        assert_eq!(cfg.review_cli().unwrap(), ReviewCli::Claude);
        assert_eq!(ReviewCli::Claude.binary(), "claude");
        assert_eq!("codex".parse::<ReviewCli>().unwrap(), ReviewCli::Codex);
    }

    #[test]
    fn timeout_fallback_applies_to_non_positive_values() {
        let mut cfg = valid_config();
        cfg.review.timeout_seconds = 0;
        assert_eq!(cfg.review_timeout(), Duration::from_secs(600));
        cfg.review.timeout_seconds = -5;
        assert_eq!(cfg.review_timeout(), Duration::from_secs(600));
        cfg.review.timeout_seconds = 120;
        assert_eq!(cfg.review_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = valid_config();
        cfg.apply_env(|key| match key {
            "GERRIT_SSH_ALIAS" => Some("corp-gerrit".to_string()),
            "SERVE_LAZY_MODE" => Some("yes".to_string()),
            "REVIEW_TIMEOUT_SECONDS" => Some("90".to_string()),
            _ => None,
        });
        assert_eq!(cfg.gerrit.ssh_alias, "corp-gerrit");
        assert!(cfg.serve.lazy_mode);
        assert_eq!(cfg.review.timeout_seconds, 90);
    }

    #[test]
    fn repo_path_discards_directory_components() {
        let cfg = valid_config();
        assert_eq!(
            cfg.repo_path("platform/tools/build"),
            PathBuf::from("/tmp/ai-review-repos/build")
        );
        assert_eq!(
            cfg.repo_path("../../etc"),
            PathBuf::from("/tmp/ai-review-repos/etc")
        );
    }

    #[test]
    fn git_url_joins_alias_and_project() {
        let cfg = valid_config();
        assert_eq!(cfg.git_url("tools/build"), "gerrit-review:tools/build");
    }

    #[test]
    fn child_env_carries_gerrit_settings() {
        let cfg = valid_config();
        let env = cfg.child_env();
        assert!(env.contains(&("GERRIT_HTTP_USER", "reviewer".to_string())));
        assert!(env.contains(&("GERRIT_SSH_ALIAS", "gerrit-review".to_string())));
    }

    #[test]
    fn from_file_parses_toml_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[gerrit]
ssh_alias = "review"
http_url = "https://gerrit.example.com"
http_user = "bot"
http_password = "secret"

[serve]
workers = 2
queue_size = 50
lazy_mode = true

[serve.filter]
allow = ["tools/build"]
deny = ["sandbox"]

[logging]
level = "debug"
"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.gerrit.ssh_alias, "review");
        assert_eq!(cfg.serve.workers, 2);
        assert_eq!(cfg.serve.queue_size, 50);
        assert!(cfg.serve.lazy_mode);
        assert_eq!(cfg.serve.filter.allow, vec!["tools/build".to_string()]);
        assert_eq!(cfg.serve.filter.deny, vec!["sandbox".to_string()]);
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn from_file_rejects_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "gerrit = 3").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
