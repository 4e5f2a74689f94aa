use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name.
pub const CONFIG_TOML: &str = ".hive.toml";

/// Environment overrides applied on top of the file.
pub const ENV_DIR: &str = "HIVE_DIR";
pub const ENV_POLL_INTERVAL: &str = "HIVE_POLL_INTERVAL";
pub const ENV_LEASE_TTL: &str = "HIVE_LEASE_TTL";
pub const ENV_WORKERS: &str = "HIVE_WORKERS";

/// Find the config file path. Returns None if it doesn't exist.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    toml_path.exists().then_some(toml_path)
}

/// Top-level .hive.toml config.
///
/// Built once at process start (file, then environment overrides) and handed
/// to every component; nothing below `main` looks at the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoordinationConfig {
    /// Shared coordination directory, relative to the config file.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_summary_interval_ms")]
    pub summary_interval_ms: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            summary_interval_ms: default_summary_interval_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: u32,
    #[serde(default = "default_worker_prefix")]
    pub prefix: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            prefix: default_worker_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run an agent CLI with the prompt as its last argument.
    Command,
    /// Call an Anthropic Messages compatible endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_command_args")]
    pub args: Vec<String>,
    /// Flag used to pass `model` to the command backend.
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_url")]
    pub url: String,
    /// Name of the environment variable holding the HTTP API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_900")]
    pub timeout_secs: u64,
    /// Resolved from `api_key_env` at startup, never written to disk.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            command: default_command(),
            args: default_command_args(),
            model_flag: None,
            model: None,
            url: default_url(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_900(),
            api_key: None,
        }
    }
}

// Default value functions for serde
fn default_dir() -> PathBuf { PathBuf::from(".hive") }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_summary_interval_ms() -> u64 { 3000 }
fn default_lease_ttl_secs() -> u64 { crate::lease::DEFAULT_TTL_SECS }
fn default_heartbeat_interval_secs() -> u64 { crate::lease::DEFAULT_HEARTBEAT_SECS }
fn default_worker_count() -> u32 { 2 }
fn default_worker_prefix() -> String { "worker".into() }
fn default_backend_kind() -> BackendKind { BackendKind::Command }
fn default_command() -> String { "claude".into() }
fn default_command_args() -> Vec<String> { vec!["-p".into()] }
fn default_url() -> String { "https://api.anthropic.com/v1/messages".into() }
fn default_api_key_env() -> String { "ANTHROPIC_API_KEY".into() }
fn default_max_tokens() -> u32 { 4096 }
fn default_timeout_900() -> u64 { 900 }

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    /// Load `.hive.toml` from `project_root`, or defaults when absent.
    /// A relative coordination dir is resolved against `project_root`.
    pub fn discover(project_root: &Path) -> anyhow::Result<Self> {
        let mut config = match find_config(project_root) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        if config.coordination.dir.is_relative() {
            config.coordination.dir = project_root.join(&config.coordination.dir);
        }
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid .hive.toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HIVE_*` overrides and resolve the API key.
    ///
    /// Takes the variables as an iterator so callers decide where they come
    /// from; `main` passes `std::env::vars()`.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ExitError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            if key == self.backend.api_key_env {
                let value = value.into();
                if !value.is_empty() {
                    self.backend.api_key = Some(value);
                }
                continue;
            }
            match key {
                ENV_DIR => self.coordination.dir = PathBuf::from(value.into()),
                ENV_POLL_INTERVAL => self.coordination.poll_interval_ms = parse_env(key, value)?,
                ENV_LEASE_TTL => self.coordination.lease_ttl_secs = parse_env(key, value)?,
                ENV_WORKERS => self.workers.count = parse_env(key, value)?,
                _ => {}
            }
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ExitError> {
        let c = &self.coordination;
        if c.poll_interval_ms == 0 || c.summary_interval_ms == 0 {
            return Err(ExitError::Config("poll intervals must be greater than zero".into()));
        }
        if c.lease_ttl_secs == 0 || c.heartbeat_interval_secs == 0 {
            return Err(ExitError::Config("lease ttl and heartbeat interval must be greater than zero".into()));
        }
        if c.heartbeat_interval_secs >= c.lease_ttl_secs {
            return Err(ExitError::Config(format!(
                "heartbeat interval ({}s) must be shorter than the lease ttl ({}s)",
                c.heartbeat_interval_secs, c.lease_ttl_secs
            )));
        }
        if self.workers.count == 0 {
            return Err(ExitError::Config("workers.count must be at least 1".into()));
        }
        Ok(())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut().set_prefix("# hive coordination configuration\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(
            &mut doc,
            "coordination",
            "# Shared directory and protocol timing (HIVE_DIR, HIVE_POLL_INTERVAL, HIVE_LEASE_TTL override)\n",
        );
        set_table_comment(&mut doc, "workers", "\n# Worker pool (HIVE_WORKERS overrides count)\n");
        set_table_comment(
            &mut doc,
            "backend",
            "\n# Task execution: kind = \"command\" runs `command args... <prompt>`,\n# kind = \"http\" posts to `url` with the key from `api_key_env`\n",
        );

        Ok(doc.to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordination.poll_interval_ms)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_millis(self.coordination.summary_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.coordination.heartbeat_interval_secs)
    }

    /// Worker id for a 1-based worker number.
    pub fn worker_id(&self, n: u32) -> String {
        format!("{}-{n}", self.workers.prefix)
    }

    /// Ids of every configured worker, in order.
    pub fn worker_ids(&self) -> Vec<String> {
        (1..=self.workers.count).map(|n| self.worker_id(n)).collect()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: impl Into<String>) -> Result<T, ExitError> {
    let value = value.into();
    value
        .trim()
        .parse()
        .map_err(|_| ExitError::Config(format!("{key}={value:?} is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_toml_config() {
        let toml_str = r#"
[coordination]
dir = "/tmp/hive"
poll_interval_ms = 500
summary_interval_ms = 2000
lease_ttl_secs = 120
heartbeat_interval_secs = 4

[workers]
count = 4
prefix = "w"

[backend]
kind = "http"
model = "claude-sonnet-4-5"
max_tokens = 2048
timeout_secs = 60
"#;

        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.coordination.dir, PathBuf::from("/tmp/hive"));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.coordination.lease_ttl_secs, 120);
        assert_eq!(config.worker_ids(), vec!["w-1", "w-2", "w-3", "w-4"]);
        assert_eq!(config.backend.kind, BackendKind::Http);
        assert_eq!(config.backend.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(config.backend.url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.coordination.dir, PathBuf::from(".hive"));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.summary_interval(), Duration::from_secs(3));
        assert_eq!(config.coordination.lease_ttl_secs, 300);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.worker_ids(), vec!["worker-1", "worker-2"]);
        assert_eq!(config.backend.kind, BackendKind::Command);
        assert_eq!(config.backend.command, "claude");
        assert_eq!(config.backend.args, vec!["-p"]);
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid .hive.toml"));
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn rejects_heartbeat_slower_than_ttl() {
        let err = Config::parse_toml(
            "[coordination]\nlease_ttl_secs = 10\nheartbeat_interval_secs = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat interval"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_env([
                ("HIVE_DIR", "/srv/hive"),
                ("HIVE_POLL_INTERVAL", "250"),
                ("HIVE_LEASE_TTL", "60"),
                ("HIVE_WORKERS", "3"),
                ("ANTHROPIC_API_KEY", "sk-test"),
                ("UNRELATED", "x"),
            ])
            .unwrap();
        assert_eq!(config.coordination.dir, PathBuf::from("/srv/hive"));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.coordination.lease_ttl_secs, 60);
        assert_eq!(config.workers.count, 3);
        assert_eq!(config.backend.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = Config::default();
        let err = config.apply_env([("HIVE_LEASE_TTL", "soon")]).unwrap_err();
        assert!(matches!(err, ExitError::Config(_)));
        let err = config.apply_env([("HIVE_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ExitError::Config(_)));
    }

    #[test]
    fn discover_resolves_relative_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::discover(dir.path()).unwrap();
        assert_eq!(config.coordination.dir, dir.path().join(".hive"));

        std::fs::write(dir.path().join(CONFIG_TOML), "[coordination]\ndir = \"state\"\n").unwrap();
        let config = Config::discover(dir.path()).unwrap();
        assert_eq!(config.coordination.dir, dir.path().join("state"));
    }

    #[test]
    fn roundtrip_toml_keeps_values_and_drops_key() {
        let mut config = Config::default();
        config.workers.count = 5;
        config.backend.api_key = Some("secret".into());
        let output = config.to_toml().unwrap();
        assert!(output.contains("# hive coordination configuration"));
        assert!(output.contains("# Worker pool"));
        assert!(!output.contains("secret"));
        let parsed = Config::parse_toml(&output).unwrap();
        assert_eq!(parsed.workers.count, 5);
        assert!(parsed.backend.api_key.is_none());
    }

    #[test]
    fn find_config_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config(dir.path()).is_none());
        std::fs::write(dir.path().join(CONFIG_TOML), "").unwrap();
        assert!(find_config(dir.path()).is_some());
    }
}
