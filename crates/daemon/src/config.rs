// Service configuration.
//
// One TOML file, loaded once at startup into an immutable `Config` that is
// handed to each component's constructor. Secrets may come from the
// environment instead of the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::db::pool::PoolConfig;
use crate::dispatcher::MAX_CAPACITY;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/repomirror/config.toml";

const ENV_DATABASE_URL: &str = "REPOMIRROR_DATABASE_URL";
const ENV_PLATFORM_TOKEN: &str = "REPOMIRROR_PLATFORM_TOKEN";
const ENV_FORWARD_TOKEN: &str = "REPOMIRROR_FORWARD_TOKEN";
const ENV_INGRESS_TOKEN: &str = "REPOMIRROR_INGRESS_TOKEN";
const ENV_LOG_FILTER: &str = "REPOMIRROR_LOG_FILTER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `tracing` filter directive, e.g. `info` or `repomirror_daemon=debug`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub platform: PlatformConfig,
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Parent of the per-sync scratch directories.
    pub work_dir: PathBuf,
    pub sync_script: PathBuf,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub tool_path: PathBuf,
    pub bucket: String,
    /// Prefix of the content-addressed large-object store.
    pub lfs_prefix: String,
    /// Prefix under which mirrored repositories live.
    pub repo_prefix: String,
    /// Name of the watermark object inside each repository prefix.
    pub commit_file: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub api_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_clone_username")]
    pub clone_username: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Expected `User-Agent` of inbound events.
    pub user_agent: String,
    pub workspace_size_gb: f64,
    pub average_repo_size_gb: f64,
    pub forward_endpoint: String,
    #[serde(default)]
    pub forward_token: String,
    #[serde(default = "default_max_resend")]
    pub max_resend: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            url: String::new(),
            min_connections: pool.min_connections,
            max_connections: pool.max_connections,
            acquire_timeout_secs: pool.acquire_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IngressConfig {
    pub listen_addr: SocketAddr,
    /// Shared secret expected in `X-Gitlab-Token`; unchecked when unset.
    pub token: Option<String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self { listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)), token: None }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_lock_ttl_secs() -> u64 {
    repomirror_common::lock::DEFAULT_LOCK_TTL.as_secs()
}

fn default_clone_username() -> String {
    "oauth2".into()
}

fn default_max_resend() -> u32 {
    5
}

impl Config {
    /// Read, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&contents, |key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_toml_with_env<F>(contents: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let mut config: Self = toml::from_str(contents)?;
        config.apply_env_fn(env);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_fn<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let non_empty = |key: &str| env(key).ok().filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Some(token) = non_empty(ENV_PLATFORM_TOKEN) {
            self.platform.token = token;
        }
        if let Some(token) = non_empty(ENV_FORWARD_TOKEN) {
            self.dispatcher.forward_token = token;
        }
        if let Some(token) = non_empty(ENV_INGRESS_TOKEN) {
            self.ingress.token = Some(token);
        }
        if let Some(filter) = non_empty(ENV_LOG_FILTER) {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_absolute("service.work_dir", &self.service.work_dir)?;
        require_absolute("service.sync_script", &self.service.sync_script)?;
        require_absolute("storage.tool_path", &self.storage.tool_path)?;
        if self.service.lock_ttl_secs == 0 {
            return Err(invalid("service.lock_ttl_secs must be positive"));
        }

        require_relative_prefix("storage.lfs_prefix", &self.storage.lfs_prefix)?;
        require_relative_prefix("storage.repo_prefix", &self.storage.repo_prefix)?;
        require_non_empty("storage.bucket", &self.storage.bucket)?;
        require_non_empty("storage.commit_file", &self.storage.commit_file)?;

        require_non_empty("platform.api_url", &self.platform.api_url)?;
        require_non_empty("dispatcher.user_agent", &self.dispatcher.user_agent)?;
        require_non_empty("dispatcher.forward_endpoint", &self.dispatcher.forward_endpoint)?;
        require_non_empty("database.url", &self.database.url)?;

        let average = self.dispatcher.average_repo_size_gb;
        if !(average.is_finite() && average > 0.0) {
            return Err(invalid("dispatcher.average_repo_size_gb must be positive"));
        }
        if self.queue_capacity() == 0 {
            return Err(invalid(format!(
                "workspace of {} GB holds no syncs of {} GB (capacity is floor(workspace / average / 2))",
                self.dispatcher.workspace_size_gb, average
            )));
        }
        if self.queue_capacity() > MAX_CAPACITY {
            return Err(invalid(format!(
                "workspace of {} GB over syncs of {} GB gives capacity above the limit of {MAX_CAPACITY}",
                self.dispatcher.workspace_size_gb, average
            )));
        }

        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(invalid("database connection limits are inconsistent"));
        }
        Ok(())
    }

    /// Queue capacity and worker count: `floor(workspace / average / 2)`.
    pub fn queue_capacity(&self) -> usize {
        let capacity =
            (self.dispatcher.workspace_size_gb / self.dispatcher.average_repo_size_gb / 2.0).floor();
        if capacity.is_finite() && capacity >= 1.0 {
            capacity as usize
        } else {
            0
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.service.lock_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_connections: self.database.min_connections,
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
        }
    }
}

fn require_absolute(name: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be an absolute path, got `{}`", path.display())))
    }
}

fn require_relative_prefix(name: &str, prefix: &str) -> Result<(), ConfigError> {
    if prefix.starts_with('/') {
        return Err(invalid(format!("{name} must not start with `/`")));
    }
    Ok(())
}

fn require_non_empty(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{name} must be set")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        [service]
        work_dir = "/var/lib/repomirror"
        sync_script = "/opt/repomirror/sync_files.sh"

        [storage]
        tool_path = "/usr/local/bin/obsutil"
        bucket = "mirror"
        lfs_prefix = "lfs/objects"
        repo_prefix = "repos"
        commit_file = ".last_commit"

        [platform]
        api_url = "https://git.example.test"
        token = "file-token"

        [dispatcher]
        user_agent = "Robot-Gitlab-Access"
        workspace_size_gb = 100
        average_repo_size_gb = 10
        forward_endpoint = "https://hooks.example.test/resend"

        [database]
        url = "postgres://localhost/repomirror"
    "#;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    fn no_env() -> impl Fn(&str) -> Result<String, std::env::VarError> {
        env_from_map(HashMap::new())
    }

    #[test]
    fn loads_sample_with_defaults() {
        let config = Config::from_toml_with_env(SAMPLE, no_env()).expect("valid config");

        assert_eq!(config.log_filter, "info");
        assert_eq!(config.lock_ttl(), Duration::from_secs(36_000));
        assert_eq!(config.platform.clone_username, "oauth2");
        assert_eq!(config.dispatcher.max_resend, 5);
        assert_eq!(config.ingress.listen_addr, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(config.ingress.token, None);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.pool_config().max_connections, 20);
        assert_eq!(config.queue_capacity(), 5);
    }

    #[test]
    fn queue_capacity_floors() {
        let text = SAMPLE.replace("workspace_size_gb = 100", "workspace_size_gb = 59");
        let config = Config::from_toml_with_env(&text, no_env()).expect("valid config");
        assert_eq!(config.queue_capacity(), 2);
    }

    #[test]
    fn rejects_zero_capacity() {
        let text = SAMPLE.replace("workspace_size_gb = 100", "workspace_size_gb = 19");
        let error = Config::from_toml_with_env(&text, no_env()).expect_err("capacity 0");
        assert!(error.to_string().contains("capacity"), "{error}");
    }

    #[test]
    fn rejects_capacity_above_limit() {
        let huge = SAMPLE.replace("workspace_size_gb = 100", "workspace_size_gb = 1e30");
        let error = Config::from_toml_with_env(&huge, no_env()).expect_err("capacity too large");
        assert!(error.to_string().contains("limit"), "{error}");

        // 20500 / 10 / 2 = 1025
        let just_over = SAMPLE.replace("workspace_size_gb = 100", "workspace_size_gb = 20500");
        assert!(Config::from_toml_with_env(&just_over, no_env()).is_err());

        let at_limit = SAMPLE.replace("workspace_size_gb = 100", "workspace_size_gb = 20480");
        let config = Config::from_toml_with_env(&at_limit, no_env()).expect("capacity at limit");
        assert_eq!(config.queue_capacity(), MAX_CAPACITY);
    }

    #[test]
    fn rejects_non_positive_average_size() {
        let text = SAMPLE.replace("average_repo_size_gb = 10", "average_repo_size_gb = 0");
        assert!(Config::from_toml_with_env(&text, no_env()).is_err());
    }

    #[test]
    fn rejects_relative_paths_and_absolute_prefixes() {
        let relative = SAMPLE.replace("/opt/repomirror/sync_files.sh", "sync_files.sh");
        assert!(Config::from_toml_with_env(&relative, no_env()).is_err());

        let absolute = SAMPLE.replace("repo_prefix = \"repos\"", "repo_prefix = \"/repos\"");
        assert!(Config::from_toml_with_env(&absolute, no_env()).is_err());
    }

    #[test]
    fn rejects_empty_required_strings() {
        let text = SAMPLE.replace("bucket = \"mirror\"", "bucket = \"\"");
        let error = Config::from_toml_with_env(&text, no_env()).expect_err("empty bucket");
        assert!(error.to_string().contains("storage.bucket"), "{error}");
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = SAMPLE.replace("[platform]", "[platform]\nunknown = 1");
        assert!(matches!(
            Config::from_toml_with_env(&text, no_env()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_secrets() {
        let env = env_from_map(HashMap::from([
            ("REPOMIRROR_DATABASE_URL", "postgres://db.internal/mirror?sslmode=require"),
            ("REPOMIRROR_PLATFORM_TOKEN", "env-token"),
            ("REPOMIRROR_FORWARD_TOKEN", "hmac"),
            ("REPOMIRROR_INGRESS_TOKEN", "ingress"),
            ("REPOMIRROR_LOG_FILTER", "repomirror_daemon=debug"),
        ]));
        let config = Config::from_toml_with_env(SAMPLE, env).expect("valid config");

        assert_eq!(config.database.url, "postgres://db.internal/mirror?sslmode=require");
        assert_eq!(config.platform.token, "env-token");
        assert_eq!(config.dispatcher.forward_token, "hmac");
        assert_eq!(config.ingress.token.as_deref(), Some("ingress"));
        assert_eq!(config.log_filter, "repomirror_daemon=debug");
    }

    #[test]
    fn blank_environment_values_are_ignored() {
        let env = env_from_map(HashMap::from([("REPOMIRROR_PLATFORM_TOKEN", "  ")]));
        let config = Config::from_toml_with_env(SAMPLE, env).expect("valid config");
        assert_eq!(config.platform.token, "file-token");
    }

    #[test]
    fn database_url_may_come_only_from_environment() {
        let text = SAMPLE.replace("url = \"postgres://localhost/repomirror\"", "");
        assert!(Config::from_toml_with_env(&text, no_env()).is_err());

        let env = env_from_map(HashMap::from([("REPOMIRROR_DATABASE_URL", "postgres://localhost/x")]));
        let config = Config::from_toml_with_env(&text, env).expect("url from env");
        assert_eq!(config.database.url, "postgres://localhost/x");
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).expect("write config");

        let config = Config::load(&path).expect("load");
        assert_eq!(config.storage.bucket, "mirror");
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
