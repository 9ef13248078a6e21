//! Configuration loading and validation.
//!
//! Reads `{config_dir}/sandpool/config.json` when present, falls back to
//! defaults, and applies `SANDPOOL_*` environment overrides on top. All
//! resource caps and timeout floors are validated once at load time;
//! nothing downstream re-checks them.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

/// Application name, used for the config directory, container labels, and
/// the default broker key prefix.
pub const APP_NAME: &str = "sandpool";

/// Discriminator label set on every container this host manages.
pub const MANAGED_LABEL: &str = "sandpool.docker-cc";

/// Pool sizing caps.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PoolLimits {
    /// Warm-pool floor: unassigned idle containers kept ready.
    pub min_warm: usize,
    /// Hard ceiling on containers this host manages.
    pub max_total: usize,
    /// Ceiling on containers sharing one agent-instance id.
    pub max_per_agent: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_warm: 1,
            max_total: 10,
            max_per_agent: 3,
        }
    }
}

/// Per-container resource caps, passed through to the runtime.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Resources {
    /// Memory limit in runtime syntax, e.g. `"2g"`.
    pub memory: String,
    /// CPU share, e.g. `1.5`.
    pub cpus: f64,
    /// Max PIDs inside the container.
    pub pids_limit: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: 2.0,
            pids_limit: 256,
        }
    }
}

/// Lifecycle timing knobs, all in milliseconds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Idle duration after which an assigned container becomes reapable.
    pub idle_ms: u64,
    /// Absolute container lifetime ceiling.
    pub max_age_ms: u64,
    /// Health tick period; staleness thresholds derive from it.
    pub health_interval_ms: u64,
    /// How long to wait for a created container to reach running.
    pub startup_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle_ms: 30 * 60 * 1000,
            max_age_ms: 4 * 60 * 60 * 1000,
            health_interval_ms: 30_000,
            startup_ms: 60_000,
        }
    }
}

/// Broker connection settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RedisConfig {
    /// Broker URL; `None` means the host-side default.
    pub url: Option<String>,
    /// Namespace prepended to every session key.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: format!("{APP_NAME}:cc:"),
        }
    }
}

/// Runtime-level container options.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Prefix for every managed container name.
    pub container_prefix: String,
    /// Network to attach containers to.
    pub network: String,
    /// Capabilities dropped from every container.
    pub cap_drop: Vec<String>,
    /// Extra security options (`no-new-privileges` and friends).
    pub security_opts: Vec<String>,
    /// Additional binds in `host:container[:ro]` syntax.
    pub binds: Vec<String>,
    /// Additional environment injected into every container.
    pub env: HashMap<String, String>,
    /// Host directory under which default workspaces for warm containers
    /// are created.
    pub workspace_root: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            container_prefix: format!("{APP_NAME}-cc-"),
            network: "bridge".to_string(),
            cap_drop: vec!["NET_RAW".to_string(), "SYS_ADMIN".to_string()],
            security_opts: vec!["no-new-privileges".to_string()],
            binds: Vec::new(),
            env: HashMap::new(),
            workspace_root: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_NAME)
                .join("workspaces"),
        }
    }
}

/// Top-level configuration for the container pool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Master switch; when false the runner refuses requests.
    pub enabled: bool,
    pub pool: PoolLimits,
    /// Image every managed container runs.
    pub image: String,
    pub resources: Resources,
    pub timeouts: Timeouts,
    pub redis: RedisConfig,
    pub docker: DockerConfig,
    /// Host-side endpoint for the in-container tool sidecar.
    pub gateway_url: Option<String>,
    /// Bearer token for the sidecar.
    pub gateway_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            pool: PoolLimits::default(),
            image: format!("{APP_NAME}-agent:latest"),
            resources: Resources::default(),
            timeouts: Timeouts::default(),
            redis: RedisConfig::default(),
            docker: DockerConfig::default(),
            gateway_url: None,
            gateway_token: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory, creating it if necessary.
    ///
    /// `SANDPOOL_CONFIG_DIR` overrides the platform default.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = env::var("SANDPOOL_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join(APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration from file with environment overrides, then
    /// validate. Missing file means defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("using default config: {e}");
            Self::default()
        });
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("SANDPOOL_REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Ok(image) = env::var("SANDPOOL_IMAGE") {
            self.image = image;
        }
        if let Ok(v) = env::var("SANDPOOL_MIN_WARM") {
            if let Ok(n) = v.parse() {
                self.pool.min_warm = n;
            }
        }
        if let Ok(v) = env::var("SANDPOOL_MAX_TOTAL") {
            if let Ok(n) = v.parse() {
                self.pool.max_total = n;
            }
        }
        if let Ok(v) = env::var("SANDPOOL_MAX_PER_AGENT") {
            if let Ok(n) = v.parse() {
                self.pool.max_per_agent = n;
            }
        }
        if let Ok(v) = env::var("SANDPOOL_GATEWAY_URL") {
            self.gateway_url = Some(v);
        }
        if let Ok(v) = env::var("SANDPOOL_GATEWAY_TOKEN") {
            self.gateway_token = Some(v);
        }
    }

    /// Enforce the cap and timeout floors. Violations are configuration
    /// errors; nothing downstream re-validates.
    pub fn validate(&self) -> Result<()> {
        if self.pool.min_warm > self.pool.max_total {
            bail!(
                "pool.min_warm ({}) exceeds pool.max_total ({})",
                self.pool.min_warm,
                self.pool.max_total
            );
        }
        if self.pool.max_per_agent > self.pool.max_total {
            bail!(
                "pool.max_per_agent ({}) exceeds pool.max_total ({})",
                self.pool.max_per_agent,
                self.pool.max_total
            );
        }
        if self.resources.pids_limit < 10 {
            bail!(
                "resources.pids_limit ({}) below minimum of 10",
                self.resources.pids_limit
            );
        }
        if self.timeouts.health_interval_ms < 1000 {
            bail!(
                "timeouts.health_interval_ms ({}) below minimum of 1000",
                self.timeouts.health_interval_ms
            );
        }
        if self.timeouts.idle_ms < self.timeouts.health_interval_ms * 3 {
            bail!(
                "timeouts.idle_ms ({}) must be at least 3x health_interval_ms ({})",
                self.timeouts.idle_ms,
                self.timeouts.health_interval_ms
            );
        }
        if self.timeouts.startup_ms < 5000 {
            bail!(
                "timeouts.startup_ms ({}) below minimum of 5000",
                self.timeouts.startup_ms
            );
        }
        Ok(())
    }

    /// Persist the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.health_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.idle_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.timeouts.max_age_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.startup_ms)
    }

    /// Broker URL for host-side connections.
    pub fn redis_url(&self) -> &str {
        self.redis.url.as_deref().unwrap_or("redis://127.0.0.1:6379")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.redis.key_prefix, "sandpool:cc:");
        assert!(config.docker.container_prefix.starts_with("sandpool"));
    }

    #[test]
    fn test_min_warm_above_max_total_rejected() {
        let mut config = Config::default();
        config.pool.min_warm = 20;
        config.pool.max_total = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_agent_cap_above_total_rejected() {
        let mut config = Config::default();
        config.pool.max_per_agent = 11;
        config.pool.max_total = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pids_limit_floor() {
        let mut config = Config::default();
        config.resources.pids_limit = 9;
        assert!(config.validate().is_err());
        config.resources.pids_limit = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_idle_must_cover_three_health_intervals() {
        let mut config = Config::default();
        config.timeouts.health_interval_ms = 10_000;
        config.timeouts.idle_ms = 29_999;
        assert!(config.validate().is_err());
        config.timeouts.idle_ms = 30_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_startup_and_health_floors() {
        let mut config = Config::default();
        config.timeouts.startup_ms = 4999;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeouts.health_interval_ms = 999;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"image": "custom:1", "pool": {"max_total": 5}}"#).unwrap();
        assert_eq!(config.image, "custom:1");
        assert_eq!(config.pool.max_total, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.pool.min_warm, PoolLimits::default().min_warm);
        assert_eq!(config.resources, Resources::default());
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }
}
