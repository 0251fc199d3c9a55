//! Configuration module with TOML parsing and reload support
//!
//! All configuration values are externalized - no hardcoded ports, paths, or addresses.
//! The control plane's own settings live here; the routing intent it manages lives in
//! the entity store.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::addr::parse_cidr;

/// Current config schema version supported by this binary
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// Main control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Config schema version (warn if absent, error if > CURRENT_CONFIG_VERSION)
    pub version: Option<u32>,
    /// Admin API configuration
    pub admin: AdminConfig,
    /// Proxy engine administrative endpoint
    pub engine: EngineConfig,
    /// Entity store settings
    pub store: StoreConfig,
    /// Declared-state backups
    pub backup: BackupConfig,
    /// Country resolution for geo_whitelist policies
    pub geo: GeoConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            version: Some(CURRENT_CONFIG_VERSION),
            admin: AdminConfig::default(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            backup: BackupConfig::default(),
            geo: GeoConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API
    pub enabled: bool,
    /// Admin API bind address
    pub bind_address: String,
    /// Admin API port
    pub port: u16,
    /// Bearer token required on every request (None = no token check)
    pub auth_token: Option<String>,
    /// Allowed client addresses or CIDR ranges (empty = any)
    pub allowed_ips: Vec<String>,
    /// Refuse to start if the admin bind address is not loopback.
    /// Admin traffic is plain HTTP; a non-loopback bind sends tokens in cleartext.
    pub require_loopback: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 8090,
            auth_token: None,
            allowed_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
            require_loopback: true,
        }
    }
}

impl AdminConfig {
    /// Get the full socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

/// Proxy engine administrative endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the engine's admin API
    pub admin_url: String,
    /// Path that accepts a full configuration document
    pub load_path: String,
    /// Upper bound for one load call (milliseconds)
    pub timeout_ms: u64,
    /// Apply attempts per mutation before compensating (>= 1)
    pub apply_attempts: u32,
    /// Delay between apply attempts (milliseconds)
    pub retry_delay_ms: u64,
    /// Apply the current declared state once at startup
    pub reconcile_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_url: "http://127.0.0.1:2019".to_string(),
            load_path: "/load".to_string(),
            timeout_ms: 10_000,
            apply_attempts: 1,
            retry_delay_ms: 500,
            reconcile_on_start: true,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Full URL of the load endpoint
    pub fn load_url(&self) -> String {
        format!(
            "{}/{}",
            self.admin_url.trim_end_matches('/'),
            self.load_path.trim_start_matches('/')
        )
    }
}

/// Entity store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding declared state. Loaded at startup and rewritten after
    /// every committed mutation. None keeps state in memory only.
    pub state_path: Option<PathBuf>,
}

/// Declared-state backups
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory for backup files (created if missing)
    pub dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/pqcrypta-control/backups"),
        }
    }
}

/// Country resolution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// MaxMind database path (requires the `geoip` feature)
    pub geoip_db_path: Option<PathBuf>,
    /// Fixed CIDR to country table, consulted when no database is loaded
    pub static_ranges: Vec<StaticGeoRange>,
}

/// One row of the static geo table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticGeoRange {
    pub cidr: String,
    pub country: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: json or text
    pub format: String,
    /// Audit log file path (None = write to stderr)
    pub audit_log_path: Option<PathBuf>,
    /// Enable structured audit logging
    pub audit_log_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            audit_log_path: None,
            audit_log_enabled: true,
        }
    }
}

/// Global configuration container with reload support
pub struct ConfigManager {
    /// Current active configuration (atomic swap for reload)
    config: ArcSwap<ControlConfig>,
    /// Configuration file path
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager and load initial config
    pub fn new(config_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config(&config_path)?;
        info!("Configuration loaded from {:?}", config_path);

        Ok(Self {
            config: ArcSwap::new(Arc::new(config)),
            config_path,
        })
    }

    /// Load configuration from TOML file
    fn load_config(path: &Path) -> anyhow::Result<ControlConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: ControlConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        config.validate()?;

        Ok(config)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<ControlConfig> {
        self.config.load_full()
    }

    /// Replace the active configuration (CLI overrides)
    pub fn store(&self, config: ControlConfig) -> anyhow::Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Re-read the configuration file. The previous config stays active on failure.
    pub fn reload(&self) -> anyhow::Result<()> {
        match Self::load_config(&self.config_path) {
            Ok(new_config) => {
                self.config.store(Arc::new(new_config));
                info!("Configuration reloaded successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload configuration: {}", e);
                Err(e)
            }
        }
    }
}

impl ControlConfig {
    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.version {
            None => {
                warn!(
                    "Config missing 'version' field, assuming v{}",
                    CURRENT_CONFIG_VERSION
                );
            }
            Some(v) if v > CURRENT_CONFIG_VERSION => {
                return Err(anyhow::anyhow!(
                    "Config version {} is newer than this binary supports (max {}). \
                     Please upgrade pqcrypta-control.",
                    v,
                    CURRENT_CONFIG_VERSION
                ));
            }
            Some(_) => {}
        }

        if self.admin.enabled {
            let addr = self.admin.socket_addr().map_err(|e| {
                anyhow::anyhow!(
                    "admin.bind_address '{}' is not a valid address: {}",
                    self.admin.bind_address,
                    e
                )
            })?;
            if self.admin.require_loopback && !addr.ip().is_loopback() {
                return Err(anyhow::anyhow!(
                    "admin.bind_address {} is not loopback and admin.require_loopback = true. \
                     Bind to 127.0.0.1/::1 or set require_loopback = false behind a TLS tunnel.",
                    addr.ip()
                ));
            }
            for entry in &self.admin.allowed_ips {
                parse_cidr(entry).map_err(|e| anyhow::anyhow!("admin.allowed_ips: {}", e))?;
            }
            if self.admin.auth_token.as_deref().is_some_and(|t| t.len() < 16) {
                warn!("admin.auth_token is shorter than 16 characters");
            }
        }

        let url = reqwest::Url::parse(&self.engine.admin_url).map_err(|e| {
            anyhow::anyhow!("engine.admin_url '{}' is invalid: {}", self.engine.admin_url, e)
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "engine.admin_url must use http or https, got '{}'",
                url.scheme()
            ));
        }
        if self.engine.timeout_ms == 0 {
            return Err(anyhow::anyhow!("engine.timeout_ms must be greater than 0"));
        }
        if self.engine.apply_attempts == 0 {
            return Err(anyhow::anyhow!("engine.apply_attempts must be at least 1"));
        }

        for range in &self.geo.static_ranges {
            parse_cidr(&range.cidr)
                .map_err(|e| anyhow::anyhow!("geo.static_ranges: {}", e))?;
            let code = range.country.trim();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(anyhow::anyhow!(
                    "geo.static_ranges: '{}' is not an ISO 3166-1 alpha-2 code",
                    range.country
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "text") {
            return Err(anyhow::anyhow!(
                "logging.format must be \"json\" or \"text\", got \"{}\"",
                self.logging.format
            ));
        }

        Ok(())
    }
}
