//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TRELLIS_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use trellis_auth::ApiUser;
use trellis_core::ReaperConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Credential configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session lifecycle configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Tenants served by this gateway, keyed by vhost.
    #[serde(default)]
    pub vhosts: HashMap<String, VhostConfig>,

    /// Users allowed to authenticate, keyed by username.
    #[serde(default)]
    pub users: HashMap<String, ApiUser>,
}

/// Credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC signing secret for session tokens.
    #[serde(default = "default_auth_secret")]
    pub secret: String,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,

    /// Window before expiry in which a refresh is pushed, in seconds.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: i64,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout for any session, in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Idle timeout for sessions that never authenticated, in seconds.
    #[serde(default = "default_anonymous_timeout")]
    pub anonymous_timeout_secs: u64,

    /// Reaper sweep cadence in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Bound on concurrent dispatch units per session.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// One tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhostConfig {
    /// Directory holding the tenant's static assets and pagelets.
    pub webroot: String,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TRELLIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TRELLIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_auth_secret() -> String {
    std::env::var("TRELLIS_AUTH_SECRET").unwrap_or_else(|_| "insecure-dev-secret".to_string())
}

fn default_token_ttl() -> i64 {
    3600
}

fn default_refresh_window() -> i64 {
    900
}

fn default_session_timeout() -> u64 {
    600
}

fn default_anonymous_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    trellis_core::DEFAULT_MAX_IN_FLIGHT
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            metrics: MetricsConfig::default(),
            vhosts: HashMap::new(),
            users: HashMap::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_auth_secret(),
            token_ttl_secs: default_token_ttl(),
            refresh_window_secs: default_refresh_window(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            anonymous_timeout_secs: default_anonymous_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "trellis.toml",
            "/etc/trellis/trellis.toml",
            "~/.config/trellis/trellis.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured host and port do not form a valid
    /// socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Tenant web roots with `~` expanded, keyed by lowercased vhost.
    #[must_use]
    pub fn webroots(&self) -> HashMap<String, PathBuf> {
        self.vhosts
            .iter()
            .map(|(vhost, tenant)| {
                let expanded = shellexpand::tilde(&tenant.webroot);
                (vhost.to_lowercase(), PathBuf::from(expanded.as_ref()))
            })
            .collect()
    }

    /// Reaper timings derived from the session section.
    #[must_use]
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            sweep_interval: Duration::from_secs(self.session.sweep_interval_secs),
            authenticated_timeout: Duration::from_secs(self.session.timeout_secs),
            anonymous_timeout: Duration::from_secs(self.session.anonymous_timeout_secs),
        }
    }
}
