//! Configuration for the Qaryx appliance core
//!
//! Loads configuration from a TOML file. Lookup order: an explicit path
//! (`--config`), `$QARYX_CONFIG`, `/etc/qaryx/config.toml`, then
//! `~/.config/qaryx/config.toml`. Every key is optional; missing keys keep
//! their defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// System-wide config location on the appliance image
const SYSTEM_CONFIG: &str = "/etc/qaryx/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub display: DisplayConfig,
    pub resolver: ResolverConfig,
    pub event_loop: EventLoopConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from the first file found, or use defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::locate(explicit) else {
            info!("No config file found, using defaults");
            return Ok(Self::default());
        };

        let config = Self::from_file(&path)?;
        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Parse a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let mut candidates = Vec::new();
        if let Ok(env_path) = std::env::var("QARYX_CONFIG") {
            candidates.push(PathBuf::from(env_path));
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG));
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("qaryx").join("config.toml"));
        }

        candidates.into_iter().find(|p| p.exists())
    }
}

/// Remote-control listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port, bound dual-stack with IPv4 fallback
    pub port: u16,
    /// Simultaneous connections; extra accepts are closed immediately
    pub max_clients: usize,
    pub listen_backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_clients: 8,
            listen_backlog: 8,
        }
    }
}

/// Scan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Set to false to force headless mode
    pub enabled: bool,
    /// DRM card node
    pub device: PathBuf,
    pub preferred_width: u16,
    pub preferred_height: u16,
    pub preferred_refresh: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: PathBuf::from("/dev/dri/card0"),
            preferred_width: 1920,
            preferred_height: 1080,
            preferred_refresh: 60,
        }
    }
}

/// External URL resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Helper executable
    pub executable: PathBuf,
    /// Optional proxy passed to the helper
    pub proxy: Option<String>,
    /// Maximum video height handed to the format selector
    pub quality: String,
    /// Concurrent helper processes
    pub max_pending: usize,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    /// Kill a helper after this many seconds; 0 waits forever
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/usr/local/bin/yt-dlp"),
            proxy: None,
            quality: "1080".to_string(),
            max_pending: 8,
            cache_capacity: 50,
            cache_ttl_secs: 4 * 3600,
            timeout_secs: 30,
        }
    }
}

impl ResolverConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Proxy with empty strings treated as unset
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref().filter(|p| !p.is_empty())
    }
}

/// Dispatcher pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Upper bound on a single poll wait
    pub poll_timeout_ms: u64,
    /// Fixed-rate timer period (~30 fps)
    pub frame_interval_ms: u64,
    /// Broadcast status every N timer ticks
    pub status_every_ticks: u32,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 50,
            frame_interval_ms: 33,
            status_every_ticks: 15,
        }
    }
}

impl EventLoopConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

/// Decode engine defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial volume, 0-100
    pub volume: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { volume: 80 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_keys_keep_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [resolver]
            proxy = "http://127.0.0.1:10809"
            timeout_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_clients, 8);
        assert_eq!(config.resolver.proxy(), Some("http://127.0.0.1:10809"));
        assert_eq!(config.resolver.timeout(), None);
        assert_eq!(config.resolver.cache_capacity, 50);
        assert_eq!(config.event_loop, EventLoopConfig::default());
    }

    #[test]
    fn test_empty_proxy_is_unset() {
        let resolver = ResolverConfig { proxy: Some(String::new()), ..Default::default() };
        assert_eq!(resolver.proxy(), None);
    }

    #[test]
    fn test_explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[event_loop]\nstatus_every_ticks = 3").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.event_loop.status_every_ticks, 3);
        assert_eq!(config.display, DisplayConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();

        assert!(Config::load(Some(file.path())).is_err());
    }
}
