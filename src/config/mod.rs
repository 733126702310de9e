//! Configuration module
//!
//! Handles loading and saving ClusterSync configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{ControllerConfig, RendererConfig};
use crate::protocol::{
    Frustum, Pose, ReadOptions, CLUSTER_DAEMON_PORT, CLUSTER_SERVER_PORT,
    CONTROLLER_PACKET_START, RENDERER_PACKET_START,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Frame synchronization settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Renderers driven by the controller
    #[serde(default)]
    pub renderers: Vec<RendererEntry>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Control-channel port renderers listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port of the renderer launch daemon
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    CLUSTER_SERVER_PORT
}

fn default_daemon_port() -> u16 {
    CLUSTER_DAEMON_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            daemon_port: default_daemon_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Frame synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run the swap barrier every frame
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sleep between availability checks in blocking reads (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Give up a blocking read after this long (ms)
    pub read_timeout_ms: Option<u64>,
    /// Target frames per second
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Degrees of heading the demo camera turns per frame
    #[serde(default = "default_heading_step")]
    pub heading_step: f32,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    2
}

fn default_frame_rate() -> u32 {
    60
}

fn default_heading_step() -> f32 {
    0.5
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_ms: default_poll_interval(),
            read_timeout_ms: None,
            frame_rate: default_frame_rate(),
            heading_step: default_heading_step(),
        }
    }
}

impl SyncConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    pub fn read_options(&self) -> ReadOptions {
        let options =
            ReadOptions::default().with_poll_interval(Duration::from_millis(self.poll_interval_ms));
        match self.read_timeout_ms {
            Some(ms) => options.with_timeout(Duration::from_millis(ms)),
            None => options,
        }
    }
}

/// One renderer in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererEntry {
    pub name: String,
    /// Host name or address
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Offset of this display from the shared camera
    #[serde(default)]
    pub offset: Pose,
    /// Lens override for this display
    pub frustum: Option<Frustum>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("clustersync/config.toml")),
            Some(PathBuf::from("./clustersync.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the frame loops cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sync.frame_rate == 0 {
            return Err(ConfigError::Invalid("sync.frame_rate", "must be > 0".to_string()));
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.poll_interval_ms",
                "must be > 0".to_string(),
            ));
        }
        for entry in &self.renderers {
            if entry.host.is_empty() {
                return Err(ConfigError::Invalid(
                    "renderers.host",
                    format!("renderer '{}' has no host", entry.name),
                ));
            }
        }
        Ok(())
    }

    /// Renderer settings derived from this configuration
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            bind_address: self.network.bind_address.clone(),
            port: self.network.port,
            sync: self.sync.enabled,
            read: self.sync.read_options(),
            frame_interval: self.sync.frame_interval(),
            packet_start: RENDERER_PACKET_START,
        }
    }

    /// Controller settings derived from this configuration
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            sync: self.sync.enabled,
            read: self.sync.read_options(),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            packet_start: CONTROLLER_PACKET_START,
            frame_interval: self.sync.frame_interval(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "cluster-controller".to_string(),
            verbose: false,
        },
        renderers: vec![
            RendererEntry {
                name: "left".to_string(),
                host: "render-left.local".to_string(),
                port: CLUSTER_SERVER_PORT,
                offset: Pose::new([0.0, 0.0, 0.0], [30.0, 0.0, 0.0]),
                frustum: None,
            },
            RendererEntry {
                name: "right".to_string(),
                host: "render-right.local".to_string(),
                port: CLUSTER_SERVER_PORT,
                offset: Pose::new([0.0, 0.0, 0.0], [-30.0, 0.0, 0.0]),
                frustum: Some(Frustum::new(1.0, [1.6, 0.9], [0.0, 0.0])),
            },
        ],
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, CLUSTER_SERVER_PORT);
        assert_eq!(config.network.daemon_port, CLUSTER_DAEMON_PORT);
        assert_eq!(config.sync.read_options().poll_interval, Duration::from_millis(2));
        assert!(config.sync.read_options().timeout.is_none());
        assert!(config.renderers.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.sync.read_timeout_ms = Some(250);
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(
            loaded.sync.read_options().timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "cluster-controller");
        assert_eq!(parsed.renderers.len(), 2);
        assert_eq!(parsed.renderers[0].offset.hpr, [30.0, 0.0, 0.0]);
        assert!(parsed.renderers[1].frustum.is_some());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sync]
enabled = false

[[renderers]]
name = "wall"
host = "10.0.0.5"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(!config.sync.enabled);
        assert_eq!(config.sync.frame_rate, 60);
        assert_eq!(config.renderers[0].port, CLUSTER_SERVER_PORT);
        assert_eq!(config.renderers[0].offset, Pose::default());

        let renderer = config.renderer_config();
        assert!(!renderer.sync);
        assert_eq!(renderer.packet_start, RENDERER_PACKET_START);
        assert_eq!(config.controller_config().connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_frame_rate() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nframe_rate = 0").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid("sync.frame_rate", _))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/clustersync.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
