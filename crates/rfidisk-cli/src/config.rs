//! Configuration file management for rfidisk.
//!
//! Provides a TOML-based config file at `~/.config/rfidisk/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use rfidisk_core::{ControllerConfig, LinkConfig, SupervisorConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub device: DeviceSection,
    pub behavior: BehaviorSection,
    pub supervisor: SupervisorSection,
    pub tags: TagsSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Serial device node of the reader.
    pub path: PathBuf,
    pub baud_rate: u32,
    /// Wait after opening the port, in milliseconds.
    pub settle_ms: u64,
    /// Reconnect after this many seconds of silence. 0 disables the check.
    pub liveness_timeout_secs: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/rfidisk"),
            baud_rate: 9600,
            settle_ms: 2000,
            liveness_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorSection {
    /// Seconds between tag removal and termination.
    pub removal_delay_secs: f64,
    pub desktop_notifications: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_icon: Option<PathBuf>,
}

impl Default for BehaviorSection {
    fn default() -> Self {
        Self {
            removal_delay_secs: 0.0,
            desktop_notifications: true,
            notification_icon: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub grace_period_secs: u64,
    pub terminate_command_wait_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            grace_period_secs: 2,
            terminate_command_wait_secs: 2,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TagsSection {
    /// Tag store location. Relative paths are taken from the config file's
    /// directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the rfidisk config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/rfidisk` or `~/.config/rfidisk`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("rfidisk");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("rfidisk")
}

/// Return the path to the rfidisk config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct RfidiskConfig {
    pub config_path: PathBuf,
    pub link: LinkConfig,
    pub controller: ControllerConfig,
    pub supervisor: SupervisorConfig,
    pub tags_path: PathBuf,
    pub desktop_notifications: bool,
    pub notification_icon: Option<PathBuf>,
}

impl RfidiskConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Device: `cli_device` > `RFIDISK_DEVICE` env > `device.path` > `/dev/rfidisk`
    /// - Tag store: `RFIDISK_TAGS` env > `tags.path` > `<config dir>/tags.json`
    /// - Removal delay: `cli_removal_delay` > `behavior.removal_delay_secs` > 0
    ///
    /// A missing default config file means defaults. A missing file named by
    /// `config_override`, a malformed file or an invalid value is an error.
    pub fn resolve(
        config_override: Option<&Path>,
        cli_device: Option<&Path>,
        cli_removal_delay: Option<f64>,
    ) -> Result<Self> {
        let config_path = config_override
            .map(Path::to_path_buf)
            .unwrap_or_else(config_path);
        let file = if config_override.is_some() || config_path.exists() {
            load_config(&config_path)?
        } else {
            ConfigFile::default()
        };

        // Device path resolution.
        let device_path = if let Some(path) = cli_device {
            path.to_path_buf()
        } else if let Some(path) = env_path("RFIDISK_DEVICE") {
            path
        } else {
            file.device.path.clone()
        };

        if file.device.baud_rate == 0 {
            bail!("device.baud_rate must be greater than zero");
        }

        // Tag store resolution.
        let config_parent = config_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let tags_path = if let Some(path) = env_path("RFIDISK_TAGS") {
            path
        } else if let Some(ref path) = file.tags.path {
            config_parent.join(path)
        } else {
            config_parent.join("tags.json")
        };

        let removal_delay = cli_removal_delay.unwrap_or(file.behavior.removal_delay_secs);
        let removal_delay = seconds("removal delay", removal_delay)?;

        let link = LinkConfig {
            device_path,
            baud_rate: file.device.baud_rate,
            settle: Duration::from_millis(file.device.settle_ms),
            liveness_timeout: match file.device.liveness_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..LinkConfig::default()
        };
        let controller = ControllerConfig {
            removal_delay,
            ..ControllerConfig::default()
        };
        let supervisor = SupervisorConfig {
            grace_period: Duration::from_secs(file.supervisor.grace_period_secs),
            terminate_command_wait: Duration::from_secs(file.supervisor.terminate_command_wait_secs),
            ..SupervisorConfig::default()
        };

        Ok(Self {
            config_path,
            link,
            controller,
            supervisor,
            tags_path,
            desktop_notifications: file.behavior.desktop_notifications,
            notification_icon: file.behavior.notification_icon,
        })
    }
}

/// A non-empty environment variable as a path.
fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn seconds(what: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        bail!("{what} must be a non-negative number of seconds, got {secs}");
    }
    Duration::try_from_secs_f64(secs).with_context(|| format!("{what} out of range: {secs}"))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
