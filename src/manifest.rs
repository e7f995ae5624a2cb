//! Configuration file parsing for hostprov
//!
//! Parses `hostprov.toml` configuration files using serde. Every key is
//! optional; a missing file yields the defaults.

use crate::error::{Error, Result};
use crate::hardware::KVM_DEVICE;
use crate::image::{DEFAULT_IMAGE_TOOL, IMAGE_RESIZE_TIMEOUT};
use crate::network::bridge::MAX_BRIDGE_NAME_LEN;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "hostprov.toml";

/// Load configuration from a file
pub fn load(path: &Path) -> Result<HostprovConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: HostprovConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_or_default(path: &Path) -> Result<HostprovConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(HostprovConfig::default());
    }

    load(path)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostprovConfig {
    /// Subnet allocation and bridge settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Image tool settings
    #[serde(default)]
    pub image: ImageConfig,

    /// Acceleration checks
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl HostprovConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let bridge = &self.network.bridge_name;
        if bridge.is_empty() {
            return Err(Error::ConfigValidation("network.bridge_name is empty".into()));
        }

        if bridge.len() > MAX_BRIDGE_NAME_LEN {
            return Err(Error::ConfigValidation(format!(
                "network.bridge_name '{}' is longer than {} characters",
                bridge, MAX_BRIDGE_NAME_LEN
            )));
        }

        if bridge.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::ConfigValidation(format!(
                "network.bridge_name '{}' is not a valid interface name",
                bridge
            )));
        }

        if self.image.tool.as_os_str().is_empty() {
            return Err(Error::ConfigValidation("image.tool is empty".into()));
        }

        if self.image.timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "image.timeout_secs must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostprov/network")
}

fn default_bridge_name() -> String {
    "hostprovbr0".into()
}

fn default_image_tool() -> PathBuf {
    PathBuf::from(DEFAULT_IMAGE_TOOL)
}

fn default_image_timeout() -> u64 {
    IMAGE_RESIZE_TIMEOUT.as_secs()
}

fn default_device() -> PathBuf {
    PathBuf::from(KVM_DEVICE)
}

/// `[network]` section
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Directory holding the persisted subnet
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bridge whose route reveals an existing subnet
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bridge_name: default_bridge_name(),
        }
    }
}

/// `[image]` section
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    /// Image tool binary
    #[serde(default = "default_image_tool")]
    pub tool: PathBuf,

    /// Bound on resize and convert, in seconds
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,
}

impl ImageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            tool: default_image_tool(),
            timeout_secs: default_image_timeout(),
        }
    }
}

/// `[hardware]` section
#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    /// Accelerator device
    #[serde(default = "default_device")]
    pub device: PathBuf,

    /// Where `check_kvm_support` lives (defaults to the executable's directory)
    pub helper_dir: Option<PathBuf>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            helper_dir: None,
        }
    }
}
