// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the daemon.
//!
//! Every value has a built-in default matching common phone hardware, so the
//! daemon runs without a config file. The file only exists to override device
//! naming on unusual hardware.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "CALLAUDIOD_CONFIG_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid pattern for {field}: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("No config directory found")]
    NoConfigDir,
}

/// Rules used to pick the phone's internal card and its devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentificationConfig {
    /// A card with a bus path must start with this prefix.
    pub card_bus_path_prefix: String,
    /// A card with a form factor must have exactly this one.
    pub card_form_factor: String,
    /// Cards of this device class are modems and never selected.
    pub card_modem_class: String,
    /// Device class accepted for sinks and sources.
    pub device_class: String,
    /// `device.api` value identifying the alternate (droid) hardware variant.
    pub variant_api: String,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            card_bus_path_prefix: "platform-".to_string(),
            card_form_factor: "internal".to_string(),
            card_modem_class: "modem".to_string(),
            device_class: "sound".to_string(),
            variant_api: "droid-hal".to_string(),
        }
    }
}

/// Card profile names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Regular playback profile on standard hardware.
    pub hifi: String,
    /// Regex matched against profile names to find the voice call profile.
    pub voice_call_pattern: String,
    pub variant_hifi: String,
    pub variant_voice_call: String,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            hifi: "HiFi".to_string(),
            voice_call_pattern: "(?i)voice ?call".to_string(),
            variant_hifi: "default".to_string(),
            variant_voice_call: "voicecall".to_string(),
        }
    }
}

/// Port handling on standard hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Regex matched against sink port names to find the speaker.
    pub speaker_pattern: String,
    /// Unload the server's own jack-following module so only we switch ports.
    pub unload_port_switcher: bool,
    pub port_switcher_module: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            speaker_pattern: "Speaker".to_string(),
            unload_port_switcher: true,
            port_switcher_module: "module-switch-on-port-available".to_string(),
        }
    }
}

/// Fixed port names on the alternate hardware variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantPortsConfig {
    pub output_parking: String,
    pub output_speaker: String,
    pub output_earpiece: String,
    pub output_wired_headset: String,
    pub input_parking: String,
    pub input_builtin_mic: String,
    pub input_wired_headset: String,
}

impl Default for VariantPortsConfig {
    fn default() -> Self {
        Self {
            output_parking: "output-parking".to_string(),
            output_speaker: "output-speaker".to_string(),
            output_earpiece: "output-earpiece".to_string(),
            output_wired_headset: "output-wired_headset".to_string(),
            input_parking: "input-parking".to_string(),
            input_builtin_mic: "input-builtin_mic".to_string(),
            input_wired_headset: "input-wired_headset".to_string(),
        }
    }
}

/// Audio server session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// First reconnect delay after a connection failure.
    pub reconnect_delay_ms: u64,
    /// Upper bound for the doubling reconnect delay.
    pub max_reconnect_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms))
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub identification: IdentificationConfig,
    pub profiles: ProfilesConfig,
    pub ports: PortsConfig,
    pub variant_ports: VariantPortsConfig,
    pub session: SessionConfig,
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Configuration manager handles locating and loading the config file.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a config manager for the user's config directory.
    ///
    /// `CALLAUDIOD_CONFIG_DIR` overrides the XDG location.
    pub fn new() -> Result<Self, ConfigError> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            debug!("Config directory from {}: {:?}", CONFIG_DIR_ENV, dir);
            return Ok(Self::with_dir(dir));
        }

        let config_dir = directories::ProjectDirs::from("org", "mobian-project", "callaudiod")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;

        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    /// Create a config manager rooted at an explicit directory.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join("callaudiod.toml")
    }

    /// Load daemon configuration, falling back to defaults when no file exists.
    pub fn load_daemon_config(&self) -> Result<DaemonConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No daemon config found, using defaults");
            return Ok(DaemonConfig::default());
        }

        let config = load_from(&path)?;
        info!("Loaded daemon config from {:?}", path);
        Ok(config)
    }
}

fn load_from(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(DaemonConfig::from_toml(&content)?)
}
