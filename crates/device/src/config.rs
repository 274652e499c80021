//! Device configuration management

use anyhow::{Context, Result, anyhow};
use protocol::MAX_DEVICE_ADDRESS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device: DeviceSettings,
    #[serde(default)]
    pub enumeration: EnumerationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Socket path the device listens on (`~` is expanded)
    pub socket_path: String,
    /// Bound on one request/reply round trip, in milliseconds
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumerationSettings {
    /// Enumerate the device whenever a peer attaches
    #[serde(default = "default_probe_on_attach")]
    pub probe_on_attach: bool,
    /// Bus address assigned by the probe
    #[serde(default = "default_address")]
    pub address: u8,
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_probe_on_attach() -> bool {
    true
}

fn default_address() -> u8 {
    1
}

impl Default for EnumerationSettings {
    fn default() -> Self {
        Self {
            probe_on_attach: default_probe_on_attach(),
            address: default_address(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings {
                socket_path: "/tmp/usb-socket.sock".to_string(),
                reply_timeout_ms: default_reply_timeout_ms(),
                log_level: default_log_level(),
            },
            enumeration: EnumerationSettings::default(),
        }
    }
}

impl DeviceConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-socket/device.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DeviceConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: socket={}, reply_timeout={}ms, probe_on_attach={}",
            config.device.socket_path,
            config.device.reply_timeout_ms,
            config.enumeration.probe_on_attach
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {:#}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-socket").join("device.toml")
        } else {
            PathBuf::from(".config/usb-socket/device.toml")
        }
    }

    /// Socket path with `~` expanded
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.device.socket_path).as_ref())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.device.reply_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.device.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.device.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.device.socket_path.trim().is_empty() {
            return Err(anyhow!("socket_path must not be empty"));
        }

        if self.device.reply_timeout_ms == 0 {
            return Err(anyhow!("reply_timeout_ms must be greater than zero"));
        }

        if !(1..=MAX_DEVICE_ADDRESS).contains(&self.enumeration.address) {
            return Err(anyhow!(
                "Invalid enumeration address {}, must be 1..={}",
                self.enumeration.address,
                MAX_DEVICE_ADDRESS
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.device.log_level, "info");
        assert_eq!(config.reply_timeout(), Duration::from_secs(1));
        assert!(config.enumeration.probe_on_attach);
        assert_eq!(config.enumeration.address, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_file_fills_defaults() {
        let config: DeviceConfig = toml::from_str(
            r#"
            [device]
            socket_path = "/run/usb/dev.sock"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.reply_timeout_ms, 1000);
        assert_eq!(config.device.log_level, "info");
        assert!(config.enumeration.probe_on_attach);
        assert_eq!(config.socket_path(), PathBuf::from("/run/usb/dev.sock"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DeviceConfig::default();
        config.device.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.device.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_bad_address() {
        let mut config = DeviceConfig::default();
        config.device.reply_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DeviceConfig::default();
        config.enumeration.address = 0;
        assert!(config.validate().is_err());
        config.enumeration.address = 128;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_socket_path() {
        let mut config = DeviceConfig::default();
        config.device.socket_path = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let mut config = DeviceConfig::default();
        config.device.socket_path = "~/dev.sock".to_string();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.socket_path(), home.join("dev.sock"));
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("device.toml");
        let mut config = DeviceConfig::default();
        config.device.reply_timeout_ms = 250;
        config.enumeration.probe_on_attach = false;

        config.save(&path).unwrap();
        let loaded = DeviceConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.reply_timeout_ms, 250);
        assert!(!loaded.enumeration.probe_on_attach);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        fs::write(&path, "[device]\nsocket_path = \"/tmp/a.sock\"\nlog_level = \"loud\"\n")
            .unwrap();
        assert!(DeviceConfig::load(Some(path)).is_err());
    }
}
