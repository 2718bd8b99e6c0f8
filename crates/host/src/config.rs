//! Host configuration management

use crate::dispatcher::DEFAULT_MAX_TRANSFER_SIZE;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns a caller may see (e.g. "0x1234:0x5678", "0xabcd:*").
    /// Empty means every device.
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    /// Hide Linux root hubs (VID 0x1d6b, class 9)
    #[serde(default = "UsbSettings::default_hide_root_hubs")]
    pub hide_root_hubs: bool,
    /// Per-transfer timeout ("5s", "1m30s"); absent waits indefinitely
    #[serde(
        default,
        with = "duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub transfer_timeout: Option<Duration>,
    /// Largest read length or write buffer accepted per call, in bytes
    #[serde(default = "UsbSettings::default_max_transfer_size")]
    pub max_transfer_size: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            allowed_devices: Vec::new(),
            hide_root_hubs: Self::default_hide_root_hubs(),
            transfer_timeout: None,
            max_transfer_size: Self::default_max_transfer_size(),
        }
    }
}

impl UsbSettings {
    fn default_hide_root_hubs() -> bool {
        true
    }

    fn default_max_transfer_size() -> usize {
        DEFAULT_MAX_TRANSFER_SIZE
    }
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => format_duration(*d).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    /// Parse a duration string like "5s", "30m", "1h30m"; a bare number is seconds
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_secs: u64 = 0;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let factor = match c {
                'h' => 3600,
                'm' => 60,
                's' => 1,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_secs = num
                .checked_mul(factor)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_secs = total_secs
                .checked_add(num)
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        if total_secs == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_secs(total_secs))
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

impl HostConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = [
                Self::default_path(),
                PathBuf::from("/etc/wasi-usb-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("wasi-usb-host").join("host.toml")
        } else {
            PathBuf::from(".config/wasi-usb-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        for pattern in &self.usb.allowed_devices {
            Self::validate_device_pattern(pattern)?;
        }

        if self.usb.max_transfer_size == 0 {
            return Err(anyhow!("max_transfer_size must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a device pattern (VID:PID)
    fn validate_device_pattern(pattern: &str) -> Result<()> {
        let Some((vid, pid)) = pattern.split_once(':') else {
            return Err(anyhow!(
                "Invalid device pattern '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                pattern
            ));
        };

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name,
                    id
                )
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert!(config.usb.allowed_devices.is_empty());
        assert!(config.usb.hide_root_hubs);
        assert!(config.usb.transfer_timeout.is_none());
        assert_eq!(config.usb.max_transfer_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_validate_device_pattern_valid() {
        assert!(HostConfig::validate_device_pattern("0x1234:0x5678").is_ok());
        assert!(HostConfig::validate_device_pattern("0x1234:*").is_ok());
        assert!(HostConfig::validate_device_pattern("*:0x5678").is_ok());
        assert!(HostConfig::validate_device_pattern("*:*").is_ok());
        assert!(HostConfig::validate_device_pattern("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_device_pattern_invalid() {
        assert!(HostConfig::validate_device_pattern("1234:5678").is_err());
        assert!(HostConfig::validate_device_pattern("0x1234").is_err());
        assert!(HostConfig::validate_device_pattern("0x1234:0x5678:0x9abc").is_err());
        assert!(HostConfig::validate_device_pattern("0xGHIJ:0x5678").is_err());
        assert!(HostConfig::validate_device_pattern("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HostConfig::default();
        assert!(config.validate().is_ok());

        config.host.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.host.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_transfer_size() {
        let mut config = HostConfig::default();
        config.usb.max_transfer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        use duration_serde::parse_duration;
        assert!(parse_duration("99999999999999999h").is_err());
        assert!(parse_duration("18446744073709551615s1s").is_err());
        assert!(parse_duration("5124095576030432h").is_err());
        assert_eq!(
            parse_duration("18446744073709551615"),
            Ok(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn test_format_duration() {
        use duration_serde::format_duration;
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[host]
log_level = "debug"

[usb]
allowed_devices = ["0x1234:0x5678", "0xabcd:*"]
hide_root_hubs = false
transfer_timeout = "5s"
max_transfer_size = 65536
"#;
        let config: HostConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.host.log_level, "debug");
        assert_eq!(config.usb.allowed_devices.len(), 2);
        assert!(!config.usb.hide_root_hubs);
        assert_eq!(config.usb.transfer_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.usb.max_transfer_size, 65536);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config.host.log_level, "info");
        assert!(config.usb.hide_root_hubs);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("host.toml");

        let mut config = HostConfig::default();
        config.usb.allowed_devices = vec!["0x1234:*".to_string()];
        config.usb.transfer_timeout = Some(Duration::from_secs(90));
        config.save(&path).unwrap();

        let loaded = HostConfig::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.usb.allowed_devices, config.usb.allowed_devices);
        assert_eq!(loaded.usb.transfer_timeout, Some(Duration::from_secs(90)));

        let via_str = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(via_str.host.log_level, "info");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host.toml");
        fs::write(&path, "[usb]\nallowed_devices = [\"1234:5678\"]\n").unwrap();
        assert!(HostConfig::load(Some(path)).is_err());
    }
}
