//! Integration tests for host configuration
//!
//! - Parsing complete and minimal TOML files
//! - Validation failures
//! - Building a host from the parsed settings

use common::DeviceKey;
use host::backend::fake::{FakeBackend, sample_device};
use host::{HostConfig, UsbHost, load_config};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[host]
log_level = "debug"

[usb]
allowed_devices = ["0x1234:0x5678", "0xabcd:*"]
hide_root_hubs = false
transfer_timeout = "1m30s"
max_transfer_size = 65536
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("host.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.host.log_level, "debug");
    assert_eq!(
        config.usb.allowed_devices,
        vec!["0x1234:0x5678".to_string(), "0xabcd:*".to_string()]
    );
    assert!(!config.usb.hide_root_hubs);
    assert_eq!(config.usb.transfer_timeout, Some(Duration::from_secs(90)));
    assert_eq!(config.usb.max_transfer_size, 65536);
}

#[test]
fn test_empty_config_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    let config = HostConfig::load(Some(path)).unwrap();
    let defaults = HostConfig::default();
    assert_eq!(config.host.log_level, defaults.host.log_level);
    assert!(config.usb.allowed_devices.is_empty());
    assert!(config.usb.hide_root_hubs);
    assert_eq!(config.usb.transfer_timeout, None);
    assert_eq!(config.usb.max_transfer_size, defaults.usb.max_transfer_size);
}

#[test]
fn test_invalid_configs_rejected() {
    let dir = TempDir::new().unwrap();
    let cases = [
        "[host]\nlog_level = \"loud\"\n",
        "[usb]\nallowed_devices = [\"1234:5678\"]\n",
        "[usb]\nallowed_devices = [\"0x12345:*\"]\n",
        "[usb]\nmax_transfer_size = 0\n",
        "[usb]\ntransfer_timeout = \"soon\"\n",
    ];

    for case in cases {
        let path = write_config(&dir, case);
        assert!(
            HostConfig::load(Some(path)).is_err(),
            "accepted invalid config: {}",
            case
        );
    }
}

#[test]
fn test_load_config_missing_file() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(load_config(missing.to_str().unwrap()).is_err());
}

#[test]
fn test_settings_drive_host() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);
    let config = HostConfig::load(Some(path)).unwrap();

    let backend = FakeBackend::new();
    backend.add_device(sample_device(DeviceKey::new(1, 2)));
    let mut hidden = sample_device(DeviceKey::new(1, 3));
    hidden.descriptor.product_id = 0x9999;
    backend.add_device(hidden);

    let host = UsbHost::new(backend, &config.usb).unwrap();
    let devices = host.enumerate().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(host.device_descriptor(devices[0]).unwrap().product_id, 0x5678);
}
