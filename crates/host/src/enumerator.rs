//! Device enumeration, access control and filtering
//!
//! Each enumeration re-queries the backend; nothing is cached between calls.
//! Devices the access policy rejects are dropped before they can be
//! registered, so they are invisible to the caller.

use crate::backend::{DiscoveredDevice, UsbBackend};
use protocol::{DeviceDescriptor, Filter, Result, UsbError};
use tracing::{debug, warn};

/// Linux Foundation vendor ID used by root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
/// bDeviceClass of a hub
const HUB_CLASS: u8 = 0x09;

/// Decides which attached devices a caller may see
pub trait AccessControl: Send + Sync {
    fn permits(&self, device: &DiscoveredDevice) -> bool;
}

/// Access control that lets every device through
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn permits(&self, _device: &DiscoveredDevice) -> bool {
        true
    }
}

/// VID:PID allow-list with optional root hub hiding
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: Vec<DevicePattern>,
    hide_root_hubs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DevicePattern {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl DevicePattern {
    fn parse(pattern: &str) -> common::Result<Self> {
        let (vid, pid) = pattern.split_once(':').ok_or_else(|| {
            common::Error::Config(format!(
                "Invalid device pattern '{}': expected format 'VID:PID'",
                pattern
            ))
        })?;

        Ok(Self {
            vendor_id: parse_id(vid, pattern)?,
            product_id: parse_id(pid, pattern)?,
        })
    }

    fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
    }
}

fn parse_id(id: &str, pattern: &str) -> common::Result<Option<u16>> {
    if id == "*" {
        return Ok(None);
    }
    let hex = id.strip_prefix("0x").unwrap_or(id);
    u16::from_str_radix(hex, 16).map(Some).map_err(|_| {
        common::Error::Config(format!(
            "Invalid device pattern '{}': '{}' is not a 16-bit hex ID",
            pattern, id
        ))
    })
}

impl AccessPolicy {
    /// Build a policy from `"0xVID:0xPID"` / `"0xVID:*"` patterns
    ///
    /// An empty pattern list allows every device.
    pub fn from_patterns(patterns: &[String], hide_root_hubs: bool) -> common::Result<Self> {
        let allowed = patterns
            .iter()
            .map(|pattern| DevicePattern::parse(pattern))
            .collect::<common::Result<Vec<_>>>()?;

        Ok(Self {
            allowed,
            hide_root_hubs,
        })
    }

    /// Check a VID/PID pair against the allow-list
    pub fn allows(&self, vendor_id: u16, product_id: u16) -> bool {
        self.allowed.is_empty()
            || self
                .allowed
                .iter()
                .any(|pattern| pattern.matches(vendor_id, product_id))
    }
}

impl AccessControl for AccessPolicy {
    fn permits(&self, device: &DiscoveredDevice) -> bool {
        let descriptor = &device.descriptor;
        if self.hide_root_hubs && is_root_hub(descriptor) {
            debug!("Skipping root hub {}", device.key);
            return false;
        }
        self.allows(descriptor.vendor_id, descriptor.product_id)
    }
}

pub fn is_root_hub(descriptor: &DeviceDescriptor) -> bool {
    descriptor.vendor_id == ROOT_HUB_VENDOR_ID && descriptor.device_class == HUB_CLASS
}

/// True if every constrained field of `filter` matches the device
pub fn matches_filter(filter: &Filter, descriptor: &DeviceDescriptor) -> bool {
    filter.vendor_id.is_none_or(|vid| vid == descriptor.vendor_id)
        && filter.product_id.is_none_or(|pid| pid == descriptor.product_id)
        && filter
            .class_code
            .is_none_or(|class| class == descriptor.device_class)
        && filter
            .subclass_code
            .is_none_or(|subclass| subclass == descriptor.device_subclass)
        && filter
            .protocol_code
            .is_none_or(|protocol| protocol == descriptor.device_protocol)
        && filter
            .serial_number
            .as_ref()
            .is_none_or(|serial| descriptor.serial_number.as_ref() == Some(serial))
}

/// Attached devices the access control permits
pub fn discover(
    backend: &dyn UsbBackend,
    access: &dyn AccessControl,
) -> Result<Vec<DiscoveredDevice>> {
    let devices = backend.list_devices().map_err(|e| {
        warn!("Failed to list USB devices: {}", e);
        UsbError::from(e)
    })?;

    let total = devices.len();
    let permitted: Vec<_> = devices
        .into_iter()
        .filter(|device| access.permits(device))
        .collect();

    debug!(
        "Enumerated {} devices ({} hidden by access control)",
        permitted.len(),
        total - permitted.len()
    );
    Ok(permitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, sample_device};
    use common::DeviceKey;
    use common::test_utils::{
        create_mock_device_descriptor, create_mock_device_descriptor_with_class,
    };

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_logic() {
        let policy =
            AccessPolicy::from_patterns(&patterns(&["0x1234:0x5678", "0xabcd:*"]), false).unwrap();

        assert!(policy.allows(0x1234, 0x5678));
        assert!(policy.allows(0xabcd, 0x1111));
        assert!(policy.allows(0xabcd, 0x9999));

        assert!(!policy.allows(0x1234, 0x9999)); // Wrong PID
        assert!(!policy.allows(0x9999, 0x5678)); // Wrong VID
        assert!(!policy.allows(0x0000, 0x0000));

        // Empty list allows all
        let open = AccessPolicy::from_patterns(&[], false).unwrap();
        assert!(open.allows(0x1234, 0x5678));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(AccessPolicy::from_patterns(&patterns(&["12345678"]), false).is_err());
        assert!(AccessPolicy::from_patterns(&patterns(&["0xZZZZ:*"]), false).is_err());
        assert!(AccessPolicy::from_patterns(&patterns(&["0x1234:0x12345"]), false).is_err());
    }

    #[test]
    fn test_root_hub_hidden() {
        let hub = create_mock_device_descriptor_with_class(0x1d6b, 0x0002, HUB_CLASS, 0, 1);
        assert!(is_root_hub(&hub));

        let mut device = sample_device(DeviceKey::new(1, 1));
        device.descriptor = hub;

        let hiding = AccessPolicy::from_patterns(&[], true).unwrap();
        assert!(!hiding.permits(&device));
        let showing = AccessPolicy::from_patterns(&[], false).unwrap();
        assert!(showing.permits(&device));
    }

    #[test]
    fn test_matches_filter() {
        let descriptor = create_mock_device_descriptor(0x1234, 0x5678);

        assert!(matches_filter(&Filter::default(), &descriptor));
        assert!(matches_filter(
            &Filter {
                vendor_id: Some(0x1234),
                product_id: Some(0x5678),
                ..Default::default()
            },
            &descriptor
        ));
        assert!(!matches_filter(
            &Filter {
                vendor_id: Some(0x1234),
                product_id: Some(0x0001),
                ..Default::default()
            },
            &descriptor
        ));
        assert!(matches_filter(
            &Filter {
                serial_number: Some("SN12345678".to_string()),
                ..Default::default()
            },
            &descriptor
        ));
        assert!(!matches_filter(
            &Filter {
                class_code: Some(0x03),
                ..Default::default()
            },
            &descriptor
        ));
    }

    #[test]
    fn test_filter_serial_without_device_serial() {
        let mut descriptor = create_mock_device_descriptor(0x1234, 0x5678);
        descriptor.serial_number = None;
        let filter = Filter {
            serial_number: Some("SN12345678".to_string()),
            ..Default::default()
        };
        assert!(!matches_filter(&filter, &descriptor));
    }

    #[test]
    fn test_discover_applies_access_control() {
        let backend = FakeBackend::new();
        backend.add_device(sample_device(DeviceKey::new(1, 2)));
        let mut other = sample_device(DeviceKey::new(1, 3));
        other.descriptor = create_mock_device_descriptor(0xabcd, 0x0001);
        backend.add_device(other);

        let policy = AccessPolicy::from_patterns(&patterns(&["0xabcd:*"]), true).unwrap();
        let devices = discover(&backend, &policy).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].key, DeviceKey::new(1, 3));

        assert_eq!(discover(&backend, &AllowAll).unwrap().len(), 2);
    }
}
