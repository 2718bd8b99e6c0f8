//! Test utilities for the USB host
//!
//! Provides descriptor builders for fake devices used across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_descriptor;
//!
//! let descriptor = create_mock_device_descriptor(0x1234, 0x5678);
//! assert_eq!(descriptor.vendor_id, 0x1234);
//! ```

use protocol::{
    ConfigurationDescriptor, DeviceDescriptor, Direction, EndpointDescriptor, InterfaceDescriptor,
    TransferType,
};

/// Create a mock DeviceDescriptor for testing
///
/// The device reports one configuration, USB 2.0 and a 64-byte EP0.
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        manufacturer_name: Some(format!("Test Manufacturer {:04x}", vendor_id)),
        product_name: Some(format!("Test Product {:04x}", product_id)),
        serial_number: Some(format!("SN{:04x}{:04x}", vendor_id, product_id)),
        device_version: (1, 0, 0),
        usb_version: (2, 0, 0),
        max_packet_size: 64,
        num_configurations: 1,
    }
}

/// Create a mock DeviceDescriptor with specific USB class
pub fn create_mock_device_descriptor_with_class(
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> DeviceDescriptor {
    DeviceDescriptor {
        device_class: class,
        device_subclass: subclass,
        device_protocol: protocol,
        ..create_mock_device_descriptor(vendor_id, product_id)
    }
}

/// Create a mock ConfigurationDescriptor (bus powered, 100 mA)
pub fn create_mock_configuration(number: u8) -> ConfigurationDescriptor {
    ConfigurationDescriptor {
        number,
        description: Some(format!("Configuration {}", number)),
        self_powered: false,
        remote_wakeup: false,
        max_power: 100,
    }
}

/// Create a mock InterfaceDescriptor (vendor-specific class)
pub fn create_mock_interface(interface_number: u8, alternate_setting: u8) -> InterfaceDescriptor {
    InterfaceDescriptor {
        interface_number,
        alternate_setting,
        interface_class: 0xff,
        interface_subclass: 0x00,
        interface_protocol: 0x00,
        interface_name: None,
    }
}

/// Create a mock EndpointDescriptor from a wire address
///
/// # Example
/// ```
/// use common::test_utils::create_mock_endpoint;
/// use protocol::{Direction, TransferType};
///
/// let endpoint = create_mock_endpoint(0x81, TransferType::Interrupt, 8);
/// assert_eq!(endpoint.endpoint_number, 1);
/// assert_eq!(endpoint.direction, Direction::In);
/// ```
pub fn create_mock_endpoint(
    address: u8,
    transfer_type: TransferType,
    max_packet_size: u16,
) -> EndpointDescriptor {
    EndpointDescriptor {
        endpoint_number: address & 0x0f,
        direction: Direction::from_address(address),
        transfer_type,
        max_packet_size,
        interval: match transfer_type {
            TransferType::Interrupt | TransferType::Isochronous => 1,
            TransferType::Bulk | TransferType::Control => 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_device_descriptor() {
        let descriptor = create_mock_device_descriptor(0x1234, 0x5678);
        assert_eq!(descriptor.product_id, 0x5678);
        assert_eq!(descriptor.serial_number.as_deref(), Some("SN12345678"));
    }

    #[test]
    fn test_create_mock_device_descriptor_with_class() {
        let descriptor = create_mock_device_descriptor_with_class(0x1d6b, 0x0002, 9, 0, 1);
        assert_eq!(descriptor.device_class, 9);
        assert_eq!(descriptor.vendor_id, 0x1d6b);
    }

    #[test]
    fn test_create_mock_endpoint_round_trips_address() {
        for address in [0x01, 0x02, 0x81, 0x8f] {
            let endpoint = create_mock_endpoint(address, TransferType::Bulk, 64);
            assert_eq!(endpoint.address(), address);
        }
    }
}
