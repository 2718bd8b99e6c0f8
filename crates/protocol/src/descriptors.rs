//! USB descriptor model
//!
//! Immutable snapshots of the standard device, configuration, interface and
//! endpoint descriptors, read once when a device is enumerated and cached
//! next to the resource that owns them.

use serde::{Deserialize, Serialize};

/// Endpoint or data-stage direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speed {
    /// Speed not reported by the OS
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Device descriptor with the string descriptors resolved
///
/// Identity fields (vendor, product, serial) are stable for one enumeration
/// but not across a disconnect/reconnect cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub device_class: u8,
    /// USB device subclass
    pub device_subclass: u8,
    /// USB device protocol
    pub device_protocol: u8,
    /// Manufacturer string (if available)
    pub manufacturer_name: Option<String>,
    /// Product string (if available)
    pub product_name: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
    /// bcdDevice as (major, minor, sub_minor)
    pub device_version: (u8, u8, u8),
    /// bcdUSB as (major, minor, sub_minor)
    pub usb_version: (u8, u8, u8),
    /// Max packet size of the default control endpoint
    pub max_packet_size: u8,
    /// Number of configurations
    pub num_configurations: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// bConfigurationValue, the value passed to SET_CONFIGURATION
    pub number: u8,
    pub description: Option<String>,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    /// Maximum power draw in mA
    pub max_power: u16,
}

/// One alternate setting of one interface number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint number without the direction bit (1-15)
    pub endpoint_number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    /// Polling interval (bInterval)
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Endpoint address as it appears on the wire (direction in bit 7)
    pub fn address(&self) -> u8 {
        let direction_bit = match self.direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        (self.endpoint_number & 0x0f) | direction_bit
    }
}

/// bmRequestType bits 5..6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSetupType {
    Standard,
    Class,
    Vendor,
}

/// bmRequestType bits 0..4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSetupRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// SETUP packet fields for a control transfer on the default endpoint
///
/// The data-stage length is passed separately: as the requested length for
/// reads, and implicitly as the buffer length for writes. The direction bit of
/// bmRequestType is derived from the call (read or write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    pub request_type: ControlSetupType,
    pub request_recipient: ControlSetupRecipient,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl ControlSetup {
    /// Build the bmRequestType byte for a transfer in the given direction
    pub fn request_type_byte(&self, direction: Direction) -> u8 {
        let direction = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        let kind = match self.request_type {
            ControlSetupType::Standard => 0x00,
            ControlSetupType::Class => 0x01 << 5,
            ControlSetupType::Vendor => 0x02 << 5,
        };
        let recipient = match self.request_recipient {
            ControlSetupRecipient::Device => 0x00,
            ControlSetupRecipient::Interface => 0x01,
            ControlSetupRecipient::Endpoint => 0x02,
            ControlSetupRecipient::Other => 0x03,
        };
        direction | kind | recipient
    }
}

/// Device selection criteria for `request-device`
///
/// Every field that is `Some` must match; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub class_code: Option<u8>,
    pub subclass_code: Option<u8>,
    pub protocol_code: Option<u8>,
    pub serial_number: Option<String>,
}
