//! OS USB primitive seam
//!
//! The engine never talks to the kernel directly. It consumes a backend that
//! lists attached devices, opens them, and exposes per-device primitives
//! (configuration, claims, reset, and the four transfer kinds). Two backends
//! ship with the crate:
//!
//! - [`libusb::LibusbBackend`]: the real OS stack through `rusb`
//! - [`fake::FakeBackend`]: an in-memory device model that records every call

pub mod fake;
pub mod libusb;

use common::{DeviceKey, EventReceiver};
use protocol::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Speed,
    UsbError,
};
use thiserror::Error;

pub use fake::FakeBackend;
pub use libusb::LibusbBackend;

/// Errors reported by an OS primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Endpoint returned STALL
    #[error("endpoint stalled")]
    Stall,
    /// Device is gone from the bus
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    /// Resource is held by another process or driver
    #[error("resource busy")]
    Busy,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("entity not found")]
    NotFound,
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl From<BackendError> for UsbError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Stall => UsbError::TransferStalled,
            BackendError::NoDevice => UsbError::DeviceDisconnected,
            BackendError::Busy => UsbError::DeviceBusy,
            BackendError::Timeout => UsbError::TimedOut,
            BackendError::Access | BackendError::NotFound | BackendError::Other(_) => {
                UsbError::Io {
                    message: err.to_string(),
                }
            }
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// One alternate setting of one interface, with its endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTree {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// One configuration with every alternate setting of every interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationTree {
    pub descriptor: ConfigurationDescriptor,
    pub interfaces: Vec<InterfaceTree>,
}

/// Everything the engine caches about a device at enumeration time
///
/// Read without putting the device in the open state; the descriptors never
/// change for the lifetime of the resources built from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub key: DeviceKey,
    pub descriptor: DeviceDescriptor,
    pub speed: Speed,
    pub configurations: Vec<ConfigurationTree>,
}

impl DiscoveredDevice {
    /// Find a configuration by its bConfigurationValue
    pub fn configuration_index(&self, number: u8) -> Option<usize> {
        self.configurations
            .iter()
            .position(|configuration| configuration.descriptor.number == number)
    }
}

/// Host-wide OS primitive
pub trait UsbBackend: Send + Sync {
    /// List currently attached devices with their full descriptor tree
    fn list_devices(&self) -> BackendResult<Vec<DiscoveredDevice>>;

    /// Configuration value the OS reports as active, without opening the device
    ///
    /// `None` means the device is unconfigured.
    fn active_configuration(&self, key: DeviceKey) -> BackendResult<Option<u8>>;

    /// Open a device for I/O; dropping the returned handle closes it
    fn open(&self, key: DeviceKey) -> BackendResult<Box<dyn DeviceIo>>;

    /// Removal notifications, if the OS can report them
    fn events(&self) -> Option<EventReceiver> {
        None
    }
}

/// Per-device OS primitive for an opened device
///
/// State-changing calls take `&mut self` and are serialized by the engine's
/// per-device lock. Transfers take `&self` so that different endpoints of one
/// device can be driven from several threads at once.
pub trait DeviceIo: Send + Sync {
    fn active_configuration(&self) -> BackendResult<Option<u8>>;

    fn set_configuration(&mut self, value: u8) -> BackendResult<()>;

    fn claim_interface(&mut self, interface: u8) -> BackendResult<()>;

    fn release_interface(&mut self, interface: u8) -> BackendResult<()>;

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> BackendResult<()>;

    fn reset(&mut self) -> BackendResult<()>;

    fn clear_halt(&mut self, endpoint: u8) -> BackendResult<()>;

    /// Control transfer with an IN data stage of at most `length` bytes
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> BackendResult<Vec<u8>>;

    /// Control transfer with an OUT data stage; returns bytes accepted
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> BackendResult<usize>;

    fn interrupt_in(&self, endpoint: u8, length: usize) -> BackendResult<Vec<u8>>;

    fn interrupt_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize>;

    fn bulk_in(&self, endpoint: u8, length: usize) -> BackendResult<Vec<u8>>;

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize>;

    /// Single isochronous packet of at most `packet_size` bytes
    ///
    /// A lost or partial packet is a short (possibly empty) result.
    fn isochronous_in(&self, endpoint: u8, packet_size: usize) -> BackendResult<Vec<u8>>;

    /// Single isochronous packet; returns bytes delivered
    fn isochronous_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize>;
}
