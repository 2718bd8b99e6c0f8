//! Resources held by the registry
//!
//! A device resource owns the per-device state and locks. Every other
//! resource is a view into the device's cached descriptor tree. Endpoints also
//! keep the interface handle they were obtained from, which the claim check
//! compares against.

use crate::backend::{ConfigurationTree, DiscoveredDevice, InterfaceTree};
use crate::state::DeviceState;
use common::DeviceKey;
use protocol::{
    ConfigurationDescriptor, EndpointDescriptor, InterfaceDescriptor, InterfaceHandle, Result,
    UsbError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One enumerated device
pub struct DeviceNode {
    info: Arc<DiscoveredDevice>,
    state: RwLock<DeviceState>,
    disconnected: AtomicBool,
    /// One lock per endpoint address (16 OUT, 16 IN)
    endpoint_locks: [Mutex<()>; 32],
}

impl DeviceNode {
    pub fn new(info: Arc<DiscoveredDevice>) -> Self {
        Self {
            info,
            state: RwLock::new(DeviceState::Closed),
            disconnected: AtomicBool::new(false),
            endpoint_locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    pub fn info(&self) -> &DiscoveredDevice {
        &self.info
    }

    pub fn key(&self) -> DeviceKey {
        self.info.key
    }

    /// Shared access for transfers
    pub fn read_state(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access for state transitions
    pub fn write_state(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes transfers on one endpoint address
    pub fn lock_endpoint(&self, address: u8) -> MutexGuard<'_, ()> {
        let slot = usize::from((address & 0x0f) | ((address & 0x80) >> 3));
        self.endpoint_locks[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceNode")
            .field("key", &self.info.key)
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigurationRef {
    pub device: Arc<DeviceNode>,
    pub config_index: usize,
}

impl ConfigurationRef {
    pub fn tree(&self) -> &ConfigurationTree {
        &self.device.info().configurations[self.config_index]
    }

    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.tree().descriptor
    }
}

/// One alternate setting of one interface
#[derive(Debug, Clone)]
pub struct InterfaceRef {
    pub device: Arc<DeviceNode>,
    pub config_index: usize,
    pub interface_index: usize,
}

impl InterfaceRef {
    pub fn tree(&self) -> &InterfaceTree {
        &self.device.info().configurations[self.config_index].interfaces[self.interface_index]
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.tree().descriptor
    }

    /// bConfigurationValue of the owning configuration
    pub fn configuration_value(&self) -> u8 {
        self.device.info().configurations[self.config_index]
            .descriptor
            .number
    }
}

#[derive(Debug, Clone)]
pub struct EndpointRef {
    pub device: Arc<DeviceNode>,
    pub interface: InterfaceHandle,
    pub config_index: usize,
    pub interface_index: usize,
    pub endpoint_index: usize,
}

impl EndpointRef {
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.device.info().configurations[self.config_index].interfaces[self.interface_index]
            .endpoints[self.endpoint_index]
    }

    /// Interface number of the owning interface
    pub fn interface_number(&self) -> u8 {
        self.device.info().configurations[self.config_index].interfaces[self.interface_index]
            .descriptor
            .interface_number
    }
}

#[derive(Debug, Clone)]
pub enum Resource {
    Device(Arc<DeviceNode>),
    Configuration(ConfigurationRef),
    Interface(InterfaceRef),
    Endpoint(EndpointRef),
}

impl Resource {
    pub fn into_device(self) -> Result<Arc<DeviceNode>> {
        match self {
            Resource::Device(device) => Ok(device),
            _ => Err(UsbError::InvalidHandle),
        }
    }

    pub fn into_configuration(self) -> Result<ConfigurationRef> {
        match self {
            Resource::Configuration(configuration) => Ok(configuration),
            _ => Err(UsbError::InvalidHandle),
        }
    }

    pub fn into_interface(self) -> Result<InterfaceRef> {
        match self {
            Resource::Interface(interface) => Ok(interface),
            _ => Err(UsbError::InvalidHandle),
        }
    }

    pub fn into_endpoint(self) -> Result<EndpointRef> {
        match self {
            Resource::Endpoint(endpoint) => Ok(endpoint),
            _ => Err(UsbError::InvalidHandle),
        }
    }
}

/// Fail with `InvalidParent` unless `resource` hangs off `device`
pub fn ensure_same_device(device: &Arc<DeviceNode>, resource: &Arc<DeviceNode>) -> Result<()> {
    if Arc::ptr_eq(device, resource) {
        Ok(())
    } else {
        Err(UsbError::InvalidParent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::sample_device;

    #[test]
    fn test_endpoint_lock_slots_are_distinct() {
        let node = DeviceNode::new(Arc::new(sample_device(DeviceKey::new(1, 2))));
        let _out = node.lock_endpoint(0x02);
        // IN endpoint with the same number must not share the OUT lock
        let _in = node.lock_endpoint(0x82);
        let _other = node.lock_endpoint(0x0f);
        let _last = node.lock_endpoint(0x8f);
    }

    #[test]
    fn test_disconnected_flag() {
        let node = DeviceNode::new(Arc::new(sample_device(DeviceKey::new(1, 2))));
        assert!(!node.is_disconnected());
        node.mark_disconnected();
        assert!(node.is_disconnected());
    }

    #[test]
    fn test_resource_kind_mismatch() {
        let node = Arc::new(DeviceNode::new(Arc::new(sample_device(DeviceKey::new(1, 2)))));
        let resource = Resource::Device(node.clone());
        assert!(resource.clone().into_device().is_ok());
        assert_eq!(
            resource.into_endpoint().map(|_| ()),
            Err(UsbError::InvalidHandle)
        );
    }

    #[test]
    fn test_ensure_same_device() {
        let a = Arc::new(DeviceNode::new(Arc::new(sample_device(DeviceKey::new(1, 2)))));
        let b = Arc::new(DeviceNode::new(Arc::new(sample_device(DeviceKey::new(1, 2)))));
        assert!(ensure_same_device(&a, &a.clone()).is_ok());
        assert_eq!(ensure_same_device(&a, &b), Err(UsbError::InvalidParent));
    }
}
