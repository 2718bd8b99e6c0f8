//! Host engine
//!
//! `UsbHost` is the surface a sandbox binding calls into. Every operation is a
//! synchronous call on the caller's thread. Lock order is always device state
//! before registry before owner table; the device lock is never taken while
//! the registry lock is held.
//!
//! Pending removal events are drained at the start of every operation, and an
//! OS primitive reporting that the device is gone tears the device tree down
//! on the spot.

use crate::backend::UsbBackend;
use crate::config::UsbSettings;
use crate::dispatcher::{Dispatcher, TransferKind};
use crate::enumerator::{self, AccessControl, AccessPolicy};
use crate::registry::Registry;
use crate::resource::{
    ConfigurationRef, DeviceNode, EndpointRef, InterfaceRef, Resource, ensure_same_device,
};
use crate::state::{ClaimOutcome, DeviceState};
use common::{DeviceKey, EventReceiver, UsbEvent};
use protocol::{
    ConfigurationDescriptor, ConfigurationHandle, ControlSetup, DeviceDescriptor, DeviceHandle,
    EndpointDescriptor, EndpointHandle, Filter, Handle, InterfaceDescriptor, InterfaceHandle,
    Result, Speed, UsbError,
};
use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

pub struct UsbHost<B: UsbBackend> {
    backend: B,
    registry: RwLock<Registry<Resource>>,
    /// Device handle currently holding each physical device open
    owners: Mutex<HashMap<DeviceKey, DeviceHandle>>,
    access: Box<dyn AccessControl>,
    dispatcher: Dispatcher,
    events: Option<EventReceiver>,
}

impl<B: UsbBackend> UsbHost<B> {
    /// Create a host with the access policy and limits from `settings`
    pub fn new(backend: B, settings: &UsbSettings) -> common::Result<Self> {
        let policy =
            AccessPolicy::from_patterns(&settings.allowed_devices, settings.hide_root_hubs)?;
        Ok(Self::with_access_control(
            backend,
            policy,
            settings.max_transfer_size,
        ))
    }

    pub fn with_access_control(
        backend: B,
        access: impl AccessControl + 'static,
        max_transfer_size: usize,
    ) -> Self {
        let events = backend.events();
        Self {
            backend,
            registry: RwLock::new(Registry::new()),
            owners: Mutex::new(HashMap::new()),
            access: Box::new(access),
            dispatcher: Dispatcher::new(max_transfer_size),
            events,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ---- Enumeration ----

    /// List permitted attached devices, registering one device resource each
    pub fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        self.process_events();
        let devices = enumerator::discover(&self.backend, self.access.as_ref())?;

        let mut registry = self.registry_write();
        devices
            .into_iter()
            .map(|device| {
                let node = Arc::new(DeviceNode::new(Arc::new(device)));
                registry
                    .register(None, Resource::Device(node))
                    .map(DeviceHandle)
            })
            .collect()
    }

    /// First permitted device matching `filter`
    pub fn request_device(&self, filter: &Filter) -> Result<Option<DeviceHandle>> {
        self.process_events();
        let devices = enumerator::discover(&self.backend, self.access.as_ref())?;

        let Some(device) = devices
            .into_iter()
            .find(|device| enumerator::matches_filter(filter, &device.descriptor))
        else {
            debug!("No device matches {:?}", filter);
            return Ok(None);
        };

        let node = Arc::new(DeviceNode::new(Arc::new(device)));
        let handle = self
            .registry_write()
            .register(None, Resource::Device(node))?;
        Ok(Some(DeviceHandle(handle)))
    }

    // ---- Device ----

    pub fn device_descriptor(&self, device: DeviceHandle) -> Result<DeviceDescriptor> {
        self.process_events();
        Ok(self.device_node(device)?.info().descriptor.clone())
    }

    pub fn speed(&self, device: DeviceHandle) -> Result<Speed> {
        self.process_events();
        Ok(self.device_node(device)?.info().speed)
    }

    /// One configuration resource per configuration the device describes
    pub fn configurations(&self, device: DeviceHandle) -> Result<Vec<ConfigurationHandle>> {
        self.process_events();
        let node = self.device_node(device)?;

        let mut registry = self.registry_write();
        (0..node.info().configurations.len())
            .map(|config_index| {
                let resource = Resource::Configuration(ConfigurationRef {
                    device: node.clone(),
                    config_index,
                });
                registry
                    .register(Some(device.raw()), resource)
                    .map(ConfigurationHandle)
            })
            .collect()
    }

    /// Resource for the active configuration
    ///
    /// Answered from the device state while open, otherwise from the OS.
    pub fn active_configuration(&self, device: DeviceHandle) -> Result<ConfigurationHandle> {
        self.process_events();
        let node = self.device_node(device)?;

        let tracked = match &*node.read_state() {
            DeviceState::Open(open) => Some(open.active_configuration()),
            DeviceState::Closed => None,
        };
        let value = match tracked {
            Some(value) => value,
            None => {
                let reported = self
                    .backend
                    .active_configuration(node.key())
                    .map_err(UsbError::from);
                self.settle(&node, reported)?
            }
        };

        let value = value.ok_or(UsbError::NotConfigured)?;
        let config_index = node
            .info()
            .configuration_index(value)
            .ok_or_else(|| UsbError::Io {
                message: format!("active configuration {} is not described", value),
            })?;

        let resource = Resource::Configuration(ConfigurationRef {
            device: node.clone(),
            config_index,
        });
        self.registry_write()
            .register(Some(device.raw()), resource)
            .map(ConfigurationHandle)
    }

    pub fn opened(&self, device: DeviceHandle) -> Result<bool> {
        self.process_events();
        Ok(self.device_node(device)?.read_state().is_open())
    }

    pub fn open(&self, device: DeviceHandle) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;
        let key = node.key();

        let result = {
            let mut state = node.write_state();
            if state.is_open() {
                return Err(UsbError::InvalidState);
            }

            let mut owners = self.owners_lock();
            if owners.get(&key).is_some_and(|owner| *owner != device) {
                return Err(UsbError::DeviceBusy);
            }

            match self.backend.open(key) {
                Ok(io) => state.open(io).map(|()| {
                    owners.insert(key, device);
                }),
                Err(e) => {
                    warn!("Failed to open device {}: {}", key, e);
                    Err(e.into())
                }
            }
        };

        self.settle(&node, result)?;
        info!("Opened device {} as {}", key, device);
        Ok(())
    }

    /// Reset the device; every claimed interface must be claimed again
    pub fn reset(&self, device: DeviceHandle) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;

        let result = node.write_state().opened_mut().and_then(|open| open.reset());
        self.settle(&node, result)?;
        info!("Reset device {}", node.key());
        Ok(())
    }

    /// Release every claim, drop the OS handle and every descendant resource
    pub fn close(&self, device: DeviceHandle) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;

        let mut state = node.write_state();
        state.close()?;
        self.release_owner(node.key(), device);
        let released = self
            .registry_write()
            .release_descendants(device.raw(), None)?;
        drop(state);

        info!(
            "Closed device {}, released {} resources",
            node.key(),
            released.len()
        );
        Ok(())
    }

    /// Switch the active configuration
    ///
    /// Interface and endpoint resources obtained from any other configuration
    /// are released; configuration resources themselves stay valid.
    pub fn select_configuration(
        &self,
        device: DeviceHandle,
        configuration: ConfigurationHandle,
    ) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;
        let config = self.configuration_ref(configuration)?;
        let value = config.descriptor().number;

        let result = {
            let mut state = node.write_state();
            let result = state.opened_mut().and_then(|open| {
                ensure_same_device(&node, &config.device)?;
                open.select_configuration(value)
            });
            if result.is_ok() {
                self.prune_other_configurations(device, value);
            }
            result
        };

        self.settle(&node, result)?;
        info!("Device {} switched to configuration {}", node.key(), value);
        Ok(())
    }

    pub fn claim_interface(&self, device: DeviceHandle, interface: InterfaceHandle) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;
        let iface = self.interface_ref(interface)?;

        let result = node.write_state().opened_mut().and_then(|open| {
            ensure_same_device(&node, &iface.device)?;
            open.claim_interface(interface, iface.configuration_value(), iface.descriptor())
        });

        if let ClaimOutcome::Superseded(previous) = self.settle(&node, result)? {
            debug!("{} superseded {} on device {}", interface, previous, node.key());
        }
        Ok(())
    }

    pub fn release_interface(
        &self,
        device: DeviceHandle,
        interface: InterfaceHandle,
    ) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;
        let iface = self.interface_ref(interface)?;

        let result = node.write_state().opened_mut().and_then(|open| {
            ensure_same_device(&node, &iface.device)?;
            open.release_interface(interface, iface.descriptor().interface_number)
        });
        self.settle(&node, result)
    }

    pub fn clear_halt(&self, device: DeviceHandle, endpoint: EndpointHandle) -> Result<()> {
        self.process_events();
        let node = self.device_node(device)?;
        let ep = self.endpoint_ref(endpoint)?;

        let result = node.write_state().opened_mut().and_then(|open| {
            ensure_same_device(&node, &ep.device)?;
            open.clear_halt(ep.interface, ep.interface_number(), ep.descriptor().address())
        });
        self.settle(&node, result)
    }

    // ---- Transfers ----

    pub fn read_control(
        &self,
        device: DeviceHandle,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>> {
        self.process_events();
        let node = self.device_node(device)?;
        let result = {
            let state = node.read_state();
            self.dispatcher.read_control(&node, &state, &setup, length)
        };
        self.settle(&node, result)
    }

    pub fn write_control(
        &self,
        device: DeviceHandle,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<u64> {
        self.process_events();
        let node = self.device_node(device)?;
        let result = {
            let state = node.read_state();
            self.dispatcher.write_control(&node, &state, &setup, data)
        };
        self.settle(&node, result)
    }

    pub fn read_interrupt(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        length: u64,
    ) -> Result<Vec<u8>> {
        self.read_endpoint(device, endpoint, TransferKind::Interrupt, length)
    }

    pub fn write_interrupt(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        data: &[u8],
    ) -> Result<u64> {
        self.write_endpoint(device, endpoint, TransferKind::Interrupt, data)
    }

    pub fn read_bulk(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        length: u64,
    ) -> Result<Vec<u8>> {
        self.read_endpoint(device, endpoint, TransferKind::Bulk, length)
    }

    pub fn write_bulk(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        data: &[u8],
    ) -> Result<u64> {
        self.write_endpoint(device, endpoint, TransferKind::Bulk, data)
    }

    /// Read one isochronous packet; a lost packet is an empty result
    pub fn read_isochronous(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
    ) -> Result<Vec<u8>> {
        self.read_endpoint(device, endpoint, TransferKind::Isochronous, 0)
    }

    /// Write one isochronous packet
    pub fn write_isochronous(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        data: &[u8],
    ) -> Result<u64> {
        self.write_endpoint(device, endpoint, TransferKind::Isochronous, data)
    }

    fn read_endpoint(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        kind: TransferKind,
        length: u64,
    ) -> Result<Vec<u8>> {
        self.process_events();
        let node = self.device_node(device)?;
        let endpoint = self.endpoint_ref(endpoint)?;
        let result = {
            let state = node.read_state();
            self.dispatcher.read(&node, &state, &endpoint, kind, length)
        };
        self.settle(&node, result)
    }

    fn write_endpoint(
        &self,
        device: DeviceHandle,
        endpoint: EndpointHandle,
        kind: TransferKind,
        data: &[u8],
    ) -> Result<u64> {
        self.process_events();
        let node = self.device_node(device)?;
        let endpoint = self.endpoint_ref(endpoint)?;
        let result = {
            let state = node.read_state();
            self.dispatcher.write(&node, &state, &endpoint, kind, data)
        };
        self.settle(&node, result)
    }

    // ---- Configuration / interface / endpoint ----

    pub fn configuration_descriptor(
        &self,
        configuration: ConfigurationHandle,
    ) -> Result<ConfigurationDescriptor> {
        self.process_events();
        Ok(self.configuration_ref(configuration)?.descriptor().clone())
    }

    /// One interface resource per alternate setting of every interface
    pub fn interfaces(&self, configuration: ConfigurationHandle) -> Result<Vec<InterfaceHandle>> {
        self.process_events();
        let config = self.configuration_ref(configuration)?;

        let mut registry = self.registry_write();
        (0..config.tree().interfaces.len())
            .map(|interface_index| {
                let resource = Resource::Interface(InterfaceRef {
                    device: config.device.clone(),
                    config_index: config.config_index,
                    interface_index,
                });
                registry
                    .register(Some(configuration.raw()), resource)
                    .map(InterfaceHandle)
            })
            .collect()
    }

    pub fn interface_descriptor(&self, interface: InterfaceHandle) -> Result<InterfaceDescriptor> {
        self.process_events();
        Ok(self.interface_ref(interface)?.descriptor().clone())
    }

    pub fn endpoints(&self, interface: InterfaceHandle) -> Result<Vec<EndpointHandle>> {
        self.process_events();
        let iface = self.interface_ref(interface)?;

        let mut registry = self.registry_write();
        (0..iface.tree().endpoints.len())
            .map(|endpoint_index| {
                let resource = Resource::Endpoint(EndpointRef {
                    device: iface.device.clone(),
                    interface,
                    config_index: iface.config_index,
                    interface_index: iface.interface_index,
                    endpoint_index,
                });
                registry
                    .register(Some(interface.raw()), resource)
                    .map(EndpointHandle)
            })
            .collect()
    }

    pub fn endpoint_descriptor(&self, endpoint: EndpointHandle) -> Result<EndpointDescriptor> {
        self.process_events();
        Ok(*self.endpoint_ref(endpoint)?.descriptor())
    }

    // ---- Release ----

    /// Release a device resource, closing it first if open
    ///
    /// Fails with `ResourceInUse` while configuration resources are live.
    pub fn drop_device(&self, device: DeviceHandle) -> Result<()> {
        self.process_events();
        let Some(resource) = self.resolve_for_drop(device.raw())? else {
            return Ok(());
        };
        let node = resource.into_device()?;

        let mut state = node.write_state();
        {
            let mut registry = self.registry_write();
            if registry.child_count(device.raw())? > 0 {
                return Err(UsbError::ResourceInUse);
            }
            registry.release(device.raw())?;
        }

        if state.is_open() {
            if let Err(e) = state.close() {
                warn!("Failed to close device {}: {}", node.key(), e);
            }
            self.release_owner(node.key(), device);
            info!("Closed device {} on release", node.key());
        }
        Ok(())
    }

    /// Release a configuration resource
    ///
    /// The active configuration cannot be released while interfaces are
    /// claimed under it.
    pub fn drop_configuration(&self, configuration: ConfigurationHandle) -> Result<()> {
        self.process_events();
        let Some(resource) = self.resolve_for_drop(configuration.raw())? else {
            return Ok(());
        };
        let config = resource.into_configuration()?;

        let state = config.device.write_state();
        if let DeviceState::Open(open) = &*state
            && open.active_configuration() == Some(config.descriptor().number)
            && open.has_claims()
        {
            return Err(UsbError::ResourceInUse);
        }
        self.registry_write().release(configuration.raw())?;
        Ok(())
    }

    /// Release an interface resource, releasing its claim if it holds one
    pub fn drop_interface(&self, interface: InterfaceHandle) -> Result<()> {
        self.process_events();
        let Some(resource) = self.resolve_for_drop(interface.raw())? else {
            return Ok(());
        };
        let iface = resource.into_interface()?;
        let number = iface.descriptor().interface_number;

        let mut state = iface.device.write_state();
        self.registry_write().release(interface.raw())?;

        if let DeviceState::Open(open) = &mut *state
            && open.is_claimed(number, interface)
            && let Err(e) = open.release_interface(interface, number)
        {
            warn!("Failed to release interface {}: {}", number, e);
        }
        Ok(())
    }

    pub fn drop_endpoint(&self, endpoint: EndpointHandle) -> Result<()> {
        self.process_events();
        let Some(resource) = self.resolve_for_drop(endpoint.raw())? else {
            return Ok(());
        };
        resource.into_endpoint()?;
        self.registry_write().release(endpoint.raw())?;
        Ok(())
    }

    // ---- Events ----

    /// Handle every pending backend event without blocking
    ///
    /// Returns the number of events handled.
    pub fn process_events(&self) -> usize {
        let Some(events) = &self.events else {
            return 0;
        };

        let mut handled = 0;
        while let Some(event) = events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Forced teardown of every resource tree for a physical device
    ///
    /// Every handle in the tree keeps resolving to `DeviceDisconnected` until
    /// its slot is reused. Always succeeds.
    pub fn handle_disconnect(&self, key: DeviceKey) {
        let roots: Vec<(Handle, Arc<DeviceNode>)> = self
            .registry_read()
            .roots()
            .filter_map(|(handle, resource)| match resource {
                Resource::Device(node) if node.key() == key => Some((handle, node.clone())),
                _ => None,
            })
            .collect();

        for (_, node) in &roots {
            node.mark_disconnected();
            node.write_state().abandon();
        }

        let mut revoked = 0;
        {
            let mut registry = self.registry_write();
            for (handle, _) in &roots {
                if let Ok(removed) =
                    registry.release_cascade(*handle, Some(UsbError::DeviceDisconnected))
                {
                    revoked += removed.len();
                }
            }
        }
        self.owners_lock().remove(&key);

        if revoked > 0 {
            info!("Device {} disconnected, revoked {} resources", key, revoked);
        } else {
            debug!("Device {} disconnected, no live resources", key);
        }
    }

    fn handle_event(&self, event: UsbEvent) {
        match event {
            UsbEvent::DeviceLeft { key } => self.handle_disconnect(key),
        }
    }

    // ---- Internals ----

    /// Fold a backend outcome into the device lifecycle
    ///
    /// A vanished device is torn down before the error reaches the caller.
    fn settle<T>(&self, device: &DeviceNode, result: Result<T>) -> Result<T> {
        match result {
            Err(UsbError::DeviceDisconnected) => {
                self.handle_disconnect(device.key());
                Err(UsbError::DeviceDisconnected)
            }
            _ if device.is_disconnected() => Err(UsbError::DeviceDisconnected),
            other => other,
        }
    }

    /// Release interface and endpoint resources of every configuration other
    /// than `active`; called with the device lock held
    fn prune_other_configurations(&self, device: DeviceHandle, active: u8) {
        let mut registry = self.registry_write();
        let stale: Vec<Handle> = registry
            .children_of(device.raw())
            .into_iter()
            .filter(|child| match registry.resolve(*child) {
                Ok(Resource::Configuration(config)) => config.descriptor().number != active,
                _ => false,
            })
            .collect();

        for configuration in stale {
            if let Ok(released) = registry.release_descendants(configuration, None)
                && !released.is_empty()
            {
                debug!(
                    "Released {} resources of inactive configuration {}",
                    released.len(),
                    configuration
                );
            }
        }
    }

    fn release_owner(&self, key: DeviceKey, device: DeviceHandle) {
        let mut owners = self.owners_lock();
        if owners.get(&key) == Some(&device) {
            owners.remove(&key);
        }
    }

    /// Resolve a handle about to be dropped; a tombstone is discarded and
    /// reported as already gone
    fn resolve_for_drop(&self, handle: Handle) -> Result<Option<Resource>> {
        let resolved = self.registry_read().resolve(handle).cloned();
        match resolved {
            Ok(resource) => Ok(Some(resource)),
            Err(UsbError::DeviceDisconnected) => {
                self.registry_write().discard_tombstone(handle);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn resolve(&self, handle: Handle) -> Result<Resource> {
        self.registry_read().resolve(handle).cloned()
    }

    fn device_node(&self, device: DeviceHandle) -> Result<Arc<DeviceNode>> {
        self.resolve(device.raw())?.into_device()
    }

    fn configuration_ref(&self, configuration: ConfigurationHandle) -> Result<ConfigurationRef> {
        self.resolve(configuration.raw())?.into_configuration()
    }

    fn interface_ref(&self, interface: InterfaceHandle) -> Result<InterfaceRef> {
        self.resolve(interface.raw())?.into_interface()
    }

    fn endpoint_ref(&self, endpoint: EndpointHandle) -> Result<EndpointRef> {
        self.resolve(endpoint.raw())?.into_endpoint()
    }

    fn registry_read(&self) -> RwLockReadGuard<'_, Registry<Resource>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, Registry<Resource>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn owners_lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, DeviceHandle>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: UsbBackend + 'static> UsbHost<B> {
    /// Spawn a thread that tears devices down as soon as removal is reported
    ///
    /// Returns `None` if the backend reports no events. The thread holds only
    /// a weak reference and stops once the host is dropped or the backend's
    /// event channel closes.
    pub fn spawn_event_watcher(self: &Arc<Self>) -> common::Result<Option<JoinHandle<()>>> {
        let Some(events) = self.events.clone() else {
            return Ok(None);
        };
        let host = Arc::downgrade(self);

        let handle = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                info!("USB event watcher started");
                while let Ok(event) = events.recv_blocking() {
                    let Some(host) = host.upgrade() else {
                        break;
                    };
                    host.handle_event(event);
                }
                info!("USB event watcher stopped");
            })?;

        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{BackendCall, FakeBackend, sample_device};
    use crate::enumerator::AllowAll;

    const KEY: DeviceKey = DeviceKey::new(1, 4);

    fn host() -> UsbHost<FakeBackend> {
        let backend = FakeBackend::new();
        backend.add_device(sample_device(KEY));
        UsbHost::with_access_control(backend, AllowAll, 1024)
    }

    #[test]
    fn test_open_twice_and_busy() {
        let host = host();
        let first = host.enumerate().unwrap()[0];
        let second = host.enumerate().unwrap()[0];
        assert_ne!(first, second);

        host.open(first).unwrap();
        assert_eq!(host.open(first), Err(UsbError::InvalidState));
        assert_eq!(host.open(second), Err(UsbError::DeviceBusy));

        host.close(first).unwrap();
        assert_eq!(host.open(second), Ok(()));
    }

    #[test]
    fn test_close_when_closed() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        assert_eq!(host.close(device), Err(UsbError::InvalidState));
    }

    #[test]
    fn test_close_releases_descendants() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        host.open(device).unwrap();
        let config = host.active_configuration(device).unwrap();
        let interface = host.interfaces(config).unwrap()[0];
        host.claim_interface(device, interface).unwrap();

        host.close(device).unwrap();
        assert_eq!(
            host.configuration_descriptor(config),
            Err(UsbError::InvalidHandle)
        );
        assert_eq!(
            host.interface_descriptor(interface),
            Err(UsbError::InvalidHandle)
        );
        assert!(host.device_descriptor(device).is_ok());
        assert!(host.backend().calls().contains(&BackendCall::ReleaseInterface {
            key: KEY,
            interface: 0
        }));
    }

    #[test]
    fn test_active_configuration_while_closed() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        let config = host.active_configuration(device).unwrap();
        assert_eq!(host.configuration_descriptor(config).unwrap().number, 1);

        host.backend().set_active_configuration(KEY, None);
        assert_eq!(
            host.active_configuration(device),
            Err(UsbError::NotConfigured)
        );
    }

    #[test]
    fn test_wrong_handle_kind() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        let as_endpoint = EndpointHandle(device.raw());
        assert_eq!(
            host.endpoint_descriptor(as_endpoint),
            Err(UsbError::InvalidHandle)
        );
    }

    #[test]
    fn test_drop_device_with_children() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        let configs = host.configurations(device).unwrap();
        assert_eq!(configs.len(), 2);

        assert_eq!(host.drop_device(device), Err(UsbError::ResourceInUse));
        for config in configs {
            host.drop_configuration(config).unwrap();
        }
        assert_eq!(host.drop_device(device), Ok(()));
        assert_eq!(host.device_descriptor(device), Err(UsbError::InvalidHandle));
    }

    #[test]
    fn test_drop_open_device_closes_it() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        host.open(device).unwrap();
        host.drop_device(device).unwrap();

        // The physical device is free for another handle again
        let again = host.enumerate().unwrap()[0];
        assert_eq!(host.open(again), Ok(()));
    }

    #[test]
    fn test_drop_active_configuration_with_claims() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        host.open(device).unwrap();
        let config = host.active_configuration(device).unwrap();
        let other_view = host.active_configuration(device).unwrap();
        let interface = host.interfaces(config).unwrap()[0];
        host.claim_interface(device, interface).unwrap();

        assert_eq!(
            host.drop_configuration(other_view),
            Err(UsbError::ResourceInUse)
        );
        host.release_interface(device, interface).unwrap();
        assert_eq!(host.drop_configuration(other_view), Ok(()));
    }

    #[test]
    fn test_drop_claimed_interface_releases_claim() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        host.open(device).unwrap();
        let config = host.active_configuration(device).unwrap();
        let interface = host.interfaces(config).unwrap()[0];
        host.claim_interface(device, interface).unwrap();

        host.drop_interface(interface).unwrap();
        let configs = host.configurations(device).unwrap();
        assert_eq!(host.select_configuration(device, configs[1]), Ok(()));
    }

    #[test]
    fn test_select_configuration_prunes_other_configurations() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        host.open(device).unwrap();
        let configs = host.configurations(device).unwrap();
        let first_interfaces = host.interfaces(configs[0]).unwrap();
        let second_interfaces = host.interfaces(configs[1]).unwrap();

        host.select_configuration(device, configs[1]).unwrap();
        assert_eq!(
            host.interface_descriptor(first_interfaces[0]),
            Err(UsbError::InvalidHandle)
        );
        assert!(host.interface_descriptor(second_interfaces[0]).is_ok());
        assert!(host.configuration_descriptor(configs[0]).is_ok());
    }

    #[test]
    fn test_foreign_interface_is_invalid_parent() {
        let host = host();
        let a = host.enumerate().unwrap()[0];
        let b = host.enumerate().unwrap()[0];
        host.open(a).unwrap();
        let config_b = host.configurations(b).unwrap()[0];
        let interface_b = host.interfaces(config_b).unwrap()[0];

        assert_eq!(
            host.claim_interface(a, interface_b),
            Err(UsbError::InvalidParent)
        );
    }

    #[test]
    fn test_disconnect_tombstones_and_drop() {
        let host = host();
        let device = host.enumerate().unwrap()[0];
        let config = host.configurations(device).unwrap()[0];

        host.handle_disconnect(KEY);
        assert_eq!(
            host.device_descriptor(device),
            Err(UsbError::DeviceDisconnected)
        );
        assert_eq!(
            host.configuration_descriptor(config),
            Err(UsbError::DeviceDisconnected)
        );

        // Dropping a torn-down handle succeeds once, then the handle is gone
        assert_eq!(host.drop_configuration(config), Ok(()));
        assert_eq!(
            host.configuration_descriptor(config),
            Err(UsbError::InvalidHandle)
        );
    }

    #[test]
    fn test_new_rejects_bad_pattern() {
        let settings = UsbSettings {
            allowed_devices: vec!["bogus".to_string()],
            ..Default::default()
        };
        assert!(UsbHost::new(FakeBackend::new(), &settings).is_err());
    }
}
