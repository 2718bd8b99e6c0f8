//! In-memory OS primitive
//!
//! Models a set of attached devices and records every primitive invocation so
//! tests can assert what did (and did not) reach the "hardware". Data written
//! to OUT endpoint N loops back on IN endpoint N unless a canned response is
//! queued for the IN endpoint. Stalls, partial writes, failures and
//! disconnects can be injected per device.
//!
//! Transfers can be given an artificial latency. While a transfer sleeps it
//! counts as in flight, and the backend remembers the highest overlap seen per
//! endpoint and across the whole bus.

use super::{
    BackendError, BackendResult, ConfigurationTree, DeviceIo, DiscoveredDevice, InterfaceTree,
    UsbBackend,
};
use common::test_utils::{
    create_mock_configuration, create_mock_device_descriptor, create_mock_endpoint,
    create_mock_interface,
};
use common::{DeviceKey, EventReceiver, EventSender, UsbEvent, create_event_bridge};
use protocol::{Speed, TransferType};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// One recorded primitive invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    ListDevices,
    QueryActiveConfiguration { key: DeviceKey },
    Open { key: DeviceKey },
    SetConfiguration { key: DeviceKey, value: u8 },
    ClaimInterface { key: DeviceKey, interface: u8 },
    ReleaseInterface { key: DeviceKey, interface: u8 },
    SetAlternateSetting { key: DeviceKey, interface: u8, setting: u8 },
    Reset { key: DeviceKey },
    ClearHalt { key: DeviceKey, endpoint: u8 },
    ControlIn { key: DeviceKey, request_type: u8, request: u8, length: u16 },
    ControlOut { key: DeviceKey, request_type: u8, request: u8, data: Vec<u8> },
    Read { key: DeviceKey, kind: TransferType, endpoint: u8, length: usize },
    Write { key: DeviceKey, kind: TransferType, endpoint: u8, data: Vec<u8> },
}

impl BackendCall {
    /// True for control, interrupt, bulk and isochronous submissions
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            BackendCall::ControlIn { .. }
                | BackendCall::ControlOut { .. }
                | BackendCall::Read { .. }
                | BackendCall::Write { .. }
        )
    }
}

#[derive(Default)]
struct FakeDevice {
    info: Option<DiscoveredDevice>,
    attached: bool,
    active_configuration: Option<u8>,
    /// Canned responses per IN endpoint address
    responses: HashMap<u8, VecDeque<Vec<u8>>>,
    control_responses: VecDeque<Vec<u8>>,
    /// Looped-back bytes per endpoint number
    loopback: HashMap<u8, VecDeque<u8>>,
    write_limits: HashMap<u8, usize>,
    stalled: HashSet<u8>,
    fail_next: Option<BackendError>,
    vanish_on_transfer: bool,
}

#[derive(Default)]
struct FakeState {
    devices: BTreeMap<DeviceKey, FakeDevice>,
    calls: Vec<BackendCall>,
}

impl FakeState {
    fn device_mut(&mut self, key: DeviceKey) -> BackendResult<&mut FakeDevice> {
        match self.devices.get_mut(&key) {
            Some(device) if device.attached => Ok(device),
            _ => Err(BackendError::NoDevice),
        }
    }
}

/// In-flight transfer accounting
#[derive(Default)]
struct Traffic {
    latency: Duration,
    in_flight: HashMap<(DeviceKey, u8), usize>,
    peak: HashMap<(DeviceKey, u8), usize>,
    total: usize,
    peak_total: usize,
}

/// Marks one transfer as in flight until dropped
struct InFlight {
    traffic: Arc<Mutex<Traffic>>,
    slot: (DeviceKey, u8),
}

impl InFlight {
    fn begin(traffic: &Arc<Mutex<Traffic>>, key: DeviceKey, endpoint: u8) -> (Self, Duration) {
        let slot = (key, endpoint);
        let mut t = traffic.lock().unwrap_or_else(PoisonError::into_inner);
        let current = t.in_flight.entry(slot).or_default();
        *current += 1;
        let current = *current;
        let peak = t.peak.entry(slot).or_default();
        *peak = (*peak).max(current);
        t.total += 1;
        t.peak_total = t.peak_total.max(t.total);
        let latency = t.latency;

        let guard = Self {
            traffic: Arc::clone(traffic),
            slot,
        };
        (guard, latency)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut t = self.traffic.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = t.in_flight.get_mut(&self.slot) {
            *current = current.saturating_sub(1);
        }
        t.total = t.total.saturating_sub(1);
    }
}

/// Shared, cloneable in-memory backend
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    traffic: Arc<Mutex<Traffic>>,
    event_tx: EventSender,
    event_rx: EventReceiver,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let (event_tx, event_rx) = create_event_bridge();
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            traffic: Arc::new(Mutex::new(Traffic::default())),
            event_tx,
            event_rx,
        }
    }

    /// Attach a device; its first configuration starts out active
    pub fn add_device(&self, info: DiscoveredDevice) {
        let active_configuration = info
            .configurations
            .first()
            .map(|configuration| configuration.descriptor.number);
        let key = info.key;
        self.lock().devices.insert(
            key,
            FakeDevice {
                info: Some(info),
                attached: true,
                active_configuration,
                ..Default::default()
            },
        );
    }

    pub fn set_active_configuration(&self, key: DeviceKey, value: Option<u8>) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.active_configuration = value;
        }
    }

    /// Queue a canned response for the next read on an IN endpoint
    pub fn queue_in(&self, key: DeviceKey, endpoint: u8, data: Vec<u8>) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.responses.entry(endpoint).or_default().push_back(data);
        }
    }

    /// Queue a canned response for the next control read
    pub fn queue_control_in(&self, key: DeviceKey, data: Vec<u8>) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.control_responses.push_back(data);
        }
    }

    /// Accept at most `limit` bytes per write on an OUT endpoint
    pub fn set_write_limit(&self, key: DeviceKey, endpoint: u8, limit: usize) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.write_limits.insert(endpoint, limit);
        }
    }

    /// Halt an endpoint until `clear_halt` is called on it
    pub fn stall(&self, key: DeviceKey, endpoint: u8) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.stalled.insert(endpoint);
        }
    }

    /// Fail the next per-device primitive call with `error`
    pub fn fail_next(&self, key: DeviceKey, error: BackendError) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.fail_next = Some(error);
        }
    }

    /// Unplug a device and announce it on the event channel
    pub fn disconnect(&self, key: DeviceKey) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.attached = false;
        }
        self.announce_removal(key);
    }

    /// Unplug the device while its next transfer is in flight
    ///
    /// The transfer fails with `NoDevice` and the removal is announced.
    pub fn disconnect_during_next_transfer(&self, key: DeviceKey) {
        if let Some(device) = self.lock().devices.get_mut(&key) {
            device.vanish_on_transfer = true;
        }
    }

    /// Hold every transfer in flight for `latency` before it completes
    pub fn set_transfer_latency(&self, latency: Duration) {
        self.traffic_lock().latency = latency;
    }

    /// Most transfers ever in flight at once on one endpoint
    pub fn peak_in_flight(&self, key: DeviceKey, endpoint: u8) -> usize {
        self.traffic_lock()
            .peak
            .get(&(key, endpoint))
            .copied()
            .unwrap_or(0)
    }

    /// Most transfers ever in flight at once across all endpoints
    pub fn peak_total_in_flight(&self) -> usize {
        self.traffic_lock().peak_total
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Number of transfer submissions recorded so far
    pub fn transfer_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.is_transfer())
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn traffic_lock(&self) -> MutexGuard<'_, Traffic> {
        self.traffic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce_removal(&self, key: DeviceKey) {
        if let Err(e) = self.event_tx.publish(UsbEvent::DeviceLeft { key }) {
            debug!("Removal of {} not announced: {}", key, e);
        }
    }
}

impl UsbBackend for FakeBackend {
    fn list_devices(&self) -> BackendResult<Vec<DiscoveredDevice>> {
        let mut state = self.lock();
        state.calls.push(BackendCall::ListDevices);
        Ok(state
            .devices
            .values()
            .filter(|device| device.attached)
            .filter_map(|device| device.info.clone())
            .collect())
    }

    fn active_configuration(&self, key: DeviceKey) -> BackendResult<Option<u8>> {
        let mut state = self.lock();
        state.calls.push(BackendCall::QueryActiveConfiguration { key });
        Ok(state.device_mut(key)?.active_configuration)
    }

    fn open(&self, key: DeviceKey) -> BackendResult<Box<dyn DeviceIo>> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Open { key });
        let device = state.device_mut(key)?;
        if let Some(error) = device.fail_next.take() {
            return Err(error);
        }

        Ok(Box::new(FakeDeviceIo {
            key,
            backend: self.clone(),
        }))
    }

    fn events(&self) -> Option<EventReceiver> {
        Some(self.event_rx.clone())
    }
}

/// Opened fake device
struct FakeDeviceIo {
    key: DeviceKey,
    backend: FakeBackend,
}

impl FakeDeviceIo {
    /// Record `call`, then run `op` against the device unless an injected
    /// failure or a detached device preempts it
    fn with_device<T>(
        &self,
        call: BackendCall,
        op: impl FnOnce(&mut FakeDevice) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let transfer = call.is_transfer();
        let mut vanished = false;

        let result = {
            let mut state = self.backend.lock();
            state.calls.push(call);
            let device = state.device_mut(self.key)?;

            if transfer && device.vanish_on_transfer {
                device.vanish_on_transfer = false;
                device.attached = false;
                vanished = true;
                Err(BackendError::NoDevice)
            } else if let Some(error) = device.fail_next.take() {
                Err(error)
            } else {
                op(device)
            }
        };

        if vanished {
            self.backend.announce_removal(self.key);
        }
        result
    }

    /// Count a transfer as in flight and wait out the configured latency
    ///
    /// Runs outside the state lock so transfers can overlap.
    fn in_flight(&self, endpoint: u8) -> InFlight {
        let (guard, latency) = InFlight::begin(&self.backend.traffic, self.key, endpoint);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        guard
    }

    fn read(&self, kind: TransferType, endpoint: u8, length: usize) -> BackendResult<Vec<u8>> {
        let _in_flight = self.in_flight(endpoint);
        let call = BackendCall::Read {
            key: self.key,
            kind,
            endpoint,
            length,
        };
        self.with_device(call, |device| {
            if device.stalled.contains(&endpoint) {
                return Err(BackendError::Stall);
            }
            if let Some(mut data) = device
                .responses
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
            {
                data.truncate(length);
                return Ok(data);
            }

            let looped = device.loopback.entry(endpoint & 0x0f).or_default();
            let count = length.min(looped.len());
            Ok(looped.drain(..count).collect())
        })
    }

    fn write(&self, kind: TransferType, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        let _in_flight = self.in_flight(endpoint);
        let call = BackendCall::Write {
            key: self.key,
            kind,
            endpoint,
            data: data.to_vec(),
        };
        self.with_device(call, |device| {
            if device.stalled.contains(&endpoint) {
                return Err(BackendError::Stall);
            }
            let accepted = device
                .write_limits
                .get(&endpoint)
                .map_or(data.len(), |limit| data.len().min(*limit));
            device
                .loopback
                .entry(endpoint & 0x0f)
                .or_default()
                .extend(&data[..accepted]);
            Ok(accepted)
        })
    }
}

impl DeviceIo for FakeDeviceIo {
    fn active_configuration(&self) -> BackendResult<Option<u8>> {
        let call = BackendCall::QueryActiveConfiguration { key: self.key };
        self.with_device(call, |device| Ok(device.active_configuration))
    }

    fn set_configuration(&mut self, value: u8) -> BackendResult<()> {
        let call = BackendCall::SetConfiguration {
            key: self.key,
            value,
        };
        self.with_device(call, |device| {
            let known = device.info.as_ref().is_some_and(|info| {
                info.configurations
                    .iter()
                    .any(|configuration| configuration.descriptor.number == value)
            });
            if !known {
                return Err(BackendError::NotFound);
            }
            device.active_configuration = Some(value);
            Ok(())
        })
    }

    fn claim_interface(&mut self, interface: u8) -> BackendResult<()> {
        let call = BackendCall::ClaimInterface {
            key: self.key,
            interface,
        };
        self.with_device(call, |_| Ok(()))
    }

    fn release_interface(&mut self, interface: u8) -> BackendResult<()> {
        let call = BackendCall::ReleaseInterface {
            key: self.key,
            interface,
        };
        self.with_device(call, |_| Ok(()))
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> BackendResult<()> {
        let call = BackendCall::SetAlternateSetting {
            key: self.key,
            interface,
            setting,
        };
        self.with_device(call, |_| Ok(()))
    }

    fn reset(&mut self) -> BackendResult<()> {
        let call = BackendCall::Reset { key: self.key };
        self.with_device(call, |device| {
            device.stalled.clear();
            device.loopback.clear();
            Ok(())
        })
    }

    fn clear_halt(&mut self, endpoint: u8) -> BackendResult<()> {
        let call = BackendCall::ClearHalt {
            key: self.key,
            endpoint,
        };
        self.with_device(call, |device| {
            device.stalled.remove(&endpoint);
            Ok(())
        })
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        length: u16,
    ) -> BackendResult<Vec<u8>> {
        let call = BackendCall::ControlIn {
            key: self.key,
            request_type,
            request,
            length,
        };
        self.with_device(call, |device| {
            let mut data = device.control_responses.pop_front().unwrap_or_default();
            data.truncate(usize::from(length));
            Ok(data)
        })
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        data: &[u8],
    ) -> BackendResult<usize> {
        let call = BackendCall::ControlOut {
            key: self.key,
            request_type,
            request,
            data: data.to_vec(),
        };
        self.with_device(call, |_| Ok(data.len()))
    }

    fn interrupt_in(&self, endpoint: u8, length: usize) -> BackendResult<Vec<u8>> {
        self.read(TransferType::Interrupt, endpoint, length)
    }

    fn interrupt_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        self.write(TransferType::Interrupt, endpoint, data)
    }

    fn bulk_in(&self, endpoint: u8, length: usize) -> BackendResult<Vec<u8>> {
        self.read(TransferType::Bulk, endpoint, length)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        self.write(TransferType::Bulk, endpoint, data)
    }

    fn isochronous_in(&self, endpoint: u8, packet_size: usize) -> BackendResult<Vec<u8>> {
        self.read(TransferType::Isochronous, endpoint, packet_size)
    }

    fn isochronous_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        self.write(TransferType::Isochronous, endpoint, data)
    }
}

/// Sample device used throughout the tests (VID 0x1234, PID 0x5678)
///
/// - Configuration 1
///   - interface 0 alt 0: 0x81 interrupt IN (8), 0x02 bulk OUT (64), 0x82 bulk IN (64)
///   - interface 0 alt 1: 0x83 isochronous IN (192), 0x03 isochronous OUT (192)
/// - Configuration 2
///   - interface 0 alt 0: 0x84 bulk IN (512)
pub fn sample_device(key: DeviceKey) -> DiscoveredDevice {
    let mut descriptor = create_mock_device_descriptor(0x1234, 0x5678);
    descriptor.num_configurations = 2;

    DiscoveredDevice {
        key,
        descriptor,
        speed: Speed::High,
        configurations: vec![
            ConfigurationTree {
                descriptor: create_mock_configuration(1),
                interfaces: vec![
                    InterfaceTree {
                        descriptor: create_mock_interface(0, 0),
                        endpoints: vec![
                            create_mock_endpoint(0x81, TransferType::Interrupt, 8),
                            create_mock_endpoint(0x02, TransferType::Bulk, 64),
                            create_mock_endpoint(0x82, TransferType::Bulk, 64),
                        ],
                    },
                    InterfaceTree {
                        descriptor: create_mock_interface(0, 1),
                        endpoints: vec![
                            create_mock_endpoint(0x83, TransferType::Isochronous, 192),
                            create_mock_endpoint(0x03, TransferType::Isochronous, 192),
                        ],
                    },
                ],
            },
            ConfigurationTree {
                descriptor: create_mock_configuration(2),
                interfaces: vec![InterfaceTree {
                    descriptor: create_mock_interface(0, 0),
                    endpoints: vec![create_mock_endpoint(0x84, TransferType::Bulk, 512)],
                }],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: DeviceKey = DeviceKey::new(2, 9);

    fn opened() -> (FakeBackend, Box<dyn DeviceIo>) {
        let backend = FakeBackend::new();
        backend.add_device(sample_device(KEY));
        let io = backend.open(KEY).unwrap();
        (backend, io)
    }

    #[test]
    fn test_loopback() {
        let (_backend, io) = opened();
        assert_eq!(io.bulk_out(0x02, b"hello").unwrap(), 5);
        assert_eq!(io.bulk_in(0x82, 3).unwrap(), b"hel".to_vec());
        assert_eq!(io.bulk_in(0x82, 64).unwrap(), b"lo".to_vec());
        assert!(io.bulk_in(0x82, 64).unwrap().is_empty());
    }

    #[test]
    fn test_queued_response_wins_over_loopback() {
        let (backend, io) = opened();
        io.interrupt_out(0x01, &[9, 9]).unwrap();
        backend.queue_in(KEY, 0x81, vec![1, 2, 3, 4]);
        assert_eq!(io.interrupt_in(0x81, 8).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(io.interrupt_in(0x81, 8).unwrap(), vec![9, 9]);
    }

    #[test]
    fn test_partial_write() {
        let (backend, io) = opened();
        backend.set_write_limit(KEY, 0x02, 2);
        assert_eq!(io.bulk_out(0x02, &[1, 2, 3]).unwrap(), 2);
    }

    #[test]
    fn test_stall_and_clear_halt() {
        let (backend, mut io) = opened();
        backend.stall(KEY, 0x82);
        assert_eq!(io.bulk_in(0x82, 8), Err(BackendError::Stall));
        io.clear_halt(0x82).unwrap();
        assert!(io.bulk_in(0x82, 8).is_ok());
    }

    #[test]
    fn test_disconnect_announces_and_fails_io() {
        let (backend, io) = opened();
        let events = backend.events().unwrap();

        backend.disconnect(KEY);
        assert_eq!(events.try_recv(), Some(UsbEvent::DeviceLeft { key: KEY }));
        assert_eq!(io.bulk_in(0x82, 8), Err(BackendError::NoDevice));
        assert!(backend.list_devices().unwrap().is_empty());
        assert_eq!(backend.open(KEY).err(), Some(BackendError::NoDevice));
    }

    #[test]
    fn test_disconnect_during_transfer() {
        let (backend, io) = opened();
        let events = backend.events().unwrap();

        backend.disconnect_during_next_transfer(KEY);
        // Only transfers trip the wire
        assert_eq!(io.active_configuration(), Ok(Some(1)));
        assert_eq!(io.bulk_out(0x02, &[1]), Err(BackendError::NoDevice));
        assert_eq!(events.try_recv(), Some(UsbEvent::DeviceLeft { key: KEY }));
    }

    #[test]
    fn test_unknown_configuration() {
        let (_backend, mut io) = opened();
        assert_eq!(io.set_configuration(7), Err(BackendError::NotFound));
        assert_eq!(io.set_configuration(2), Ok(()));
        assert_eq!(io.active_configuration(), Ok(Some(2)));
    }

    #[test]
    fn test_in_flight_accounting() {
        let (backend, io) = opened();
        backend.set_transfer_latency(Duration::from_millis(1));
        io.bulk_out(0x02, &[1]).unwrap();
        io.bulk_in(0x82, 1).unwrap();

        assert_eq!(backend.peak_in_flight(KEY, 0x02), 1);
        assert_eq!(backend.peak_in_flight(KEY, 0x82), 1);
        assert_eq!(backend.peak_in_flight(KEY, 0x81), 0);
        assert_eq!(backend.peak_total_in_flight(), 1);
    }

    #[test]
    fn test_calls_recorded() {
        let (backend, io) = opened();
        backend.clear_calls();
        io.interrupt_in(0x81, 8).unwrap();
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Read {
                key: KEY,
                kind: TransferType::Interrupt,
                endpoint: 0x81,
                length: 8
            }]
        );
        assert_eq!(backend.transfer_count(), 1);
    }
}
