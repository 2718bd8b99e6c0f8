//! libusb backend
//!
//! Talks to the OS USB stack through `rusb`. Descriptor trees are read at
//! enumeration time with a short-lived handle for the string descriptors.
//! Removal is observed through libusb hotplug callbacks, which run on a
//! dedicated event thread and are forwarded over the event bridge.
//!
//! Control, interrupt and bulk transfers use the synchronous `rusb` calls.
//! `rusb` has no isochronous API, so single-packet isochronous transfers are
//! submitted through the raw libusb asynchronous interface and waited on
//! with `libusb_handle_events_completed`.

use super::{
    BackendError, BackendResult, ConfigurationTree, DeviceIo, DiscoveredDevice, InterfaceTree,
    UsbBackend,
};
use crate::config::UsbSettings;
use common::{DeviceKey, EventReceiver, EventSender, UsbEvent, create_event_bridge};
use protocol::{
    ConfigurationDescriptor, DeviceDescriptor, Direction, EndpointDescriptor, InterfaceDescriptor,
    Speed, TransferType,
};
use rusb::constants::{
    LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE,
    LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE, LIBUSB_TRANSFER_STALL,
    LIBUSB_TRANSFER_TIMED_OUT, LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
};
use rusb::{
    Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext, ffi,
};
use std::os::raw::{c_int, c_uint};
use std::ptr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long one `handle_events` call may block before the running flag is rechecked
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Map rusb errors to backend errors
pub fn map_rusb_error(err: rusb::Error) -> BackendError {
    match err {
        rusb::Error::Pipe => BackendError::Stall,
        rusb::Error::NoDevice => BackendError::NoDevice,
        rusb::Error::Busy => BackendError::Busy,
        rusb::Error::Access => BackendError::Access,
        rusb::Error::NotFound => BackendError::NotFound,
        rusb::Error::Timeout => BackendError::Timeout,
        _ => BackendError::Other(err.to_string()),
    }
}

/// Map a raw `LIBUSB_ERROR_*` code to a backend error
fn map_libusb_code(code: c_int) -> BackendError {
    match code {
        LIBUSB_ERROR_PIPE => BackendError::Stall,
        LIBUSB_ERROR_NO_DEVICE => BackendError::NoDevice,
        LIBUSB_ERROR_BUSY => BackendError::Busy,
        LIBUSB_ERROR_ACCESS => BackendError::Access,
        LIBUSB_ERROR_NOT_FOUND => BackendError::NotFound,
        LIBUSB_ERROR_TIMEOUT => BackendError::Timeout,
        other => BackendError::Other(format!("libusb error {}", other)),
    }
}

fn map_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

fn map_direction(direction: rusb::Direction) -> Direction {
    match direction {
        rusb::Direction::In => Direction::In,
        rusb::Direction::Out => Direction::Out,
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> TransferType {
    match transfer_type {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}

fn version_triple(version: rusb::Version) -> (u8, u8, u8) {
    (version.major(), version.minor(), version.sub_minor())
}

fn device_key<T: UsbContext>(device: &Device<T>) -> DeviceKey {
    DeviceKey::new(device.bus_number(), device.address())
}

/// libusb timeouts are milliseconds, 0 meaning unlimited
fn timeout_millis(timeout: Duration) -> c_uint {
    c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX)
}

/// Forwards hotplug removals to the engine
struct RemovalWatcher {
    events: EventSender,
}

impl<T: UsbContext> Hotplug<T> for RemovalWatcher {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!("Device arrived: {}", device_key(&device));
    }

    fn device_left(&mut self, device: Device<T>) {
        let key = device_key(&device);
        info!("Device left: {}", key);
        if let Err(e) = self.events.publish(UsbEvent::DeviceLeft { key }) {
            warn!("Failed to publish removal of {}: {}", key, e);
        }
    }
}

/// Thread driving libusb events so hotplug callbacks fire
struct EventThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    fn spawn(context: Context) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || {
                debug!("libusb event thread started");
                while flag.load(Ordering::Acquire) {
                    match context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(e) => {
                            warn!("Error handling USB events: {}", e);
                            std::thread::sleep(EVENT_POLL_INTERVAL);
                        }
                    }
                }
                debug!("libusb event thread stopped");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("libusb event thread panicked");
        }
    }
}

/// Backend over the OS USB stack
pub struct LibusbBackend {
    context: Context,
    /// Per-transfer timeout; zero waits indefinitely
    timeout: Duration,
    events: EventReceiver,
    // Field order matters: the event thread must stop before the
    // registration is dropped. The registration owns a callback that is
    // only `Send`, so it sits behind a mutex to keep the backend `Sync`.
    _event_thread: Option<EventThread>,
    _hotplug_registration: Mutex<Option<Registration<Context>>>,
}

impl LibusbBackend {
    /// Create a libusb context and start watching for removals
    ///
    /// `None` for the timeout lets transfers wait indefinitely. On platforms
    /// without hotplug support removals are still detected when the next
    /// operation on the device fails.
    pub fn new(timeout: Option<Duration>) -> BackendResult<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        let (sender, events) = create_event_bridge();

        let (registration, event_thread) = if rusb::has_hotplug() {
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(RemovalWatcher { events: sender }))
                .map_err(map_rusb_error)?;
            let event_thread = EventThread::spawn(context.clone())
                .map_err(|e| BackendError::Other(format!("failed to spawn event thread: {}", e)))?;
            debug!("Hot-plug callbacks registered");
            (Some(registration), Some(event_thread))
        } else {
            warn!("libusb has no hotplug support; removals are detected lazily");
            (None, None)
        };

        Ok(Self {
            context,
            timeout: timeout.unwrap_or(Duration::ZERO),
            events,
            _event_thread: event_thread,
            _hotplug_registration: Mutex::new(registration),
        })
    }

    pub fn from_settings(settings: &UsbSettings) -> BackendResult<Self> {
        Self::new(settings.transfer_timeout)
    }

    fn find_device(&self, key: DeviceKey) -> BackendResult<Device<Context>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|device| device_key(device) == key)
            .ok_or(BackendError::NoDevice)
    }
}

impl UsbBackend for LibusbBackend {
    fn list_devices(&self) -> BackendResult<Vec<DiscoveredDevice>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut discovered = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            match describe_device(&device) {
                Ok(info) => discovered.push(info),
                Err(e) => warn!("Skipping device {}: {}", device_key(&device), e),
            }
        }

        Ok(discovered)
    }

    fn active_configuration(&self, key: DeviceKey) -> BackendResult<Option<u8>> {
        let device = self.find_device(key)?;
        match device.active_config_descriptor() {
            Ok(config) => Ok(Some(config.number())),
            Err(rusb::Error::NotFound) => Ok(None),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn open(&self, key: DeviceKey) -> BackendResult<Box<dyn DeviceIo>> {
        let device = self.find_device(key)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", key, e);
            map_rusb_error(e)
        })?;

        // Not supported on every platform
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Auto-detach of kernel drivers unavailable for {}: {}", key, e);
        }

        info!("Opened device {}", key);
        Ok(Box::new(LibusbDeviceIo {
            key,
            handle,
            timeout: self.timeout,
        }))
    }

    fn events(&self) -> Option<EventReceiver> {
        Some(self.events.clone())
    }
}

/// Read the full descriptor tree of a device
fn describe_device(device: &Device<Context>) -> rusb::Result<DiscoveredDevice> {
    let descriptor = device.device_descriptor()?;

    // Strings need an open handle; devices we may not open still enumerate
    let handle = device
        .open()
        .map_err(|e| debug!("No string descriptors for {}: {}", device_key(device), e))
        .ok();
    let read_string = |index: Option<u8>| {
        let handle = handle.as_ref()?;
        handle.read_string_descriptor_ascii(index?).ok()
    };

    let mut configurations = Vec::with_capacity(usize::from(descriptor.num_configurations()));
    for index in 0..descriptor.num_configurations() {
        let config = device.config_descriptor(index)?;
        let interfaces = config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .map(|setting| InterfaceTree {
                descriptor: InterfaceDescriptor {
                    interface_number: setting.interface_number(),
                    alternate_setting: setting.setting_number(),
                    interface_class: setting.class_code(),
                    interface_subclass: setting.sub_class_code(),
                    interface_protocol: setting.protocol_code(),
                    interface_name: read_string(setting.description_string_index()),
                },
                endpoints: setting
                    .endpoint_descriptors()
                    .map(|endpoint| EndpointDescriptor {
                        endpoint_number: endpoint.number(),
                        direction: map_direction(endpoint.direction()),
                        transfer_type: map_transfer_type(endpoint.transfer_type()),
                        max_packet_size: endpoint.max_packet_size(),
                        interval: endpoint.interval(),
                    })
                    .collect(),
            })
            .collect();

        configurations.push(ConfigurationTree {
            descriptor: ConfigurationDescriptor {
                number: config.number(),
                description: read_string(config.description_string_index()),
                self_powered: config.self_powered(),
                remote_wakeup: config.remote_wakeup(),
                max_power: config.max_power(),
            },
            interfaces,
        });
    }

    Ok(DiscoveredDevice {
        key: device_key(device),
        descriptor: DeviceDescriptor {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device_class: descriptor.class_code(),
            device_subclass: descriptor.sub_class_code(),
            device_protocol: descriptor.protocol_code(),
            manufacturer_name: read_string(descriptor.manufacturer_string_index()),
            product_name: read_string(descriptor.product_string_index()),
            serial_number: read_string(descriptor.serial_number_string_index()),
            device_version: version_triple(descriptor.device_version()),
            usb_version: version_triple(descriptor.usb_version()),
            max_packet_size: descriptor.max_packet_size(),
            num_configurations: descriptor.num_configurations(),
        },
        speed: map_speed(device.speed()),
        configurations,
    })
}

/// An opened libusb device
struct LibusbDeviceIo {
    key: DeviceKey,
    handle: DeviceHandle<Context>,
    timeout: Duration,
}

impl LibusbDeviceIo {
    /// Detach kernel drivers from the interfaces of the active configuration
    fn detach_kernel_drivers(&mut self) {
        let Ok(config) = self.handle.device().active_config_descriptor() else {
            return;
        };
        for interface in config.interfaces() {
            let number = interface.number();
            if let Ok(true) = self.handle.kernel_driver_active(number)
                && let Err(e) = self.handle.detach_kernel_driver(number)
            {
                warn!(
                    "Failed to detach kernel driver from {} interface {}: {}",
                    self.key, number, e
                );
            }
        }
    }

    fn read_with(
        &self,
        length: usize,
        read: impl FnOnce(&mut [u8]) -> rusb::Result<usize>,
    ) -> BackendResult<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        let received = read(&mut buffer).map_err(map_rusb_error)?;
        buffer.truncate(received);
        Ok(buffer)
    }
}

impl DeviceIo for LibusbDeviceIo {
    fn active_configuration(&self) -> BackendResult<Option<u8>> {
        match self.handle.active_configuration() {
            Ok(0) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn set_configuration(&mut self, value: u8) -> BackendResult<()> {
        self.detach_kernel_drivers();
        self.handle
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, interface: u8) -> BackendResult<()> {
        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, interface: u8) -> BackendResult<()> {
        self.handle
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> BackendResult<()> {
        self.handle
            .set_alternate_setting(interface, setting)
            .map_err(map_rusb_error)
    }

    fn reset(&mut self) -> BackendResult<()> {
        self.handle.reset().map_err(map_rusb_error)
    }

    fn clear_halt(&mut self, endpoint: u8) -> BackendResult<()> {
        self.handle.clear_halt(endpoint).map_err(map_rusb_error)
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> BackendResult<Vec<u8>> {
        self.read_with(usize::from(length), |buffer| {
            self.handle
                .read_control(request_type, request, value, index, buffer, self.timeout)
        })
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> BackendResult<usize> {
        self.handle
            .write_control(request_type, request, value, index, data, self.timeout)
            .map_err(map_rusb_error)
    }

    fn interrupt_in(&self, endpoint: u8, length: usize) -> BackendResult<Vec<u8>> {
        self.read_with(length, |buffer| {
            self.handle.read_interrupt(endpoint, buffer, self.timeout)
        })
    }

    fn interrupt_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        self.handle
            .write_interrupt(endpoint, data, self.timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_in(&self, endpoint: u8, length: usize) -> BackendResult<Vec<u8>> {
        self.read_with(length, |buffer| {
            self.handle.read_bulk(endpoint, buffer, self.timeout)
        })
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        self.handle
            .write_bulk(endpoint, data, self.timeout)
            .map_err(map_rusb_error)
    }

    fn isochronous_in(&self, endpoint: u8, packet_size: usize) -> BackendResult<Vec<u8>> {
        let mut buffer = vec![0u8; packet_size];
        let received = isochronous_transfer(&self.handle, endpoint, &mut buffer, self.timeout)?;
        buffer.truncate(received);
        Ok(buffer)
    }

    fn isochronous_out(&self, endpoint: u8, data: &[u8]) -> BackendResult<usize> {
        // libusb wants a mutable buffer even for OUT transfers
        let mut buffer = data.to_vec();
        isochronous_transfer(&self.handle, endpoint, &mut buffer, self.timeout)
    }
}

extern "system" fn mark_completed(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data is the completion flag set up by isochronous_transfer,
    // which stays alive until this callback has run.
    unsafe {
        let completed = (*transfer).user_data.cast::<c_int>();
        ptr::write_volatile(completed, 1);
    }
}

/// Submit one single-packet isochronous transfer and wait for it
///
/// Returns the number of bytes the packet carried. A packet-level error
/// still completes the transfer and shows up as a short result.
fn isochronous_transfer(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buffer: &mut [u8],
    timeout: Duration,
) -> BackendResult<usize> {
    let length = c_int::try_from(buffer.len())
        .map_err(|_| BackendError::Other("isochronous packet too large".to_string()))?;

    // SAFETY: allocates a transfer with room for one packet descriptor
    let transfer = unsafe { ffi::libusb_alloc_transfer(1) };
    if transfer.is_null() {
        return Err(BackendError::Other(
            "failed to allocate isochronous transfer".to_string(),
        ));
    }

    let mut completed: c_int = 0;
    let completed_ptr = ptr::addr_of_mut!(completed);

    // SAFETY: transfer is non-null and exclusively ours until submitted;
    // iso_packet_desc has room for the one packet requested above.
    unsafe {
        (*transfer).dev_handle = handle.as_raw();
        (*transfer).endpoint = endpoint;
        (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
        (*transfer).timeout = timeout_millis(timeout);
        (*transfer).buffer = buffer.as_mut_ptr();
        (*transfer).length = length;
        (*transfer).num_iso_packets = 1;
        (*transfer).callback = mark_completed;
        (*transfer).user_data = completed_ptr.cast();

        let packet = ptr::addr_of_mut!((*transfer).iso_packet_desc)
            .cast::<ffi::libusb_iso_packet_descriptor>();
        (*packet).length = length as c_uint;
        (*packet).actual_length = 0;
        (*packet).status = 0;
    }

    // SAFETY: transfer is fully initialized
    let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
    if rc != 0 {
        // SAFETY: never submitted, so libusb holds no reference to it
        unsafe { ffi::libusb_free_transfer(transfer) };
        return Err(map_libusb_code(rc));
    }

    let context = handle.context().as_raw();
    let mut cancelled = false;
    // SAFETY: completed lives on this frame until the loop observes the
    // callback; buffer and transfer stay valid for the same span.
    while unsafe { ptr::read_volatile(completed_ptr) } == 0 {
        let rc = unsafe { ffi::libusb_handle_events_completed(context, completed_ptr) };
        if rc != 0 && rc != LIBUSB_ERROR_INTERRUPTED && !cancelled {
            warn!("Event handling failed during isochronous transfer: {}", rc);
            // The callback still runs after a cancel, so keep waiting for it
            unsafe { ffi::libusb_cancel_transfer(transfer) };
            cancelled = true;
        }
    }

    // SAFETY: the callback has run, libusb no longer touches the transfer
    let (status, packet_status, actual_length) = unsafe {
        let packet = ptr::addr_of!((*transfer).iso_packet_desc)
            .cast::<ffi::libusb_iso_packet_descriptor>();
        let result = ((*transfer).status, (*packet).status, (*packet).actual_length);
        ffi::libusb_free_transfer(transfer);
        result
    };

    match status {
        LIBUSB_TRANSFER_COMPLETED => {
            if packet_status != LIBUSB_TRANSFER_COMPLETED {
                debug!(
                    "Isochronous packet on endpoint 0x{:02x} finished with status {}",
                    endpoint, packet_status
                );
            }
            Ok((actual_length as usize).min(buffer.len()))
        }
        LIBUSB_TRANSFER_STALL => Err(BackendError::Stall),
        LIBUSB_TRANSFER_NO_DEVICE => Err(BackendError::NoDevice),
        LIBUSB_TRANSFER_TIMED_OUT => Err(BackendError::Timeout),
        LIBUSB_TRANSFER_CANCELLED => Err(BackendError::Other(
            "isochronous transfer cancelled".to_string(),
        )),
        other => Err(BackendError::Other(format!(
            "isochronous transfer failed with status {}",
            other
        ))),
    }
}
