//! Transfer dispatcher
//!
//! Every transfer is validated before the OS primitive sees it, in this order:
//! device open, endpoint belongs to the device, owning interface claimed,
//! endpoint transfer type, endpoint direction, size limit. Only then is the
//! per-endpoint lock taken and the primitive invoked. Nothing is retried.

use crate::resource::{DeviceNode, EndpointRef, ensure_same_device};
use crate::state::DeviceState;
use protocol::{ControlSetup, Direction, EndpointDescriptor, Result, TransferType, UsbError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default per-call transfer size limit (4 MiB)
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 4 * 1024 * 1024;

/// Endpoint transfer kinds reachable through a claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Interrupt,
    Bulk,
    Isochronous,
}

impl TransferKind {
    pub fn transfer_type(self) -> TransferType {
        match self {
            TransferKind::Interrupt => TransferType::Interrupt,
            TransferKind::Bulk => TransferType::Bulk,
            TransferKind::Isochronous => TransferType::Isochronous,
        }
    }
}

/// Bytes per isochronous packet, including high-bandwidth extra transactions
pub fn isochronous_packet_size(endpoint: &EndpointDescriptor) -> usize {
    let raw = endpoint.max_packet_size;
    let base = usize::from(raw & 0x07ff);
    let transactions = 1 + usize::from((raw >> 11) & 0x03);
    base * transactions
}

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    max_transfer_size: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSFER_SIZE)
    }
}

impl Dispatcher {
    pub fn new(max_transfer_size: usize) -> Self {
        Self { max_transfer_size }
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    /// Run every precondition for an endpoint transfer
    ///
    /// Returns the endpoint address on success.
    pub fn validate(
        &self,
        device: &Arc<DeviceNode>,
        state: &DeviceState,
        endpoint: &EndpointRef,
        kind: TransferKind,
        direction: Direction,
    ) -> Result<u8> {
        let open = state.opened()?;
        ensure_same_device(device, &endpoint.device)?;

        let interface_number = endpoint.interface_number();
        if !open.is_claimed(interface_number, endpoint.interface) {
            return Err(UsbError::InterfaceNotClaimed {
                interface: interface_number,
            });
        }

        let descriptor = endpoint.descriptor();
        let address = descriptor.address();
        let expected = kind.transfer_type();
        if descriptor.transfer_type != expected {
            return Err(UsbError::WrongEndpointType {
                endpoint: address,
                expected,
                actual: descriptor.transfer_type,
            });
        }
        if descriptor.direction != direction {
            return Err(UsbError::WrongDirection {
                endpoint: address,
                expected: direction,
                actual: descriptor.direction,
            });
        }

        Ok(address)
    }

    /// Read from an IN endpoint
    ///
    /// `length` is ignored for isochronous endpoints: one packet of the
    /// endpoint's packet size is requested.
    pub fn read(
        &self,
        device: &Arc<DeviceNode>,
        state: &DeviceState,
        endpoint: &EndpointRef,
        kind: TransferKind,
        length: u64,
    ) -> Result<Vec<u8>> {
        let address = self.validate(device, state, endpoint, kind, Direction::In)?;
        let length = match kind {
            TransferKind::Isochronous => isochronous_packet_size(endpoint.descriptor()),
            _ => self.check_size(length)?,
        };

        let io = state.opened()?.io();
        let _guard = device.lock_endpoint(address);
        debug!(
            "{:?} IN transfer: endpoint={:#04x}, length={}",
            kind, address, length
        );

        let result = match kind {
            TransferKind::Interrupt => io.interrupt_in(address, length),
            TransferKind::Bulk => io.bulk_in(address, length),
            TransferKind::Isochronous => io.isochronous_in(address, length),
        };

        match result {
            Ok(mut data) => {
                data.truncate(length);
                debug!("{:?} IN transfer succeeded: {} bytes", kind, data.len());
                Ok(data)
            }
            Err(e) => {
                warn!("{:?} IN transfer on {:#04x} failed: {}", kind, address, e);
                Err(e.into())
            }
        }
    }

    /// Write to an OUT endpoint, returning the number of bytes accepted
    pub fn write(
        &self,
        device: &Arc<DeviceNode>,
        state: &DeviceState,
        endpoint: &EndpointRef,
        kind: TransferKind,
        data: &[u8],
    ) -> Result<u64> {
        let address = self.validate(device, state, endpoint, kind, Direction::Out)?;
        match kind {
            TransferKind::Isochronous => {
                let packet_size = isochronous_packet_size(endpoint.descriptor());
                if data.len() > packet_size {
                    return Err(UsbError::TransferTooLarge {
                        requested: data.len() as u64,
                        max: packet_size as u64,
                    });
                }
            }
            _ => {
                self.check_size(data.len() as u64)?;
            }
        }

        let io = state.opened()?.io();
        let _guard = device.lock_endpoint(address);
        debug!(
            "{:?} OUT transfer: endpoint={:#04x}, data_len={}",
            kind,
            address,
            data.len()
        );

        let result = match kind {
            TransferKind::Interrupt => io.interrupt_out(address, data),
            TransferKind::Bulk => io.bulk_out(address, data),
            TransferKind::Isochronous => io.isochronous_out(address, data),
        };

        match result {
            Ok(written) => {
                debug!("{:?} OUT transfer succeeded: {} bytes", kind, written);
                Ok(written.min(data.len()) as u64)
            }
            Err(e) => {
                warn!("{:?} OUT transfer on {:#04x} failed: {}", kind, address, e);
                Err(e.into())
            }
        }
    }

    /// Control read on the default endpoint; needs only an open device
    pub fn read_control(
        &self,
        device: &DeviceNode,
        state: &DeviceState,
        setup: &ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>> {
        let open = state.opened()?;
        self.check_size(u64::from(length))?;

        let request_type = setup.request_type_byte(Direction::In);
        let _guard = device.lock_endpoint(0x80);
        debug!(
            "Control IN transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, length={}",
            request_type, setup.request, setup.value, setup.index, length
        );

        match open
            .io()
            .control_in(request_type, setup.request, setup.value, setup.index, length)
        {
            Ok(mut data) => {
                data.truncate(usize::from(length));
                Ok(data)
            }
            Err(e) => {
                warn!("Control IN transfer failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Control write on the default endpoint; returns bytes accepted
    pub fn write_control(
        &self,
        device: &DeviceNode,
        state: &DeviceState,
        setup: &ControlSetup,
        data: &[u8],
    ) -> Result<u64> {
        let open = state.opened()?;
        // wLength is 16 bits wide
        let limit = self.max_transfer_size.min(usize::from(u16::MAX));
        if data.len() > limit {
            return Err(UsbError::TransferTooLarge {
                requested: data.len() as u64,
                max: limit as u64,
            });
        }

        let request_type = setup.request_type_byte(Direction::Out);
        let _guard = device.lock_endpoint(0x00);
        debug!(
            "Control OUT transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, data_len={}",
            request_type,
            setup.request,
            setup.value,
            setup.index,
            data.len()
        );

        match open
            .io()
            .control_out(request_type, setup.request, setup.value, setup.index, data)
        {
            Ok(written) => Ok(written.min(data.len()) as u64),
            Err(e) => {
                warn!("Control OUT transfer failed: {}", e);
                Err(e.into())
            }
        }
    }

    fn check_size(&self, requested: u64) -> Result<usize> {
        if requested > self.max_transfer_size as u64 {
            return Err(UsbError::TransferTooLarge {
                requested,
                max: self.max_transfer_size as u64,
            });
        }
        Ok(requested as usize)
    }
}
