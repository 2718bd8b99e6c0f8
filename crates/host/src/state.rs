//! Device state machine
//!
//! `Closed` until opened; while `Open` the state tracks the active
//! configuration and the claimed interfaces. Claims are keyed by interface
//! number so that only one alternate setting per number can ever be claimed.

use crate::backend::DeviceIo;
use protocol::{InterfaceDescriptor, InterfaceHandle, Result, UsbError};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The alternate setting currently claimed for one interface number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub handle: InterfaceHandle,
    pub alternate_setting: u8,
}

/// Outcome of a successful claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another alternate setting of the same interface number was released
    Superseded(InterfaceHandle),
}

pub enum DeviceState {
    Closed,
    Open(OpenDevice),
}

impl DeviceState {
    pub fn is_open(&self) -> bool {
        matches!(self, DeviceState::Open(_))
    }

    /// Transition to `Open` around a freshly opened OS handle
    pub fn open(&mut self, io: Box<dyn DeviceIo>) -> Result<()> {
        if self.is_open() {
            return Err(UsbError::InvalidState);
        }

        let active_configuration = match io.active_configuration() {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read active configuration: {}", e);
                None
            }
        };

        *self = DeviceState::Open(OpenDevice {
            io,
            active_configuration,
            claims: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn opened(&self) -> Result<&OpenDevice> {
        match self {
            DeviceState::Open(open) => Ok(open),
            DeviceState::Closed => Err(UsbError::InvalidState),
        }
    }

    pub fn opened_mut(&mut self) -> Result<&mut OpenDevice> {
        match self {
            DeviceState::Open(open) => Ok(open),
            DeviceState::Closed => Err(UsbError::InvalidState),
        }
    }

    /// Release every claim and drop the OS handle
    pub fn close(&mut self) -> Result<()> {
        let DeviceState::Open(mut open) = std::mem::replace(self, DeviceState::Closed) else {
            return Err(UsbError::InvalidState);
        };
        open.release_all();
        Ok(())
    }

    /// Drop the OS handle without talking to the device
    pub fn abandon(&mut self) {
        *self = DeviceState::Closed;
    }
}

pub struct OpenDevice {
    io: Box<dyn DeviceIo>,
    active_configuration: Option<u8>,
    claims: BTreeMap<u8, Claim>,
}

impl OpenDevice {
    pub fn io(&self) -> &dyn DeviceIo {
        self.io.as_ref()
    }

    pub fn active_configuration(&self) -> Option<u8> {
        self.active_configuration
    }

    pub fn claim(&self, interface_number: u8) -> Option<&Claim> {
        self.claims.get(&interface_number)
    }

    pub fn claims(&self) -> impl Iterator<Item = (u8, &Claim)> {
        self.claims.iter().map(|(number, claim)| (*number, claim))
    }

    pub fn has_claims(&self) -> bool {
        !self.claims.is_empty()
    }

    pub fn is_claimed(&self, interface_number: u8, handle: InterfaceHandle) -> bool {
        self.claim(interface_number)
            .is_some_and(|claim| claim.handle == handle)
    }

    /// Reset the device; every claim is dropped and must be re-made
    pub fn reset(&mut self) -> Result<()> {
        self.release_all();
        self.io.reset()?;
        debug!("Device reset");
        Ok(())
    }

    pub fn select_configuration(&mut self, value: u8) -> Result<()> {
        if self.has_claims() {
            return Err(UsbError::InterfacesStillClaimed);
        }

        self.io.set_configuration(value)?;
        self.active_configuration = Some(value);
        Ok(())
    }

    /// Claim one alternate setting of an interface of configuration `configuration`
    pub fn claim_interface(
        &mut self,
        handle: InterfaceHandle,
        configuration: u8,
        descriptor: &InterfaceDescriptor,
    ) -> Result<ClaimOutcome> {
        let Some(active) = self.active_configuration else {
            return Err(UsbError::NotConfigured);
        };
        if active != configuration {
            return Err(UsbError::InvalidState);
        }

        let number = descriptor.interface_number;
        let setting = descriptor.alternate_setting;

        let outcome = match self.claims.get(&number) {
            Some(claim) if claim.handle == handle || claim.alternate_setting == setting => {
                return Err(UsbError::InterfaceAlreadyClaimed { interface: number });
            }
            Some(claim) => {
                let previous = claim.handle;
                self.io.set_alternate_setting(number, setting)?;
                debug!(
                    "Interface {} switched from alternate setting {} to {}",
                    number, claim.alternate_setting, setting
                );
                ClaimOutcome::Superseded(previous)
            }
            None => {
                self.io.claim_interface(number)?;
                if let Err(e) = self.io.set_alternate_setting(number, setting) {
                    if let Err(release_err) = self.io.release_interface(number) {
                        warn!("Failed to release interface {}: {}", number, release_err);
                    }
                    return Err(e.into());
                }
                debug!("Claimed interface {} alternate setting {}", number, setting);
                ClaimOutcome::Claimed
            }
        };

        self.claims.insert(
            number,
            Claim {
                handle,
                alternate_setting: setting,
            },
        );
        Ok(outcome)
    }

    pub fn release_interface(&mut self, handle: InterfaceHandle, interface_number: u8) -> Result<()> {
        if !self.is_claimed(interface_number, handle) {
            return Err(UsbError::InterfaceNotClaimed {
                interface: interface_number,
            });
        }

        self.claims.remove(&interface_number);
        self.io.release_interface(interface_number)?;
        debug!("Released interface {}", interface_number);
        Ok(())
    }

    /// Clear a halt on an endpoint of a claimed interface
    pub fn clear_halt(
        &mut self,
        owner: InterfaceHandle,
        interface_number: u8,
        endpoint: u8,
    ) -> Result<()> {
        if !self.is_claimed(interface_number, owner) {
            return Err(UsbError::InterfaceNotClaimed {
                interface: interface_number,
            });
        }

        self.io.clear_halt(endpoint)?;
        debug!("Cleared halt on endpoint {:#04x}", endpoint);
        Ok(())
    }

    fn release_all(&mut self) {
        for number in std::mem::take(&mut self.claims).into_keys() {
            if let Err(e) = self.io.release_interface(number) {
                warn!("Failed to release interface {}: {}", number, e);
            }
        }
    }
}
