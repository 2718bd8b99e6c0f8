//! Caller-facing error taxonomy

use crate::descriptors::{Direction, TransferType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by every host operation
///
/// Validation failures (handle, state, endpoint type and direction) are
/// detected before the OS primitive is invoked. Failures reported by the OS
/// primitive are surfaced as `TransferStalled`, `DeviceDisconnected`,
/// `DeviceBusy`, `TimedOut` or `Io` and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Handle is unknown, already released, or refers to another resource kind
    #[error("invalid resource handle")]
    InvalidHandle,

    /// Parent handle is stale or belongs to another device
    #[error("invalid parent resource")]
    InvalidParent,

    /// Resource still has live children, or is the active configuration
    /// while interfaces are claimed under it
    #[error("resource in use")]
    ResourceInUse,

    /// Operation is not legal in the current device state
    #[error("invalid device state for this operation")]
    InvalidState,

    /// Device is already opened by another owner
    #[error("device busy")]
    DeviceBusy,

    /// No configuration is active on the device
    #[error("device is not configured")]
    NotConfigured,

    #[error("interface {interface} is already claimed")]
    InterfaceAlreadyClaimed { interface: u8 },

    #[error("interface {interface} is not claimed")]
    InterfaceNotClaimed { interface: u8 },

    /// Configuration switch attempted while interfaces are claimed
    #[error("interfaces are still claimed")]
    InterfacesStillClaimed,

    #[error("endpoint {endpoint:#04x} is {actual:?}, expected {expected:?}")]
    WrongEndpointType {
        endpoint: u8,
        expected: TransferType,
        actual: TransferType,
    },

    #[error("endpoint {endpoint:#04x} is {actual:?}, expected {expected:?}")]
    WrongDirection {
        endpoint: u8,
        expected: Direction,
        actual: Direction,
    },

    /// Requested length or buffer exceeds the configured per-call limit
    #[error("transfer of {requested} bytes exceeds limit of {max} bytes")]
    TransferTooLarge { requested: u64, max: u64 },

    /// Endpoint reported STALL; call clear-halt before retrying
    #[error("transfer stalled")]
    TransferStalled,

    /// Transfer timed out (only with a configured transfer timeout)
    #[error("transfer timed out")]
    TimedOut,

    #[error("device disconnected")]
    DeviceDisconnected,

    /// Unclassified OS primitive failure
    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Type alias for host operation results
pub type Result<T> = std::result::Result<T, UsbError>;
