//! Common utilities for the USB host
//!
//! This crate provides functionality shared by the host engine and its
//! embedders: the ambient error type, logging setup, the disconnect event
//! channel between the OS event thread and the engine, the physical device
//! key, and test utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{EventReceiver, EventSender, UsbEvent, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::DeviceKey;
