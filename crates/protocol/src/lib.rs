//! Caller-facing contract for the sandboxed USB host
//!
//! This crate defines everything a sandboxed caller sees when it talks to the
//! host engine: the descriptor model, the opaque resource handles, and the
//! error taxonomy. It carries no behavior; the binding layer that marshals
//! calls in and out of the sandbox only needs these types, which is why they
//! all implement `serde::Serialize`/`Deserialize`.
//!
//! # Example
//!
//! ```
//! use protocol::{Direction, EndpointDescriptor, TransferType};
//!
//! let endpoint = EndpointDescriptor {
//!     endpoint_number: 1,
//!     direction: Direction::In,
//!     transfer_type: TransferType::Interrupt,
//!     max_packet_size: 8,
//!     interval: 10,
//! };
//! assert_eq!(endpoint.address(), 0x81);
//! ```

pub mod descriptors;
pub mod error;
pub mod handles;

pub use descriptors::{
    ConfigurationDescriptor, ControlSetup, ControlSetupRecipient, ControlSetupType,
    DeviceDescriptor, Direction, EndpointDescriptor, Filter, InterfaceDescriptor, Speed,
    TransferType,
};
pub use error::{Result, UsbError};
pub use handles::{
    ConfigurationHandle, DeviceHandle, EndpointHandle, Handle, InterfaceHandle, ResourceKind,
};
