//! Host-side USB engine for sandboxed callers
//!
//! A sandboxed caller never sees the OS USB stack. It works with opaque
//! handles to devices, configurations, interfaces and endpoints, and every
//! operation it invokes is checked against the resource tree and the device
//! state before the OS primitive is touched.
//!
//! The crate is organised bottom-up:
//!
//! - [`registry`]: generational handle arena with parent/child ownership
//! - [`state`]: per-device Closed/Open state, active configuration and claims
//! - [`dispatcher`]: transfer validation and routing to the OS primitive
//! - [`enumerator`]: discovery, access control and device filters
//! - [`backend`]: the OS primitive seam (libusb and an in-memory fake)
//! - [`engine`]: [`UsbHost`], the facade exposing every caller operation
//! - [`config`]: TOML configuration for the embedding host
//!
//! # Example
//!
//! ```
//! use common::DeviceKey;
//! use host::backend::fake::{FakeBackend, sample_device};
//! use host::{AllowAll, UsbHost};
//! use protocol::Filter;
//!
//! let backend = FakeBackend::new();
//! backend.add_device(sample_device(DeviceKey::new(1, 4)));
//! let host = UsbHost::with_access_control(backend, AllowAll, 4096);
//!
//! let filter = Filter {
//!     vendor_id: Some(0x1234),
//!     ..Default::default()
//! };
//! let device = host.request_device(&filter).unwrap().unwrap();
//! host.open(device).unwrap();
//! assert!(host.opened(device).unwrap());
//! ```

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod enumerator;
pub mod registry;
pub mod resource;
pub mod state;

pub use backend::{
    BackendError, BackendResult, DeviceIo, DiscoveredDevice, FakeBackend, LibusbBackend,
    UsbBackend,
};
pub use config::{HostConfig, HostSettings, UsbSettings, load_config};
pub use dispatcher::DEFAULT_MAX_TRANSFER_SIZE;
pub use engine::UsbHost;
pub use enumerator::{AccessControl, AccessPolicy, AllowAll};
