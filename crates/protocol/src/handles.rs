//! Opaque resource handles
//!
//! Handles are arena slot indices paired with a generation counter. A handle
//! stays unique for the lifetime of the host: once its slot is reused the
//! generation differs and the old handle no longer resolves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Untyped arena handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Kind of resource a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Device,
    Configuration,
    Interface,
    Endpoint,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Configuration => write!(f, "configuration"),
            Self::Interface => write!(f, "interface"),
            Self::Endpoint => write!(f, "endpoint"),
        }
    }
}

macro_rules! resource_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Handle);

        impl $name {
            /// Resource kind this handle type refers to
            pub const KIND: ResourceKind = $kind;

            pub fn raw(self) -> Handle {
                self.0
            }
        }

        impl From<Handle> for $name {
            fn from(handle: Handle) -> Self {
                Self(handle)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} {}", Self::KIND, self.0)
            }
        }
    };
}

resource_handle!(
    /// Root resource: one enumerated device
    DeviceHandle,
    ResourceKind::Device
);
resource_handle!(
    /// Child of a device: one configuration
    ConfigurationHandle,
    ResourceKind::Configuration
);
resource_handle!(
    /// Child of a configuration: one alternate setting of one interface
    InterfaceHandle,
    ResourceKind::Interface
);
resource_handle!(
    /// Child of an interface: one endpoint
    EndpointHandle,
    ResourceKind::Endpoint
);
