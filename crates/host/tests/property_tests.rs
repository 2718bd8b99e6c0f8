//! Property-based tests for the host engine
//!
//! - At most one alternate setting of an interface is claimed at a time
//! - A resource with live children cannot be released
//! - Transfers on the wrong endpoint type or direction never reach the OS

use common::DeviceKey;
use host::backend::fake::{FakeBackend, sample_device};
use host::{AllowAll, UsbHost};
use protocol::{DeviceHandle, EndpointHandle, InterfaceHandle, TransferType, UsbError};
use proptest::prelude::*;

const KEY: DeviceKey = DeviceKey::new(2, 7);

fn open_host() -> (UsbHost<FakeBackend>, DeviceHandle, Vec<InterfaceHandle>) {
    let backend = FakeBackend::new();
    backend.add_device(sample_device(KEY));
    let host = UsbHost::with_access_control(backend, AllowAll, 4096);

    let device = host.enumerate().unwrap()[0];
    host.open(device).unwrap();
    let config = host.active_configuration(device).unwrap();
    let interfaces = host.interfaces(config).unwrap();
    (host, device, interfaces)
}

/// Every endpoint of every alternate setting, paired with its owner
fn owned_endpoints(
    host: &UsbHost<FakeBackend>,
    interfaces: &[InterfaceHandle],
) -> Vec<(InterfaceHandle, EndpointHandle)> {
    interfaces
        .iter()
        .flat_map(|interface| {
            host.endpoints(*interface)
                .unwrap()
                .into_iter()
                .map(move |endpoint| (*interface, endpoint))
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Claim(usize),
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..2).prop_map(Op::Claim),
        (0usize..2).prop_map(Op::Release),
    ]
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Interrupt,
    Bulk,
    Isochronous,
}

impl Kind {
    fn transfer_type(self) -> TransferType {
        match self {
            Kind::Interrupt => TransferType::Interrupt,
            Kind::Bulk => TransferType::Bulk,
            Kind::Isochronous => TransferType::Isochronous,
        }
    }
}

fn kind_strategy() -> impl Strategy<Value = Kind> {
    prop_oneof![
        Just(Kind::Interrupt),
        Just(Kind::Bulk),
        Just(Kind::Isochronous)
    ]
}

proptest! {
    /// Property: after any claim/release sequence at most one alternate
    /// setting of interface 0 can drive its endpoints
    #[test]
    fn prop_single_claim_per_interface(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        let (host, device, interfaces) = open_host();
        let mut current: Option<usize> = None;

        for op in ops {
            match op {
                Op::Claim(alt) => {
                    let result = host.claim_interface(device, interfaces[alt]);
                    if current == Some(alt) {
                        prop_assert_eq!(result, Err(UsbError::InterfaceAlreadyClaimed { interface: 0 }));
                    } else {
                        prop_assert_eq!(result, Ok(()));
                        current = Some(alt);
                    }
                }
                Op::Release(alt) => {
                    let result = host.release_interface(device, interfaces[alt]);
                    if current == Some(alt) {
                        prop_assert_eq!(result, Ok(()));
                        current = None;
                    } else {
                        prop_assert_eq!(result, Err(UsbError::InterfaceNotClaimed { interface: 0 }));
                    }
                }
            }

            // Only endpoints of the current claim pass the claim check
            for (alt, interface) in interfaces.iter().enumerate() {
                for endpoint in host.endpoints(*interface).unwrap() {
                    let claimed_check = host.clear_halt(device, endpoint);
                    if current == Some(alt) {
                        prop_assert_eq!(claimed_check, Ok(()));
                    } else {
                        prop_assert_eq!(claimed_check, Err(UsbError::InterfaceNotClaimed { interface: 0 }));
                    }
                }
            }
        }
    }

    /// Property: a parent is never released while any child is alive, and
    /// becomes releasable once every child is gone
    #[test]
    fn prop_parent_outlives_children(order in Just((0usize..6).collect::<Vec<_>>()).prop_shuffle()) {
        let backend = FakeBackend::new();
        backend.add_device(sample_device(KEY));
        let host = UsbHost::with_access_control(backend, AllowAll, 4096);

        let device = host.enumerate().unwrap()[0];
        let configs = host.configurations(device).unwrap();
        let (config, second_config) = (configs[0], configs[1]);
        let interfaces = host.interfaces(config).unwrap();
        let (interface, extra_interface) = (interfaces[0], interfaces[1]);
        let endpoints = host.endpoints(interface).unwrap();

        // Drop attempts in shuffled order, repeated until every slot is gone
        let mut alive = [true; 6];
        let mut remaining = 6;
        while remaining > 0 {
            for &slot in &order {
                if !alive[slot] {
                    continue;
                }
                let result = match slot {
                    0..=2 => host.drop_endpoint(endpoints[slot]),
                    3 => host.drop_interface(interface),
                    4 => host.drop_interface(extra_interface),
                    _ => host.drop_configuration(second_config),
                };
                let has_children = match slot {
                    3 => alive[0] || alive[1] || alive[2],
                    _ => false,
                };
                if has_children {
                    prop_assert_eq!(result, Err(UsbError::ResourceInUse));
                } else {
                    prop_assert_eq!(result, Ok(()));
                    alive[slot] = false;
                    remaining -= 1;
                }
            }
        }

        prop_assert_eq!(host.drop_device(device), Err(UsbError::ResourceInUse));
        prop_assert_eq!(host.drop_configuration(config), Ok(()));
        prop_assert_eq!(host.drop_device(device), Ok(()));
        prop_assert_eq!(host.device_descriptor(device), Err(UsbError::InvalidHandle));
    }

    /// Property: a transfer whose kind or direction disagrees with the
    /// endpoint descriptor fails before any OS transfer is submitted
    #[test]
    fn prop_mismatched_transfers_never_submitted(
        kind in kind_strategy(),
        read in any::<bool>(),
        pick in any::<prop::sample::Index>(),
        length in 0u64..256,
    ) {
        let (host, device, interfaces) = open_host();
        let owned = owned_endpoints(&host, &interfaces);
        let (owner, endpoint) = owned[pick.index(owned.len())];
        let descriptor = host.endpoint_descriptor(endpoint).unwrap();

        // Claim the setting that owns the endpoint so only type and
        // direction can fail
        host.claim_interface(device, owner).unwrap();

        let inbound = descriptor.direction == protocol::Direction::In;
        prop_assume!(descriptor.transfer_type != kind.transfer_type() || inbound != read);

        let payload = vec![0u8; length as usize];
        let error = match (kind, read) {
            (Kind::Interrupt, true) => host.read_interrupt(device, endpoint, length).unwrap_err(),
            (Kind::Interrupt, false) => host.write_interrupt(device, endpoint, &payload).unwrap_err(),
            (Kind::Bulk, true) => host.read_bulk(device, endpoint, length).unwrap_err(),
            (Kind::Bulk, false) => host.write_bulk(device, endpoint, &payload).unwrap_err(),
            (Kind::Isochronous, true) => host.read_isochronous(device, endpoint).unwrap_err(),
            (Kind::Isochronous, false) => host.write_isochronous(device, endpoint, &payload).unwrap_err(),
        };

        let expected_type_error = descriptor.transfer_type != kind.transfer_type();
        prop_assert_eq!(
            matches!(error, UsbError::WrongEndpointType { .. }),
            expected_type_error
        );
        prop_assert_eq!(
            matches!(error, UsbError::WrongDirection { .. }),
            !expected_type_error
        );
        prop_assert_eq!(host.backend().transfer_count(), 0);
    }
}
