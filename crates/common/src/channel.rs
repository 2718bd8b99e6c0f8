//! Event channel between the OS event thread and the host engine
//!
//! OS backends observe device removal on their own thread (libusb hotplug
//! callbacks) while the engine serves caller requests on caller threads. The
//! bridge carries removal notifications across; the engine drains it without
//! blocking at the start of each operation, and an optional watcher thread
//! blocks on it to tear devices down eagerly.

use crate::usb_types::DeviceKey;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Asynchronous events reported by an OS backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// Device was removed from the bus
    DeviceLeft {
        /// Bus/address of the removed device
        key: DeviceKey,
    },
}

/// Sending half, owned by the OS backend
#[derive(Debug, Clone)]
pub struct EventSender {
    event_tx: Sender<UsbEvent>,
}

impl EventSender {
    /// Publish an event without blocking the OS event thread
    ///
    /// A full channel drops the event with a warning; the engine still
    /// detects the removal when the next call on that device fails with
    /// `NoDevice`.
    pub fn publish(&self, event: UsbEvent) -> crate::Result<()> {
        match self.event_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
                Err(crate::Error::Channel("event channel full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(crate::Error::Channel("event channel closed".to_string()))
            }
        }
    }
}

/// Receiving half, owned by the engine
#[derive(Debug, Clone)]
pub struct EventReceiver {
    event_rx: Receiver<UsbEvent>,
}

impl EventReceiver {
    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<UsbEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event, blocking until one arrives or all senders are gone
    pub fn recv_blocking(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the event bridge between an OS backend and the engine
///
/// Returns (EventSender for the backend, EventReceiver for the engine)
pub fn create_event_bridge() -> (EventSender, EventReceiver) {
    let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);

    (EventSender { event_tx }, EventReceiver { event_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bridge() {
        let (sender, receiver) = create_event_bridge();
        let key = DeviceKey::new(1, 7);

        // Spawn a thread to simulate the OS event thread
        let handle = std::thread::spawn(move || {
            sender.publish(UsbEvent::DeviceLeft { key }).unwrap();
        });

        let event = receiver.recv_blocking().unwrap();
        assert_eq!(event, UsbEvent::DeviceLeft { key });
        handle.join().unwrap();
    }

    #[test]
    fn test_try_recv_empty() {
        let (_sender, receiver) = create_event_bridge();
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_full_channel_drops_event() {
        let (sender, _receiver) = create_event_bridge();
        let key = DeviceKey::new(2, 3);

        for _ in 0..EVENT_CHANNEL_CAPACITY {
            sender.publish(UsbEvent::DeviceLeft { key }).unwrap();
        }
        assert!(matches!(
            sender.publish(UsbEvent::DeviceLeft { key }),
            Err(crate::Error::Channel(_))
        ));
    }

    #[test]
    fn test_closed_channel() {
        let (sender, receiver) = create_event_bridge();
        drop(receiver);
        assert!(
            sender
                .publish(UsbEvent::DeviceLeft {
                    key: DeviceKey::new(1, 1)
                })
                .is_err()
        );
    }

    #[test]
    fn test_recv_after_senders_dropped() {
        let (sender, receiver) = create_event_bridge();
        drop(sender);
        assert!(receiver.recv_blocking().is_err());
    }
}
