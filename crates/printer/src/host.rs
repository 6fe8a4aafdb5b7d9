//! USB host capability consumed by the adapter
//!
//! The adapter never talks to libusb directly. It is written against these
//! traits so that the production host (`rusb_host`) and the in-memory test
//! host (`test_utils`) are interchangeable.
//!
//! All calls are blocking; the adapter runs them on Tokio's blocking pool.

use crate::class::InterfaceClass;
use rusb::Direction;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Identity of a physical USB device: vendor/product id and bus position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} device {:03})",
            self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}

/// One bulk-capable endpoint of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
}

/// Descriptor summary of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: InterfaceClass,
    pub endpoints: Vec<EndpointInfo>,
}

/// The host USB subsystem
pub trait UsbHost: Send + Sync + 'static {
    type Device: HostDevice;

    /// Enumerate attached devices whose identity could be read
    fn devices(&self) -> Result<Vec<Self::Device>, rusb::Error>;

    /// Resolve a device by exact vendor/product id
    fn find_by_ids(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<Self::Device>, rusb::Error> {
        Ok(self.devices()?.into_iter().find(|device| {
            let key = device.key();
            key.vendor_id == vendor_id && key.product_id == product_id
        }))
    }

    /// Process-wide detach notification source
    fn detach_notifier(&self) -> &DetachNotifier;

    /// Whether kernel-driver query/detach is available on this platform
    fn supports_kernel_driver(&self) -> bool;
}

/// Non-owning reference to an attached device
pub trait HostDevice: Clone + Send + Sync + 'static {
    type Handle: HostHandle;

    fn key(&self) -> DeviceKey;

    /// Interfaces of the active configuration
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error>;

    /// Host-level open, distinct from interface claiming
    fn open(&self) -> Result<Self::Handle, rusb::Error>;
}

/// An opened device
pub trait HostHandle: Send + Sync + 'static {
    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), rusb::Error>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error>;

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error>;

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, rusb::Error>;

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Release claimed interfaces and hand detached interfaces back to the kernel
    fn close(&self) -> Result<(), rusb::Error>;
}

/// Handle returned by [`DetachNotifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type DetachListener = Arc<dyn Fn(&DeviceKey) + Send + Sync>;

/// Broadcast source for device-removed notifications
///
/// Every subscriber sees every detach and filters by identity itself.
#[derive(Default)]
pub struct DetachNotifier {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<SubscriptionId, DetachListener>>,
}

impl DetachNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&DeviceKey) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        debug!("Detach listener {:?} subscribed", id);
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!("Detach listener {:?} unsubscribed", id);
        }
        removed
    }

    pub fn notify(&self, key: &DeviceKey) {
        // Listeners run without the registry lock held so they can unsubscribe.
        let listeners: Vec<DetachListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        debug!("Device {} detached, notifying {} listeners", key, listeners.len());
        for listener in listeners {
            listener(key);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(address: u8) -> DeviceKey {
        DeviceKey {
            bus: 1,
            address,
            vendor_id: 0x04b8,
            product_id: 0x0e15,
        }
    }

    #[test]
    fn test_notify_reaches_all_listeners() {
        let notifier = DetachNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            notifier.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        notifier.notify(&key(4));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let notifier = DetachNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.notify(&key(4));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let notifier = Arc::new(DetachNotifier::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let inner = notifier.clone();
        let own_id = slot.clone();
        let id = notifier.subscribe(move |_| {
            if let Some(id) = own_id.lock().unwrap().take() {
                inner.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        notifier.notify(&key(4));
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn test_device_key_display() {
        assert_eq!(key(4).to_string(), "04b8:0e15 (bus 001 device 004)");
    }
}
