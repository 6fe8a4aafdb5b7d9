//! Adapter state, lifecycle events and detach handling

use crate::host::{DeviceKey, HostDevice};
use crate::opener::EndpointSlots;
use async_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Capacity of the lifecycle event queue
const EVENT_CAPACITY: usize = 256;

/// Connection state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Device selected, `open` not yet called (or a previous open failed)
    Unopened,
    /// Interfaces are being claimed
    Opening,
    /// A write endpoint is bound
    Open,
    /// Closed by the caller
    Closed,
    /// The device was removed
    Detached,
}

/// Observable adapter events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Connect(DeviceKey),
    Disconnect(DeviceKey),
    Detach(DeviceKey),
    Close(DeviceKey),
    /// Payload handed to `write`, emitted before the transfer
    Data(Vec<u8>),
}

/// Bounded event queue; events are dropped rather than blocking a USB callback
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<AdapterEvent>,
    rx: Receiver<AdapterEvent>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, rx) = async_channel::bounded(EVENT_CAPACITY);
        Self { tx, rx }
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn receiver(&self) -> Receiver<AdapterEvent> {
        self.rx.clone()
    }
}

/// Mutable adapter state shared with the detach listener
pub(crate) struct Connection<D: HostDevice> {
    pub(crate) state: AdapterState,
    pub(crate) device: Option<D>,
    pub(crate) handle: Option<Arc<D::Handle>>,
    pub(crate) endpoints: Option<Arc<EndpointSlots>>,
}

impl<D: HostDevice> Connection<D> {
    pub(crate) fn new(device: D) -> Self {
        Self {
            state: AdapterState::Unopened,
            device: Some(device),
            handle: None,
            endpoints: None,
        }
    }

    /// Drop the device reference for good
    pub(crate) fn release(&mut self, state: AdapterState) {
        self.device = None;
        self.handle = None;
        self.endpoints = None;
        self.state = state;
    }
}

pub(crate) fn lock<D: HostDevice>(connection: &Mutex<Connection<D>>) -> MutexGuard<'_, Connection<D>> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listener reacting to host detach notifications for one device
///
/// Notifications for other devices, or arriving after the device reference
/// was already cleared, are ignored.
pub(crate) fn detach_listener<D: HostDevice>(
    owned: DeviceKey,
    connection: Weak<Mutex<Connection<D>>>,
    released: Arc<AtomicBool>,
    events: EventSink,
) -> impl Fn(&DeviceKey) + Send + Sync + 'static {
    move |key: &DeviceKey| {
        if *key != owned {
            return;
        }
        let Some(connection) = connection.upgrade() else {
            return;
        };

        {
            let mut conn = lock(&connection);
            if conn.device.is_none() {
                debug!("Detach for {} after release, ignoring", key);
                return;
            }
            released.store(true, Ordering::Release);
            conn.release(AdapterState::Detached);
        }

        info!("Printer {} detached", key);
        events.emit(AdapterEvent::Detach(*key));
        events.emit(AdapterEvent::Disconnect(*key));
    }
}
