//! USB printer adapter
//!
//! A byte-stream transport over one USB printer. Construction selects the
//! device, `open` claims its interfaces and binds endpoints, `write`/`read`
//! move bytes, and `close` (or a host detach notification) ends the
//! adapter's ownership of the device.

use crate::config::{READ_FRAME_SIZE, TransferConfig};
use crate::error::{PrinterError, Result};
use crate::host::{DeviceKey, HostDevice, HostHandle, SubscriptionId, UsbHost};
use crate::lifecycle::{
    AdapterEvent, AdapterState, Connection, EventSink, detach_listener, lock,
};
use crate::opener::{EndpointRef, EndpointSlots, claim_interfaces};
use crate::selector::{DeviceSelector, select_device};
use async_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

type HandleOf<H> = <<H as UsbHost>::Device as HostDevice>::Handle;

/// Byte-stream adapter over a USB printer
pub struct PrinterAdapter<H: UsbHost> {
    host: Arc<H>,
    key: DeviceKey,
    config: TransferConfig,
    connection: Arc<Mutex<Connection<H::Device>>>,
    /// Set once the device reference is cleared; read by in-flight open tasks
    released: Arc<AtomicBool>,
    events: EventSink,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl<H: UsbHost> PrinterAdapter<H> {
    /// Select a device and subscribe to its detach notifications
    ///
    /// Fails with `DeviceNotFound` if the selector resolves to nothing.
    pub fn new(
        host: Arc<H>,
        selector: DeviceSelector<H::Device>,
        config: TransferConfig,
    ) -> Result<Self> {
        let device = select_device(host.as_ref(), selector)?;
        let key = device.key();

        let connection = Arc::new(Mutex::new(Connection::new(device)));
        let released = Arc::new(AtomicBool::new(false));
        let events = EventSink::new();

        let subscription = host.detach_notifier().subscribe(detach_listener(
            key,
            Arc::downgrade(&connection),
            released.clone(),
            events.clone(),
        ));

        Ok(Self {
            host,
            key,
            config,
            connection,
            released,
            events,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Adapter for the first attached printer
    pub fn discover(host: Arc<H>) -> Result<Self> {
        Self::new(host, DeviceSelector::Discover, TransferConfig::default())
    }

    /// Adapter for an already resolved device
    pub fn with_device(host: Arc<H>, device: H::Device) -> Result<Self> {
        Self::new(host, DeviceSelector::Device(device), TransferConfig::default())
    }

    /// Adapter for the device matching `vendor_id:product_id`
    pub fn with_ids(host: Arc<H>, vendor_id: u16, product_id: u16) -> Result<Self> {
        Self::new(
            host,
            DeviceSelector::Ids {
                vendor_id,
                product_id,
            },
            TransferConfig::default(),
        )
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn state(&self) -> AdapterState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == AdapterState::Open
    }

    /// Lifecycle and data events
    ///
    /// Receivers share one queue: each event is delivered to one receiver.
    pub fn events(&self) -> Receiver<AdapterEvent> {
        self.events.receiver()
    }

    pub fn write_endpoint(&self) -> Option<EndpointRef> {
        self.lock().endpoints.as_ref().and_then(|slots| slots.write())
    }

    pub fn read_endpoint(&self) -> Option<EndpointRef> {
        self.lock().endpoints.as_ref().and_then(|slots| slots.read())
    }

    /// Open the device, claim its interfaces and bind endpoints
    ///
    /// Succeeds as soon as any interface yields an OUT endpoint and emits
    /// `Connect` exactly once. No timeout is applied.
    pub async fn open(&self) -> Result<()> {
        let device = {
            let mut conn = self.lock();
            match conn.state {
                AdapterState::Open => return Ok(()),
                AdapterState::Opening => return Err(PrinterError::OpenInProgress),
                AdapterState::Closed | AdapterState::Detached => {
                    return Err(PrinterError::DeviceReleased);
                }
                AdapterState::Unopened => {}
            }
            let Some(device) = conn.device.clone() else {
                return Err(PrinterError::DeviceReleased);
            };
            conn.state = AdapterState::Opening;
            device
        };

        info!("Opening printer {}", self.key);
        match self.connect(device).await {
            Ok(write) => {
                info!(
                    "Printer {} open, writing to endpoint {:#04x} on interface {}",
                    self.key, write.address, write.interface
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open printer {}: {}", self.key, e);
                self.abort_open().await;
                Err(e)
            }
        }
    }

    async fn connect(&self, device: H::Device) -> Result<EndpointRef> {
        let (handle, interfaces) = tokio::task::spawn_blocking(move || {
            let handle = device.open()?;
            let interfaces = device.interfaces()?;
            Ok::<_, rusb::Error>((handle, interfaces))
        })
        .await?
        .map_err(PrinterError::DeviceOpenFailed)?;

        debug!(
            "Opened printer {} with {} interfaces",
            self.key,
            interfaces.len()
        );

        let handle = Arc::new(handle);
        let slots = Arc::new(EndpointSlots::new(interfaces.len()));
        {
            let mut conn = self.lock();
            if conn.device.is_none() {
                return Err(PrinterError::DeviceReleased);
            }
            conn.handle = Some(handle.clone());
            conn.endpoints = Some(slots.clone());
        }

        let claimed = claim_interfaces(
            handle,
            interfaces,
            self.host.supports_kernel_driver(),
            slots,
            self.released.clone(),
        )
        .await;

        // A detach while claiming wins over whatever the claims reported.
        let mut conn = self.lock();
        if conn.device.is_none() || self.released.load(Ordering::Acquire) {
            return Err(PrinterError::DeviceReleased);
        }
        let write = claimed?;
        conn.state = AdapterState::Open;
        // Emitted under the lock so a detach cannot be queued ahead of it.
        self.events.emit(AdapterEvent::Connect(self.key));
        Ok(write)
    }

    /// Return a failed open to `Unopened` so the caller can retry
    async fn abort_open(&self) {
        let handle = {
            let mut conn = self.lock();
            if conn.state != AdapterState::Opening {
                return;
            }
            conn.state = AdapterState::Unopened;
            conn.endpoints = None;
            conn.handle.take()
        };

        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to release printer {}: {}", self.key, e),
                Err(e) => warn!("Release task for printer {} failed: {}", self.key, e),
            }
        }
    }

    /// Send `data` to the printer's OUT endpoint
    ///
    /// Emits `Data` with the payload before the transfer starts.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let (handle, endpoint) = self.bound(|slots| slots.write(), PrinterError::NotOpen)?;

        self.events.emit(AdapterEvent::Data(data.to_vec()));

        let payload = data.to_vec();
        let timeout = self.config.write_timeout();
        let written = tokio::task::spawn_blocking(move || {
            handle.write_bulk(endpoint.address, &payload, timeout)
        })
        .await?
        .map_err(|source| PrinterError::Transfer {
            endpoint: endpoint.address,
            source,
        })?;

        debug!(
            "Wrote {}/{} bytes to endpoint {:#04x}",
            written,
            data.len(),
            endpoint.address
        );
        Ok(written)
    }

    /// Read one 64-byte frame from the IN endpoint
    ///
    /// A timeout means no data was pending and yields an empty frame.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let (handle, endpoint) =
            self.bound(|slots| slots.read(), PrinterError::ReadEndpointMissing)?;

        let timeout = self.config.read_timeout();
        let result = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_FRAME_SIZE];
            handle
                .read_bulk(endpoint.address, &mut buffer, timeout)
                .map(|len| {
                    buffer.truncate(len);
                    buffer
                })
        })
        .await?;

        match result {
            Ok(frame) => {
                debug!(
                    "Read {} bytes from endpoint {:#04x}",
                    frame.len(),
                    endpoint.address
                );
                Ok(frame)
            }
            Err(rusb::Error::Timeout) => {
                debug!("No data pending on endpoint {:#04x}", endpoint.address);
                Ok(Vec::new())
            }
            Err(source) => Err(PrinterError::Transfer {
                endpoint: endpoint.address,
                source,
            }),
        }
    }

    /// Release the device and stop listening for its detach
    ///
    /// A no-op once the device reference is gone (after close or detach).
    /// If the host release fails the adapter is left as it was.
    pub async fn close(&self) -> Result<()> {
        let handle = {
            let conn = self.lock();
            if conn.device.is_none() {
                debug!("Printer {} already released", self.key);
                return Ok(());
            }
            conn.handle.clone()
        };

        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.close())
                .await?
                .map_err(PrinterError::Close)?;
        }

        let closed = {
            let mut conn = self.lock();
            if conn.device.is_some() {
                self.released.store(true, Ordering::Release);
                conn.release(AdapterState::Closed);
                true
            } else {
                false
            }
        };

        self.unsubscribe();

        if closed {
            info!("Printer {} closed", self.key);
            self.events.emit(AdapterEvent::Close(self.key));
        }
        Ok(())
    }

    /// Handle and endpoint for a transfer, if open
    fn bound(
        &self,
        pick: impl Fn(&EndpointSlots) -> Option<EndpointRef>,
        missing: PrinterError,
    ) -> Result<(Arc<HandleOf<H>>, EndpointRef)> {
        let conn = self.lock();
        if conn.state != AdapterState::Open {
            return Err(PrinterError::NotOpen);
        }
        let (Some(handle), Some(slots)) = (&conn.handle, &conn.endpoints) else {
            return Err(PrinterError::NotOpen);
        };
        let endpoint = pick(slots).ok_or(missing)?;
        Ok((handle.clone(), endpoint))
    }

    fn unsubscribe(&self) {
        let id = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.host.detach_notifier().unsubscribe(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection<H::Device>> {
        lock(&self.connection)
    }
}

impl<H: UsbHost> Drop for PrinterAdapter<H> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockCall, MockDevice, MockHost, printer_key};

    fn adapter(device: MockDevice) -> (Arc<MockHost>, PrinterAdapter<MockHost>) {
        let host = Arc::new(MockHost::new(vec![device]));
        let adapter = PrinterAdapter::discover(host.clone()).unwrap();
        (host, adapter)
    }

    #[test]
    fn test_new_subscribes_and_drop_unsubscribes() {
        let (host, adapter) = adapter(MockDevice::printer(1));
        assert_eq!(host.detach_notifier().listener_count(), 1);
        assert_eq!(adapter.state(), AdapterState::Unopened);
        assert_eq!(adapter.key(), printer_key(1));

        drop(adapter);
        assert_eq!(host.detach_notifier().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_write_before_open() {
        let (_host, adapter) = adapter(MockDevice::printer(1));
        assert!(matches!(
            adapter.write(b"hello").await,
            Err(PrinterError::NotOpen)
        ));
        assert!(matches!(adapter.read().await, Err(PrinterError::NotOpen)));
        assert!(adapter.events().try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_twice_is_noop() {
        let device = MockDevice::printer(1);
        let (_host, adapter) = adapter(device.clone());

        adapter.open().await.unwrap();
        adapter.open().await.unwrap();

        assert_eq!(device.count_calls(|c| matches!(c, MockCall::Open)), 1);
        assert_eq!(adapter.events().len(), 1);
    }

    #[tokio::test]
    async fn test_device_open_failure() {
        let device = MockDevice::printer(1).failing_open(rusb::Error::Access);
        let (_host, adapter) = adapter(device);

        assert!(matches!(
            adapter.open().await,
            Err(PrinterError::DeviceOpenFailed(rusb::Error::Access))
        ));
        assert_eq!(adapter.state(), AdapterState::Unopened);
    }

    #[tokio::test]
    async fn test_read_timeout_is_empty_frame() {
        let device = MockDevice::printer(1);
        let (_host, adapter) = adapter(device.clone());
        adapter.open().await.unwrap();

        // Nothing queued: the mock reports a timeout.
        assert_eq!(adapter.read().await.unwrap(), Vec::<u8>::new());
        assert_eq!(
            device.count_calls(|c| matches!(
                c,
                MockCall::ReadBulk {
                    endpoint: 0x81,
                    len: READ_FRAME_SIZE
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_read_error_is_distinct() {
        let device = MockDevice::printer(1);
        let (_host, adapter) = adapter(device.clone());
        adapter.open().await.unwrap();

        device.queue_read(Err(rusb::Error::Pipe));
        assert!(matches!(
            adapter.read().await,
            Err(PrinterError::Transfer {
                endpoint: 0x81,
                source: rusb::Error::Pipe
            })
        ));
    }
}
