//! Test utilities for the printer adapter
//!
//! Provides an in-memory USB host that records every call made against it,
//! so adapter behaviour can be tested without hardware.
//!
//! # Example
//!
//! ```
//! use printer::test_utils::{MockDevice, MockHost, MockInterface, printer_key};
//!
//! let device = MockDevice::new(printer_key(4))
//!     .with_interface(MockInterface::printer(0).with_out_endpoint(0x01));
//! let host = MockHost::new(vec![device]);
//! assert_eq!(printer::find_printers(&host).unwrap().len(), 1);
//! ```

use crate::class::InterfaceClass;
use crate::host::{
    DetachNotifier, DeviceKey, EndpointInfo, HostDevice, HostHandle, InterfaceInfo, UsbHost,
};
use rusb::Direction;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor/product id used by [`printer_key`]
pub const MOCK_VENDOR_ID: u16 = 0x04b8;
pub const MOCK_PRODUCT_ID: u16 = 0x0e15;

/// Key for a mock printer on bus 1 at the given address
pub fn printer_key(address: u8) -> DeviceKey {
    device_key(address, MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
}

/// Key for an arbitrary mock device on bus 1
pub fn device_key(address: u8, vendor_id: u16, product_id: u16) -> DeviceKey {
    DeviceKey {
        bus: 1,
        address,
        vendor_id,
        product_id,
    }
}

/// A host call recorded by [`MockHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open,
    SetAlternateSetting { interface: u8, setting: u8 },
    KernelDriverActive(u8),
    DetachKernelDriver(u8),
    ClaimInterface(u8),
    WriteBulk { endpoint: u8, data: Vec<u8> },
    ReadBulk { endpoint: u8, len: usize },
    Close,
}

/// Scripted behaviour of one interface
#[derive(Debug, Clone)]
pub struct MockInterface {
    info: InterfaceInfo,
    claim_error: Option<rusb::Error>,
    claim_delay: Option<Duration>,
    alt_setting_error: Option<rusb::Error>,
    kernel_driver_active: bool,
    kernel_query_error: Option<rusb::Error>,
    kernel_detach_error: Option<rusb::Error>,
}

impl MockInterface {
    pub fn new(number: u8, class: InterfaceClass) -> Self {
        Self {
            info: InterfaceInfo {
                number,
                alternate_setting: 0,
                class,
                endpoints: Vec::new(),
            },
            claim_error: None,
            claim_delay: None,
            alt_setting_error: None,
            kernel_driver_active: false,
            kernel_query_error: None,
            kernel_detach_error: None,
        }
    }

    /// Printer-class interface without endpoints
    pub fn printer(number: u8) -> Self {
        Self::new(number, InterfaceClass::PRINTER)
    }

    pub fn with_out_endpoint(mut self, address: u8) -> Self {
        self.info.endpoints.push(EndpointInfo {
            address,
            direction: Direction::Out,
        });
        self
    }

    pub fn with_in_endpoint(mut self, address: u8) -> Self {
        self.info.endpoints.push(EndpointInfo {
            address,
            direction: Direction::In,
        });
        self
    }

    pub fn failing_claim(mut self, error: rusb::Error) -> Self {
        self.claim_error = Some(error);
        self
    }

    /// Block the claim for `delay` before completing it
    pub fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay = Some(delay);
        self
    }

    pub fn failing_alt_setting(mut self, error: rusb::Error) -> Self {
        self.alt_setting_error = Some(error);
        self
    }

    /// Report an active kernel driver on this interface
    pub fn with_kernel_driver(mut self) -> Self {
        self.kernel_driver_active = true;
        self
    }

    /// Make the kernel driver status query fail
    pub fn failing_kernel_query(mut self, error: rusb::Error) -> Self {
        self.kernel_query_error = Some(error);
        self
    }

    pub fn failing_kernel_detach(mut self, error: rusb::Error) -> Self {
        self.kernel_driver_active = true;
        self.kernel_detach_error = Some(error);
        self
    }

    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<MockCall>>,
    reads: Mutex<VecDeque<Result<Vec<u8>, rusb::Error>>>,
    write_error: Mutex<Option<rusb::Error>>,
    close_error: Mutex<Option<rusb::Error>>,
}

/// Scripted USB device; clones share the same call log
#[derive(Clone)]
pub struct MockDevice {
    key: DeviceKey,
    interfaces: Result<Vec<MockInterface>, rusb::Error>,
    open_error: Option<rusb::Error>,
    state: Arc<MockState>,
}

impl MockDevice {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            key,
            interfaces: Ok(Vec::new()),
            open_error: None,
            state: Arc::new(MockState::default()),
        }
    }

    /// Single printer interface with one OUT (0x01) and one IN (0x81) endpoint
    pub fn printer(address: u8) -> Self {
        Self::new(printer_key(address)).with_interface(
            MockInterface::printer(0)
                .with_out_endpoint(0x01)
                .with_in_endpoint(0x81),
        )
    }

    pub fn with_interface(mut self, interface: MockInterface) -> Self {
        if let Ok(interfaces) = &mut self.interfaces {
            interfaces.push(interface);
        }
        self
    }

    /// Make descriptor inspection fail
    pub fn with_broken_descriptor(mut self, error: rusb::Error) -> Self {
        self.interfaces = Err(error);
        self
    }

    pub fn failing_open(mut self, error: rusb::Error) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn set_write_error(&self, error: Option<rusb::Error>) {
        *self.state.write_error.lock().unwrap() = error;
    }

    pub fn set_close_error(&self, error: Option<rusb::Error>) {
        *self.state.close_error.lock().unwrap() = error;
    }

    /// Queue the result of the next bulk IN transfer
    pub fn queue_read(&self, result: Result<Vec<u8>, rusb::Error>) {
        self.state.reads.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    fn record(&self, call: MockCall) {
        self.state.calls.lock().unwrap().push(call);
    }

    fn interface(&self, number: u8) -> Result<&MockInterface, rusb::Error> {
        self.interfaces
            .as_ref()
            .map_err(|e| *e)?
            .iter()
            .find(|iface| iface.info.number == number)
            .ok_or(rusb::Error::NotFound)
    }
}

impl HostDevice for MockDevice {
    type Handle = MockHandle;

    fn key(&self) -> DeviceKey {
        self.key
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        self.interfaces
            .as_ref()
            .map(|ifaces| ifaces.iter().map(|iface| iface.info.clone()).collect())
            .map_err(|e| *e)
    }

    fn open(&self) -> Result<MockHandle, rusb::Error> {
        self.record(MockCall::Open);
        match self.open_error {
            Some(error) => Err(error),
            None => Ok(MockHandle {
                device: self.clone(),
            }),
        }
    }
}

/// Open handle to a [`MockDevice`]
pub struct MockHandle {
    device: MockDevice,
}

impl HostHandle for MockHandle {
    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), rusb::Error> {
        self.device
            .record(MockCall::SetAlternateSetting { interface, setting });
        match self.device.interface(interface)?.alt_setting_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error> {
        self.device.record(MockCall::KernelDriverActive(interface));
        let iface = self.device.interface(interface)?;
        match iface.kernel_query_error {
            Some(error) => Err(error),
            None => Ok(iface.kernel_driver_active),
        }
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        self.device.record(MockCall::DetachKernelDriver(interface));
        match self.device.interface(interface)?.kernel_detach_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        let iface = self.device.interface(interface)?;
        if let Some(delay) = iface.claim_delay {
            std::thread::sleep(delay);
        }
        self.device.record(MockCall::ClaimInterface(interface));
        match iface.claim_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.device.record(MockCall::WriteBulk {
            endpoint,
            data: data.to_vec(),
        });
        match *self.device.state.write_error.lock().unwrap() {
            Some(error) => Err(error),
            None => Ok(data.len()),
        }
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.device.record(MockCall::ReadBulk {
            endpoint,
            len: buf.len(),
        });
        let next = self.device.state.reads.lock().unwrap().pop_front();
        match next {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Err(error)) => Err(error),
            None => Err(rusb::Error::Timeout),
        }
    }

    fn close(&self) -> Result<(), rusb::Error> {
        self.device.record(MockCall::Close);
        match *self.device.state.close_error.lock().unwrap() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// In-memory USB host
pub struct MockHost {
    devices: Vec<MockDevice>,
    enumeration_error: Option<rusb::Error>,
    kernel_driver: bool,
    notifier: DetachNotifier,
}

impl MockHost {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            enumeration_error: None,
            kernel_driver: true,
            notifier: DetachNotifier::new(),
        }
    }

    /// Behave like a platform without kernel-driver APIs
    pub fn without_kernel_driver_support(mut self) -> Self {
        self.kernel_driver = false;
        self
    }

    pub fn failing_enumeration(mut self, error: rusb::Error) -> Self {
        self.enumeration_error = Some(error);
        self
    }

    /// Broadcast a detach for `key` to every subscriber
    pub fn detach(&self, key: &DeviceKey) {
        self.notifier.notify(key);
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<MockDevice>, rusb::Error> {
        match self.enumeration_error {
            Some(error) => Err(error),
            None => Ok(self.devices.clone()),
        }
    }

    fn detach_notifier(&self) -> &DetachNotifier {
        &self.notifier
    }

    fn supports_kernel_driver(&self) -> bool {
        self.kernel_driver
    }
}

/// Run a future with a timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, &'static str>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| "Operation timed out")
}
