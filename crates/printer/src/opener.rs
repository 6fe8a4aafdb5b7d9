//! Interface claiming and endpoint discovery
//!
//! Every interface of the device is prepared on its own blocking task:
//! alternate setting, kernel driver detach, claim, then endpoint
//! classification. The tasks share two single-assignment endpoint slots and
//! a completion counter. The first OUT endpoint seen on any interface becomes
//! the write endpoint and the first IN endpoint becomes the read endpoint.
//!
//! As soon as a write endpoint is bound the open succeeds; interfaces still
//! in flight keep running and may bind the read endpoint later. Only when the
//! last interface finishes without any write endpoint does the open fail.

use crate::error::{PrinterError, Result};
use crate::host::{EndpointInfo, HostHandle, InterfaceInfo};
use rusb::Direction;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// An endpoint bound to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    pub interface: u8,
    pub address: u8,
    pub direction: Direction,
}

/// Write/read slots shared by the per-interface tasks
#[derive(Debug)]
pub(crate) struct EndpointSlots {
    write: OnceLock<EndpointRef>,
    read: OnceLock<EndpointRef>,
    /// First claim failure, kept for when no write endpoint turns up
    claim_error: OnceLock<(u8, rusb::Error)>,
    finished: AtomicUsize,
    total: usize,
}

impl EndpointSlots {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            write: OnceLock::new(),
            read: OnceLock::new(),
            claim_error: OnceLock::new(),
            finished: AtomicUsize::new(0),
            total,
        }
    }

    pub(crate) fn write(&self) -> Option<EndpointRef> {
        self.write.get().copied()
    }

    pub(crate) fn read(&self) -> Option<EndpointRef> {
        self.read.get().copied()
    }

    /// Bind `endpoint` if its direction is still free
    fn bind(&self, interface: u8, endpoint: &EndpointInfo) -> bool {
        let slot = match endpoint.direction {
            Direction::Out => &self.write,
            Direction::In => &self.read,
        };
        slot.set(EndpointRef {
            interface,
            address: endpoint.address,
            direction: endpoint.direction,
        })
        .is_ok()
    }

    fn record_claim_error(&self, interface: u8, error: rusb::Error) {
        let _ = self.claim_error.set((interface, error));
    }

    /// Error reported once every interface finished without a write endpoint
    fn failure(&self) -> PrinterError {
        match self.claim_error.get() {
            Some(&(interface, source)) => {
                PrinterError::InterfaceClaimFailed { interface, source }
            }
            None => PrinterError::EndpointNotFound,
        }
    }

    /// Mark one interface finished; true for the last one
    ///
    /// Must be called after the interface's endpoints and claim error are
    /// recorded, so the last caller sees every other interface's results.
    fn finish(&self) -> bool {
        self.finished.fetch_add(1, Ordering::AcqRel) + 1 == self.total
    }
}

struct InterfaceOutcome {
    interface: u8,
    last: bool,
}

/// Prepare one interface and classify its endpoints
///
/// Only a claim failure is reported; alternate setting and kernel driver
/// problems are logged and the interface is used anyway.
fn prepare_interface<Hd: HostHandle>(
    handle: &Hd,
    interface: &InterfaceInfo,
    kernel_driver: bool,
    slots: &EndpointSlots,
) -> std::result::Result<(), rusb::Error> {
    let number = interface.number;

    if let Err(e) = handle.set_alternate_setting(number, interface.alternate_setting) {
        warn!(
            "Failed to set alternate setting {} on interface {}: {}",
            interface.alternate_setting, number, e
        );
    }

    if kernel_driver {
        match handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", number);
                if let Err(e) = handle.detach_kernel_driver(number) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        number, e
                    );
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", number);
            }
            Err(rusb::Error::NotSupported) => {
                debug!("Kernel driver query not supported for interface {}", number);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                );
            }
        }
    }

    handle.claim_interface(number)?;
    debug!("Claimed interface {}", number);

    for endpoint in &interface.endpoints {
        if slots.bind(number, endpoint) {
            debug!(
                "Bound {:?} endpoint {:#04x} on interface {}",
                endpoint.direction, endpoint.address, number
            );
        }
    }

    Ok(())
}

/// Prepare all interfaces concurrently and wait for a write endpoint
///
/// Returns the write endpoint as soon as one is bound. If every interface
/// finishes without one, returns the first claim failure, or
/// `EndpointNotFound` if nothing failed. `released` is checked before an
/// interface is touched so work scheduled before a detach becomes a no-op.
pub(crate) async fn claim_interfaces<Hd: HostHandle>(
    handle: Arc<Hd>,
    interfaces: Vec<InterfaceInfo>,
    kernel_driver: bool,
    slots: Arc<EndpointSlots>,
    released: Arc<AtomicBool>,
) -> Result<EndpointRef> {
    let (tx, rx) = async_channel::bounded(interfaces.len().max(1));

    for interface in interfaces {
        let handle = handle.clone();
        let slots = slots.clone();
        let released = released.clone();
        let tx = tx.clone();

        tokio::task::spawn_blocking(move || {
            if released.load(Ordering::Acquire) {
                debug!("Device released, skipping interface {}", interface.number);
            } else if let Err(e) =
                prepare_interface(handle.as_ref(), &interface, kernel_driver, &slots)
            {
                warn!("Failed to claim interface {}: {}", interface.number, e);
                slots.record_claim_error(interface.number, e);
            }
            let last = slots.finish();
            // The receiver is gone once the open has already completed.
            let _ = tx.try_send(InterfaceOutcome {
                interface: interface.number,
                last,
            });
        });
    }
    drop(tx);

    while let Ok(outcome) = rx.recv().await {
        if let Some(write) = slots.write() {
            return Ok(write);
        }

        if outcome.last {
            debug!(
                "Interface {} was the last to finish, no write endpoint bound",
                outcome.interface
            );
            break;
        }
    }

    Err(slots.failure())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDevice;
    use crate::test_utils::{MockCall, MockDevice, MockInterface, printer_key};
    use std::time::Duration;

    fn out(address: u8) -> EndpointInfo {
        EndpointInfo {
            address,
            direction: Direction::Out,
        }
    }

    fn inbound(address: u8) -> EndpointInfo {
        EndpointInfo {
            address,
            direction: Direction::In,
        }
    }

    #[test]
    fn test_first_endpoint_of_each_direction_wins() {
        let slots = EndpointSlots::new(2);

        assert!(slots.bind(0, &out(0x01)));
        assert!(slots.bind(0, &inbound(0x81)));
        assert!(!slots.bind(1, &out(0x02)));
        assert!(!slots.bind(1, &inbound(0x82)));

        assert_eq!(slots.write().unwrap().address, 0x01);
        assert_eq!(slots.read().unwrap().address, 0x81);
        assert_eq!(slots.write().unwrap().interface, 0);
    }

    #[test]
    fn test_finish_reports_last() {
        let slots = EndpointSlots::new(3);
        assert!(!slots.finish());
        assert!(!slots.finish());
        assert!(slots.finish());
    }

    #[test]
    fn test_kernel_detach_failure_is_not_fatal() {
        let device = MockDevice::new(printer_key(1)).with_interface(
            MockInterface::printer(0)
                .with_out_endpoint(0x01)
                .failing_kernel_detach(rusb::Error::Access),
        );
        let handle = device.open().unwrap();
        let interface = device.interfaces().unwrap().remove(0);
        let slots = EndpointSlots::new(1);

        assert!(prepare_interface(&handle, &interface, true, &slots).is_ok());
        assert_eq!(slots.write().unwrap().address, 0x01);
        assert_eq!(
            device.count_calls(|c| matches!(c, MockCall::DetachKernelDriver(0))),
            1
        );
    }

    #[test]
    fn test_unsupported_kernel_query_still_claims() {
        let device = MockDevice::new(printer_key(1)).with_interface(
            MockInterface::printer(0)
                .with_out_endpoint(0x01)
                .failing_kernel_query(rusb::Error::NotSupported),
        );
        let handle = device.open().unwrap();
        let interface = device.interfaces().unwrap().remove(0);
        let slots = EndpointSlots::new(1);

        assert!(prepare_interface(&handle, &interface, true, &slots).is_ok());
        assert_eq!(slots.write().unwrap().address, 0x01);
        assert_eq!(
            device.count_calls(|c| matches!(c, MockCall::DetachKernelDriver(_))),
            0
        );
        assert_eq!(
            device.count_calls(|c| matches!(c, MockCall::ClaimInterface(0))),
            1
        );
    }

    #[test]
    fn test_kernel_driver_skipped_without_support() {
        let device = MockDevice::new(printer_key(1)).with_interface(
            MockInterface::printer(0)
                .with_out_endpoint(0x01)
                .with_kernel_driver(),
        );
        let handle = device.open().unwrap();
        let interface = device.interfaces().unwrap().remove(0);
        let slots = EndpointSlots::new(1);

        prepare_interface(&handle, &interface, false, &slots).unwrap();
        assert_eq!(
            device.count_calls(|c| matches!(
                c,
                MockCall::KernelDriverActive(_) | MockCall::DetachKernelDriver(_)
            )),
            0
        );
    }

    #[test]
    fn test_alt_setting_precedes_claim() {
        let device = MockDevice::new(printer_key(1)).with_interface(
            MockInterface::printer(2)
                .with_out_endpoint(0x03)
                .failing_alt_setting(rusb::Error::Pipe),
        );
        let handle = device.open().unwrap();
        let interface = device.interfaces().unwrap().remove(0);
        let slots = EndpointSlots::new(1);

        prepare_interface(&handle, &interface, true, &slots).unwrap();
        assert_eq!(
            device.calls(),
            vec![
                MockCall::Open,
                MockCall::SetAlternateSetting {
                    interface: 2,
                    setting: 0
                },
                MockCall::KernelDriverActive(2),
                MockCall::ClaimInterface(2),
            ]
        );
    }

    #[test]
    fn test_claim_failure_binds_nothing() {
        let device = MockDevice::new(printer_key(1)).with_interface(
            MockInterface::printer(0)
                .with_out_endpoint(0x01)
                .failing_claim(rusb::Error::Busy),
        );
        let handle = device.open().unwrap();
        let interface = device.interfaces().unwrap().remove(0);
        let slots = EndpointSlots::new(1);

        assert_eq!(
            prepare_interface(&handle, &interface, true, &slots),
            Err(rusb::Error::Busy)
        );
        assert!(slots.write().is_none());
    }

    #[tokio::test]
    async fn test_claim_interfaces_without_out_endpoint() {
        let device = MockDevice::new(printer_key(1))
            .with_interface(MockInterface::printer(0).with_in_endpoint(0x81));
        let handle = Arc::new(device.open().unwrap());
        let interfaces = device.interfaces().unwrap();
        let slots = Arc::new(EndpointSlots::new(interfaces.len()));

        let result = claim_interfaces(
            handle,
            interfaces,
            true,
            slots.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        assert!(matches!(result, Err(PrinterError::EndpointNotFound)));
        assert_eq!(slots.read().unwrap().address, 0x81);
    }

    #[tokio::test]
    async fn test_claim_interfaces_reports_claim_failure() {
        let device = MockDevice::new(printer_key(1)).with_interface(
            MockInterface::printer(0)
                .with_out_endpoint(0x01)
                .failing_claim(rusb::Error::Busy),
        );
        let handle = Arc::new(device.open().unwrap());
        let interfaces = device.interfaces().unwrap();
        let slots = Arc::new(EndpointSlots::new(interfaces.len()));

        let result = claim_interfaces(
            handle,
            interfaces,
            true,
            slots,
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        assert!(matches!(
            result,
            Err(PrinterError::InterfaceClaimFailed {
                interface: 0,
                source: rusb::Error::Busy
            })
        ));
    }

    #[tokio::test]
    async fn test_claim_interfaces_reports_earliest_failure() {
        let device = MockDevice::new(printer_key(1))
            .with_interface(
                MockInterface::printer(0)
                    .with_out_endpoint(0x01)
                    .failing_claim(rusb::Error::Busy),
            )
            .with_interface(
                MockInterface::printer(1)
                    .with_out_endpoint(0x02)
                    .with_claim_delay(Duration::from_millis(100))
                    .failing_claim(rusb::Error::Access),
            );
        let handle = Arc::new(device.open().unwrap());
        let interfaces = device.interfaces().unwrap();
        let slots = Arc::new(EndpointSlots::new(interfaces.len()));

        let result = claim_interfaces(
            handle,
            interfaces,
            false,
            slots,
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        // Both interfaces finished before the result was decided.
        assert_eq!(
            device.count_calls(|c| matches!(c, MockCall::ClaimInterface(_))),
            2
        );
        assert!(matches!(
            result,
            Err(PrinterError::InterfaceClaimFailed {
                interface: 0,
                source: rusb::Error::Busy
            })
        ));
    }

    #[test]
    fn test_failure_without_claim_error() {
        let slots = EndpointSlots::new(1);
        assert!(matches!(slots.failure(), PrinterError::EndpointNotFound));

        slots.record_claim_error(2, rusb::Error::Busy);
        slots.record_claim_error(3, rusb::Error::Io);
        assert!(matches!(
            slots.failure(),
            PrinterError::InterfaceClaimFailed {
                interface: 2,
                source: rusb::Error::Busy
            }
        ));
    }

    #[tokio::test]
    async fn test_claim_interfaces_with_no_interfaces() {
        let device = MockDevice::new(printer_key(1));
        let handle = Arc::new(device.open().unwrap());

        let result = claim_interfaces(
            handle,
            Vec::new(),
            true,
            Arc::new(EndpointSlots::new(0)),
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        assert!(matches!(result, Err(PrinterError::EndpointNotFound)));
    }

    #[tokio::test]
    async fn test_released_device_is_left_alone() {
        let device = MockDevice::printer(1);
        let handle = Arc::new(device.open().unwrap());
        let interfaces = device.interfaces().unwrap();
        let slots = Arc::new(EndpointSlots::new(interfaces.len()));

        let result = claim_interfaces(
            handle,
            interfaces,
            true,
            slots,
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert!(matches!(result, Err(PrinterError::EndpointNotFound)));
        assert_eq!(device.calls(), vec![MockCall::Open]);
    }
}
