//! Device selection
//!
//! Picks the printer an adapter will own: an explicit device, an exact
//! vendor/product match, or the first attached device that exposes a
//! printer-class interface.

use crate::class::InterfaceClass;
use crate::error::{PrinterError, Result};
use crate::host::{HostDevice, UsbHost};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How an adapter chooses its device
#[derive(Debug, Clone)]
pub enum DeviceSelector<D> {
    /// First attached device with a printer-class interface
    Discover,
    /// A device the caller already resolved
    Device(D),
    /// Exact vendor/product id match
    Ids { vendor_id: u16, product_id: u16 },
}

impl<D> DeviceSelector<D> {
    /// Build from optional ids; both must be present to select by id
    pub fn from_ids(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        match (vendor_id, product_id) {
            (Some(vendor_id), Some(product_id)) => DeviceSelector::Ids {
                vendor_id,
                product_id,
            },
            _ => DeviceSelector::Discover,
        }
    }
}

/// All attached devices exposing at least one printer-class interface,
/// in enumeration order
///
/// Devices whose descriptors cannot be read are skipped.
pub fn find_printers<H: UsbHost>(host: &H) -> Result<Vec<H::Device>> {
    let devices = host.devices().map_err(PrinterError::Enumeration)?;
    let total = devices.len();

    let printers: Vec<H::Device> = devices.into_iter().filter(is_printer).collect();

    debug!("Found {} printers among {} devices", printers.len(), total);
    Ok(printers)
}

fn is_printer<D: HostDevice>(device: &D) -> bool {
    match device.interfaces() {
        Ok(interfaces) => interfaces
            .iter()
            .any(|iface| iface.class == InterfaceClass::PRINTER),
        Err(e) => {
            warn!(
                "Skipping device {}: could not read interface descriptors: {}",
                device.key(),
                e
            );
            false
        }
    }
}

/// Resolve a selector to exactly one device
pub fn select_device<H: UsbHost>(
    host: &H,
    selector: DeviceSelector<H::Device>,
) -> Result<H::Device> {
    let device = match selector {
        DeviceSelector::Device(device) => device,
        DeviceSelector::Ids {
            vendor_id,
            product_id,
        } => host
            .find_by_ids(vendor_id, product_id)
            .map_err(PrinterError::Enumeration)?
            .ok_or_else(|| {
                debug!("No device matches {:04x}:{:04x}", vendor_id, product_id);
                PrinterError::DeviceNotFound
            })?,
        DeviceSelector::Discover => find_printers(host)?
            .into_iter()
            .next()
            .ok_or(PrinterError::DeviceNotFound)?,
    };

    info!("Selected printer {}", device.key());
    Ok(device)
}

/// Resolve a device by id and open its host-level handle
///
/// This does not claim interfaces; it hands back the raw handle.
pub async fn get_device<H: UsbHost>(
    host: Arc<H>,
    vendor_id: u16,
    product_id: u16,
) -> Result<<H::Device as HostDevice>::Handle> {
    tokio::task::spawn_blocking(move || {
        let device = host
            .find_by_ids(vendor_id, product_id)
            .map_err(PrinterError::Enumeration)?
            .ok_or(PrinterError::DeviceNotFound)?;
        device.open().map_err(PrinterError::DeviceOpenFailed)
    })
    .await?
}
