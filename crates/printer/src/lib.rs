//! Byte-stream transport over a USB printer
//!
//! This crate exposes a physical USB printer as an open/read/write/close
//! transport with connect, disconnect, detach, close and data events. It
//! handles:
//! - Device selection (explicit device, vendor/product id, or auto-discovery
//!   by printer interface class)
//! - Claiming every interface, detaching kernel drivers where supported
//! - Binding the first OUT and IN bulk endpoints
//! - Teardown on explicit close or when the host reports the device removed
//!
//! The USB host itself is abstracted behind the traits in [`host`];
//! [`rusb_host::RusbHost`] implements them over libusb.

pub mod adapter;
pub mod class;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod opener;
pub mod rusb_host;
pub mod selector;
pub mod test_utils;

pub use adapter::PrinterAdapter;
pub use class::InterfaceClass;
pub use config::{READ_FRAME_SIZE, TransferConfig};
pub use error::{PrinterError, Result};
pub use host::{
    DetachNotifier, DeviceKey, EndpointInfo, HostDevice, HostHandle, InterfaceInfo,
    SubscriptionId, UsbHost,
};
pub use lifecycle::{AdapterEvent, AdapterState};
pub use opener::EndpointRef;
pub use rusb_host::RusbHost;
pub use selector::{DeviceSelector, find_printers, get_device, select_device};
