//! Printer adapter error types

use thiserror::Error;

/// Errors surfaced by the printer adapter
#[derive(Debug, Error)]
pub enum PrinterError {
    /// No attached device matched the selection
    #[error("No matching USB printer found")]
    DeviceNotFound,

    /// The host could not list attached devices at all
    #[error("USB enumeration failed: {0}")]
    Enumeration(#[source] rusb::Error),

    /// Host-level open of the device handle failed
    #[error("Failed to open USB device: {0}")]
    DeviceOpenFailed(#[source] rusb::Error),

    /// An interface could not be claimed (e.g. held by another process)
    #[error("Failed to claim interface {interface}: {source}")]
    InterfaceClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    /// No OUT endpoint was found on any interface
    #[error("No OUT endpoint found on any interface")]
    EndpointNotFound,

    /// The adapter is open but no IN endpoint was bound
    #[error("No IN endpoint bound, device does not support reads")]
    ReadEndpointMissing,

    /// Transport operation attempted before a successful open
    #[error("Printer is not open")]
    NotOpen,

    /// `open` called while another `open` is still in flight
    #[error("Open already in progress")]
    OpenInProgress,

    /// The device reference was cleared by close or detach
    #[error("Device has been released")]
    DeviceReleased,

    /// Bulk transfer failed
    #[error("Bulk transfer on endpoint {endpoint:#04x} failed: {source}")]
    Transfer {
        endpoint: u8,
        #[source]
        source: rusb::Error,
    },

    /// Releasing the host-level device handle failed
    #[error("Failed to close USB device: {0}")]
    Close(#[source] rusb::Error),

    /// A blocking USB task panicked or was cancelled
    #[error("USB task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Type alias for printer results
pub type Result<T> = std::result::Result<T, PrinterError>;
