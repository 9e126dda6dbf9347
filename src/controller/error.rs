//! Error definitions for the controller drivers

use thiserror::Error;

use crate::usb::UsbError;

/// Reasons the vendor side channel could not be taken over
///
/// Any of these makes start() fail before a read loop exists.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// No interface with class 255, subclass 2, protocol 1
    #[error("No matching interface")]
    NoMatchingInterface,

    /// The OS refused exclusive ownership of the interface
    #[error("Claim rejected: {0}")]
    ClaimRejected(#[source] UsbError),

    /// The side channel has no device-to-host endpoint
    ///
    /// Seen with firmware that exposes the interface but not its report pipe.
    /// The interface is released again before this is returned.
    #[error("Missing required endpoint")]
    MissingEndpoint,

    /// The side channel has more than one device-to-host endpoint
    ///
    /// Reports could arrive on either, so the layout is refused rather than
    /// guessed. The interface is released again before this is returned.
    #[error("Found duplicate IN endpoint")]
    DuplicateEndpoint,
}

/// A side channel report that cannot be decoded
///
/// The read loop logs these and keeps going; one bad report never stops a
/// driver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the fixed report layout needs
    #[error("Read too small: {0}")]
    ReadTooSmall(usize),
}

/// Errors returned by driver lifecycle calls
///
/// Every start() failure leaves the driver stopped with its port closed. The
/// host is never told about a device whose start failed.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The side channel could not be taken over
    ///
    /// Usually another process or kernel driver holds the interface, or the
    /// device is not the accessory the registry matched it as.
    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    /// start() was called a second time
    #[error("Driver already started")]
    AlreadyStarted,

    /// The driver was stopped before or during start()
    ///
    /// A stopped driver cannot be restarted; build a new one from the registry.
    #[error("Driver already stopped")]
    Stopped,

    /// The [`DriverSettings`](super::DriverSettings) break the timing rules
    ///
    /// Checked by start() before the interface is claimed, and by the config
    /// loader before any driver exists.
    #[error("Invalid driver settings: {0}")]
    InvalidSettings(String),
}
