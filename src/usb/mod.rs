//! USB device access for controller drivers
//!
//! Drivers never talk to libusb directly. They see a [`UsbPort`]: an opened
//! device handle with its interface layout already read from the active
//! configuration descriptor.
//!
//! ```text
//! rusb::Device ──► RusbPort ──► Arc<dyn UsbPort> ──► ControllerDriver
//! ```
//!
//! Releasing a claimed interface must wake up a read blocked on one of its
//! endpoints. Driver teardown relies on that to stop promptly instead of
//! waiting out the full transfer timeout.

pub mod rusb_port;
#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;
use std::time::Duration;

pub use rusb_port::RusbPort;

/// Transfer direction of an endpoint, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// One interface (alternate setting 0) of the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Device handle closed")]
    Closed,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer timed out")]
    Timeout,
}

/// An opened USB device a driver can claim interfaces on and read from
///
/// Every method takes `&self`: the read loop holds a clone of the port while
/// stop() releases the interface from another thread.
pub trait UsbPort: Send + Sync + fmt::Debug {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// Interfaces of the active configuration in descriptor order
    fn interfaces(&self) -> Vec<InterfaceDescriptor>;

    /// Claim an interface for exclusive use; `force` detaches a kernel driver first
    fn claim_interface(&self, number: u8, force: bool) -> Result<(), UsbError>;

    fn release_interface(&self, number: u8) -> Result<(), UsbError>;

    /// Blocking read of one transfer into `buf`, returning the byte count
    fn read(
        &self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Whether the device handle is still held
    fn is_open(&self) -> bool;

    /// Give up the device handle. Later calls fail with [`UsbError::Closed`].
    fn close(&self);
}
