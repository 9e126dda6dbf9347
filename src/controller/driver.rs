//! Driver capability shared by every accessory variant
//!
//! The host only ever holds a `Box<dyn ControllerDriver>`. Which concrete
//! driver sits behind it is decided by the [`registry`](super::registry).

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::controller_handle::DriverSettings;
use super::error::DriverError;
use super::events::DriverEvent;
use crate::usb::UsbPort;

/// Controller family the host should emulate for this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControllerType {
    Xbox,
}

/// Bits of [`DriverIdentity::capabilities`]
pub const CAPABILITY_ANALOG_TRIGGERS: u16 = 0x01;
pub const CAPABILITY_RUMBLE: u16 = 0x02;
pub const CAPABILITY_TRIGGER_RUMBLE: u16 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverIdentity {
    pub name: &'static str,
    pub device_id: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub controller_type: ControllerType,
    pub capabilities: u16,
}

impl DriverIdentity {
    pub fn supports(&self, capability: u16) -> bool {
        self.capabilities & capability == capability
    }
}

impl fmt::Display for DriverIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} ({:04x}:{:04x})",
            self.name, self.device_id, self.vendor_id, self.product_id
        )
    }
}

/// Everything a driver constructor needs from the host
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub port: Arc<dyn UsbPort>,
    pub device_id: u32,
    pub events: mpsc::UnboundedSender<DriverEvent>,
    pub settings: DriverSettings,
    /// Runtime the driver's read loop is spawned on
    pub runtime: Handle,
}

pub trait ControllerDriver: Send + Sync {
    /// Take over the device and start reporting input
    ///
    /// Returns as soon as the read loop is spawned. The `DeviceAdded`
    /// notification follows asynchronously.
    fn start(&self) -> Result<(), DriverError>;

    /// Tear the driver down. Only the first call has any effect.
    fn stop(&self);

    fn rumble(&self, low_freq_motor: u16, high_freq_motor: u16);

    fn rumble_triggers(&self, left_trigger: u16, right_trigger: u16);

    fn identify(&self) -> DriverIdentity;
}
