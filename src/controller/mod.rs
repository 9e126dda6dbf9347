//! Controller drivers for accessory side channels
//!
//! Each driver turns raw reports from a claimed USB interface into
//! [`DriverEvent`]s for the host input subsystem:
//!
//! 1. [`claimer`] - Locate and claim the vendor interface
//! 2. [`input_loop`] - Background reads with error/timeout disambiguation
//! 3. [`packet`] - Fixed-offset report decoding
//! 4. [`button_state`] - Button transition tracking
//! 5. [`controller_handle`] - Start/stop lifecycle of the driver
//!
//! # Architecture
//!
//! ```text
//! UsbPort ──► InputReadLoop ──► parse_report ──► ButtonTracker ──► DriverEvent
//!             (blocking pool)   (KeyReport)      (combined bit)
//! ```
//!
//! Drivers are picked by [`registry::DriverRegistry`] from the device's
//! vendor and product id.

pub mod button_state;
pub mod claimer;
pub mod controller_handle;
pub mod driver;
pub mod error;
pub mod events;
pub mod input_loop;
pub mod packet;
pub mod registry;


pub use button_state::{ButtonTracker, PRIMARY_KEY_ID, SECONDARY_KEY_ID};
pub use claimer::{claim_side_channel, is_side_channel_interface, ClaimedInterface};
pub use controller_handle::{
    can_claim_device, is_backbone_one, BackboneOneButton, DriverSettings, LifecycleState,
};
pub use driver::{
    ControllerDriver, ControllerType, DriverContext, DriverIdentity, CAPABILITY_ANALOG_TRIGGERS,
    CAPABILITY_RUMBLE, CAPABILITY_TRIGGER_RUMBLE,
};
pub use error::{ClaimError, DriverError, PacketError};
pub use events::{ControllerState, DriverEvent, SPECIAL_BUTTON_FLAG};
pub use input_loop::{classify_failure, ReadFailure};
pub use packet::{parse_report, KeyReport};
pub use registry::DriverRegistry;
