//! Backbone One side channel driver
//!
//! The Backbone One reports its Backbone and screenshot buttons on a separate
//! vendor interface instead of its HID gamepad interface. This driver claims
//! that interface, reads it on a background loop and maps both buttons to the
//! guide/home button of an Xbox-style controller.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──► Starting ──claimed──► Started ──stop() / hard I/O error──► Stopped
//!    │                    └──claim fails / stop()──────────────────────────────────┘
//!    └──stop()─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! start() claims the interface and spawns the read loop. The loop waits the
//! settle delay, announces the device and then reports input. stop() may come
//! from the host or from the loop itself; whichever arrives first performs the
//! teardown and later calls do nothing.
//!
//! Every transition goes through one atomic state. A stop() that lands while
//! start() is still claiming leaves the cleanup to start(), which then fails
//! without the host ever hearing about the device.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::claimer::{claim_side_channel, ClaimedInterface};
use super::driver::{ControllerDriver, ControllerType, DriverContext, DriverIdentity};
use super::error::DriverError;
use super::events::DriverEvent;
use super::input_loop::InputReadLoop;
use crate::usb::UsbPort;

/// Backbone Labs, Inc.
pub const BACKBONE_VENDOR_ID: u16 = 0x358A;
pub const BACKBONE_ONE_PRODUCT_IDS: [u16; 2] = [
    0x201, // headphones attached
    0x202, // without headphones
];

pub fn is_backbone_one(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == BACKBONE_VENDOR_ID && BACKBONE_ONE_PRODUCT_IDS.contains(&product_id)
}

pub fn can_claim_device(port: &dyn UsbPort) -> bool {
    is_backbone_one(port.vendor_id(), port.product_id())
}

/// Timing of the side channel driver
///
/// The read loop cannot ask libusb whether a failed transfer timed out or hit
/// a dead device, so it judges by how long the transfer took. These three
/// values define that judgement and the announcement delay.
///
/// # Constraints
///
/// - `read_timeout_ms` must be greater than zero
/// - `hard_error_threshold_ms` must be strictly below `read_timeout_ms`,
///   otherwise every ordinary timeout would look like a dead device
///
/// start() refuses settings that break either rule.
///
/// # Examples
///
/// ```rust
/// use backbone_button::controller::DriverSettings;
///
/// // Tuned values, used when the config file is missing
/// let tuned = DriverSettings::default();
/// assert!(tuned.validate().is_ok());
///
/// // Short timings for a bench setup
/// let bench = DriverSettings {
///     settle_delay_ms: 100,
///     read_timeout_ms: 500,
///     hard_error_threshold_ms: 200,
/// };
/// assert!(bench.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Wait between a successful start and the `DeviceAdded` notification
    ///
    /// A previous instance of the same accessory may still occupy its
    /// controller slot on the host. Announcing too early can collide with it.
    pub settle_delay_ms: u64,

    /// Timeout of a single read on the side channel
    ///
    /// The accessory only sends a report when a button changes, so most reads
    /// end in this timeout while nobody touches the buttons.
    pub read_timeout_ms: u64,

    /// A failed read that returns sooner than this is a hard I/O error
    ///
    /// Unplugging the accessory makes transfers fail at once, long before the
    /// read timeout. A failure at or after this threshold is retried.
    pub hard_error_threshold_ms: u64,
}

impl Default for DriverSettings {
    /// Values the hard-error heuristic was tuned with on real hardware
    fn default() -> Self {
        Self {
            settle_delay_ms: 1000,
            read_timeout_ms: 3000,
            hard_error_threshold_ms: 1000,
        }
    }
}

impl DriverSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn hard_error_threshold(&self) -> Duration {
        Duration::from_millis(self.hard_error_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        if self.read_timeout_ms == 0 {
            return Err(DriverError::InvalidSettings(
                "read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.hard_error_threshold_ms >= self.read_timeout_ms {
            return Err(DriverError::InvalidSettings(format!(
                "hard_error_threshold_ms ({}) must be below read_timeout_ms ({})",
                self.hard_error_threshold_ms, self.read_timeout_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, or start() still claiming the interface
    Created,
    Started,
    Stopped,
}

const CREATED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPED: u8 = 3;

/// State shared between the driver handle and its read loop
#[derive(Debug)]
pub(crate) struct DriverShared {
    identity: DriverIdentity,
    port: Arc<dyn UsbPort>,
    state: AtomicU8,
    cancel: CancellationToken,
    claimed: OnceLock<ClaimedInterface>,
    // Taken on teardown so nothing can be sent after DeviceRemoved
    events: Mutex<Option<mpsc::UnboundedSender<DriverEvent>>>,
}

impl DriverShared {
    fn new(
        identity: DriverIdentity,
        port: Arc<dyn UsbPort>,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Self {
        Self {
            identity,
            port,
            state: AtomicU8::new(CREATED),
            cancel: CancellationToken::new(),
            claimed: OnceLock::new(),
            events: Mutex::new(Some(events)),
        }
    }

    pub(crate) fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    pub(crate) fn port(&self) -> &Arc<dyn UsbPort> {
        &self.port
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    fn lifecycle(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            CREATED | STARTING => LifecycleState::Created,
            STARTED => LifecycleState::Started,
            _ => LifecycleState::Stopped,
        }
    }

    fn begin_start(&self) -> Result<(), DriverError> {
        match self
            .state
            .compare_exchange(CREATED, STARTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(STOPPED) => Err(DriverError::Stopped),
            Err(_) => Err(DriverError::AlreadyStarted),
        }
    }

    // Publishes the claim; false if stop() got in first
    fn finish_start(&self, claimed: ClaimedInterface) -> bool {
        let _ = self.claimed.set(claimed);
        self.state
            .compare_exchange(STARTING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn deliver(&self, sender: &mpsc::UnboundedSender<DriverEvent>, event: DriverEvent) {
        if sender.send(event).is_err() {
            debug!("Host dropped event receiver for device #{}", self.identity.device_id);
        }
    }

    pub(crate) fn notify(&self, event: DriverEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.as_ref() {
            Some(sender) => self.deliver(sender, event),
            None => trace!("Dropping event for stopped device #{}", self.identity.device_id),
        }
    }

    fn take_sender(&self) -> Option<mpsc::UnboundedSender<DriverEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn release(&self, interface_number: u8) {
        if let Err(e) = self.port.release_interface(interface_number) {
            warn!(
                "Failed to release interface {} of {}: {}",
                interface_number, self.identity, e
            );
        }
    }

    /// Single teardown path for host and loop initiated stops
    pub(crate) fn stop(&self) {
        match self.state.swap(STOPPED, Ordering::AcqRel) {
            STOPPED => {
                debug!("{} already stopped", self.identity);
            }
            CREATED => {
                // Never visible to the host, so nothing to announce
                info!("Stopping {} before start", self.identity);
                self.cancel.cancel();
                self.port.close();
                self.take_sender();
            }
            STARTING => {
                // start() sees the lost transition and cleans up the claim
                info!("Stopping {} while it is starting", self.identity);
                self.cancel.cancel();
                self.take_sender();
            }
            _ => {
                info!("Stopping {}", self.identity);

                // Stop the input loop; releasing the interface also kills a blocked read
                self.cancel.cancel();
                if let Some(claimed) = self.claimed.get() {
                    self.release(claimed.interface_number);
                }
                self.port.close();

                if let Some(sender) = self.take_sender() {
                    self.deliver(
                        &sender,
                        DriverEvent::DeviceRemoved {
                            device_id: self.identity.device_id,
                            timestamp: Local::now(),
                        },
                    );
                }
            }
        }
    }

    // Give up after a failed start without telling the host anything
    fn abandon(&self, claimed_interface: Option<u8>) {
        self.state.store(STOPPED, Ordering::Release);
        self.cancel.cancel();
        if let Some(interface_number) = claimed_interface {
            self.release(interface_number);
        }
        self.port.close();
        self.take_sender();
    }
}

/// Driver for the Backbone One button side channel
///
/// # Threading Model
///
/// start(), stop() and the rumble calls run on the caller's thread. The read
/// loop runs as one task on the runtime from the [`DriverContext`], with each
/// blocking read on that runtime's blocking pool.
///
/// # Resource Management
///
/// stop() releases the interface, closes the port and aborts the loop task.
/// Dropping the driver stops it, so a driver that goes out of scope never
/// keeps the interface claimed.
pub struct BackboneOneButton {
    shared: Arc<DriverShared>,
    settings: DriverSettings,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackboneOneButton {
    pub const NAME: &'static str = "Backbone One";

    pub fn new(ctx: DriverContext) -> Self {
        let identity = DriverIdentity {
            name: Self::NAME,
            device_id: ctx.device_id,
            vendor_id: ctx.port.vendor_id(),
            product_id: ctx.port.product_id(),
            controller_type: ControllerType::Xbox,
            // The side channel carries buttons only
            capabilities: 0,
        };
        debug!("Creating driver for {}", identity);

        Self {
            shared: Arc::new(DriverShared::new(identity, ctx.port, ctx.events)),
            settings: ctx.settings,
            runtime: ctx.runtime,
            task: Mutex::new(None),
        }
    }

    pub fn boxed(ctx: DriverContext) -> Box<dyn ControllerDriver> {
        Box::new(Self::new(ctx))
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lifecycle()
    }

    /// Whether the read loop task is still alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl ControllerDriver for BackboneOneButton {
    fn start(&self) -> Result<(), DriverError> {
        self.shared.begin_start()?;
        info!("Starting {}", self.shared.identity());

        if let Err(e) = self.settings.validate() {
            warn!("Refusing to start {}: {}", self.shared.identity(), e);
            self.shared.abandon(None);
            return Err(e);
        }

        let claimed = match claim_side_channel(Arc::clone(self.shared.port())) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Failed to start {}: {}", self.shared.identity(), e);
                self.shared.abandon(None);
                return Err(e.into());
            }
        };

        let interface_number = claimed.interface_number;
        let endpoint = claimed.endpoint.clone();
        if !self.shared.finish_start(claimed) {
            debug!("{} was stopped while claiming", self.shared.identity());
            self.shared.abandon(Some(interface_number));
            return Err(DriverError::Stopped);
        }

        let input_loop = InputReadLoop::new(Arc::clone(&self.shared), endpoint, self.settings.clone());
        let task = self.runtime.spawn(input_loop.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(
            "{} started on interface {}",
            self.shared.identity(),
            interface_number
        );
        Ok(())
    }

    fn stop(&self) {
        self.shared.stop();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn rumble(&self, low_freq_motor: u16, high_freq_motor: u16) {
        trace!(
            "Ignoring rumble ({}, {}) for {}",
            low_freq_motor,
            high_freq_motor,
            self.shared.identity()
        );
    }

    fn rumble_triggers(&self, left_trigger: u16, right_trigger: u16) {
        trace!(
            "Ignoring trigger rumble ({}, {}) for {}",
            left_trigger,
            right_trigger,
            self.shared.identity()
        );
    }

    fn identify(&self) -> DriverIdentity {
        self.shared.identity().clone()
    }
}

impl Drop for BackboneOneButton {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_both_product_ids() {
        assert!(is_backbone_one(0x358A, 0x201));
        assert!(is_backbone_one(0x358A, 0x202));
        assert!(!is_backbone_one(0x358A, 0x203));
        assert!(!is_backbone_one(0x045E, 0x202));
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = DriverSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.settle_delay(), Duration::from_millis(1000));
        assert_eq!(settings.read_timeout(), Duration::from_millis(3000));
        assert_eq!(settings.hard_error_threshold(), Duration::from_millis(1000));
    }

    #[test]
    fn threshold_must_stay_below_timeout() {
        let settings = DriverSettings {
            hard_error_threshold_ms: 3000,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(DriverError::InvalidSettings(_))));

        let settings = DriverSettings {
            read_timeout_ms: 0,
            hard_error_threshold_ms: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(DriverError::InvalidSettings(_))));
    }
}
