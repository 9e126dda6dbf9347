//! Background read loop of a running driver
//!
//! One loop runs per driver instance on the driver's tokio runtime. The only
//! place it blocks is the USB read, which runs on the blocking pool and is
//! bounded by the read timeout.
//!
//! A failed read is ambiguous: libusb reports a timeout and a dead device the
//! same way on some host controllers. The loop looks at how long the transfer
//! took instead. A failure well before the timeout means the transfer was
//! rejected outright, which is treated as a hard I/O error and stops the
//! driver. A failure after the threshold is a plain timeout and is retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::task::JoinError;
use tracing::{debug, error, info, trace, warn};

use super::button_state::ButtonTracker;
use super::controller_handle::{DriverSettings, DriverShared};
use super::events::{ControllerState, DriverEvent, SPECIAL_BUTTON_FLAG};
use super::packet::parse_report;
use crate::usb::{EndpointDescriptor, UsbError};

/// Size of one read; a full-speed bulk packet
pub const READ_BUFFER_LEN: usize = 64;

/// How a failed read is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// The transfer was rejected immediately; the device is gone
    HardIo,
    /// The transfer ran into its timeout without data
    Timeout,
}

/// Decide what a failed or empty read means from how long it took
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use backbone_button::controller::{classify_failure, ReadFailure};
///
/// let threshold = Duration::from_millis(1000);
/// assert_eq!(classify_failure(Duration::from_millis(3), threshold), ReadFailure::HardIo);
/// assert_eq!(classify_failure(Duration::from_millis(3000), threshold), ReadFailure::Timeout);
/// ```
pub fn classify_failure(elapsed: Duration, hard_error_threshold: Duration) -> ReadFailure {
    if elapsed < hard_error_threshold {
        ReadFailure::HardIo
    } else {
        ReadFailure::Timeout
    }
}

#[derive(Debug)]
enum ReadOutcome {
    Report {
        buf: [u8; READ_BUFFER_LEN],
        len: usize,
    },
    // Zero-length completions land here too, with no error attached
    Failed {
        elapsed: Duration,
        error: Option<UsbError>,
    },
}

#[derive(Debug)]
struct LoopStats {
    reports: u64,
    malformed: u64,
    timeouts: u64,
    last_log_time: chrono::DateTime<Local>,
}

impl LoopStats {
    fn new() -> Self {
        Self {
            reports: 0,
            malformed: 0,
            timeouts: 0,
            last_log_time: Local::now(),
        }
    }

    fn maybe_log(&mut self, device_id: u32) {
        let log_interval = chrono::Duration::seconds(30);
        let now = Local::now();
        if now - self.last_log_time > log_interval {
            debug!(
                "Device #{} input stats: {} reports, {} malformed, {} timeouts in last {} seconds",
                device_id,
                self.reports,
                self.malformed,
                self.timeouts,
                log_interval.num_seconds()
            );
            self.reports = 0;
            self.malformed = 0;
            self.timeouts = 0;
            self.last_log_time = now;
        }
    }
}

/// Read loop of one started driver
///
/// Owns the button tracker and the last reported controller state. Everything
/// it shares with the driver handle goes through [`DriverShared`].
///
/// # Termination
///
/// - the cancellation token fires (any stop(), host or loop initiated)
/// - a read fails before the hard-error threshold, which stops the driver
/// - the blocking read task panics, which also stops the driver
pub(crate) struct InputReadLoop {
    shared: Arc<DriverShared>,
    endpoint: EndpointDescriptor,
    settings: DriverSettings,
    tracker: ButtonTracker,
    state: ControllerState,
    stats: LoopStats,
}

impl InputReadLoop {
    pub(crate) fn new(
        shared: Arc<DriverShared>,
        endpoint: EndpointDescriptor,
        settings: DriverSettings,
    ) -> Self {
        Self {
            shared,
            endpoint,
            settings,
            tracker: ButtonTracker::new(),
            state: ControllerState::default(),
            stats: LoopStats::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.shared.cancel_token().clone();
        let device_id = self.shared.identity().device_id;

        // Give a previous instance of this accessory time to go away, otherwise
        // the host may refuse to hand out its controller slot again
        debug!(
            "Waiting {:?} before announcing device #{}",
            self.settings.settle_delay(),
            device_id
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Device #{} stopped during settle delay", device_id);
                return;
            }
            _ = tokio::time::sleep(self.settings.settle_delay()) => {}
        }

        // Added must be reported before any input
        self.shared.notify(DriverEvent::DeviceAdded {
            identity: self.shared.identity().clone(),
            timestamp: Local::now(),
        });
        info!("Starting input loop for {}", self.shared.identity());

        while !self.shared.is_stopped() {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.read_once() => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Report { buf, len }) => self.handle_report(&buf[..len]),
                Ok(ReadOutcome::Failed { elapsed, error }) => {
                    // Reads cut short by our own teardown are not device errors
                    if self.shared.is_stopped() {
                        break;
                    }

                    match classify_failure(elapsed, self.settings.hard_error_threshold()) {
                        ReadFailure::HardIo => {
                            match error {
                                Some(e) => warn!("Detected device I/O error after {:?}: {}", elapsed, e),
                                None => warn!("Detected device I/O error after {:?}: empty transfer", elapsed),
                            }
                            self.shared.stop();
                            break;
                        }
                        ReadFailure::Timeout => {
                            trace!("Read on device #{} timed out after {:?}", device_id, elapsed);
                            self.stats.timeouts += 1;
                        }
                    }
                }
                Err(e) => {
                    error!("Read task for device #{} failed: {}", device_id, e);
                    self.shared.stop();
                    break;
                }
            }

            self.stats.maybe_log(device_id);
        }

        info!("Input loop for device #{} finished", device_id);
    }

    async fn read_once(&self) -> Result<ReadOutcome, JoinError> {
        let port = Arc::clone(self.shared.port());
        let endpoint = self.endpoint.clone();
        let timeout = self.settings.read_timeout();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_LEN];
            let started = Instant::now();
            let result = port.read(&endpoint, &mut buf, timeout);
            let elapsed = started.elapsed();

            match result {
                Ok(len) if len > 0 => ReadOutcome::Report { buf, len },
                Ok(_) => ReadOutcome::Failed {
                    elapsed,
                    error: None,
                },
                Err(e) => ReadOutcome::Failed {
                    elapsed,
                    error: Some(e),
                },
            }
        })
        .await
    }

    fn handle_report(&mut self, report: &[u8]) {
        let key = match parse_report(report) {
            Ok(key) => key,
            Err(e) => {
                error!("{}", e);
                self.stats.malformed += 1;
                return;
            }
        };

        self.stats.reports += 1;
        debug!("Key {} {}", key.key_id, if key.is_down { "down" } else { "up" });

        if let Some(pressed) = self.tracker.apply(key) {
            self.state.set_button_flag(SPECIAL_BUTTON_FLAG, pressed);
            debug!(
                "Special button {} on device #{}",
                if pressed { "pressed" } else { "released" },
                self.shared.identity().device_id
            );
            self.shared.notify(DriverEvent::InputUpdated {
                device_id: self.shared.identity().device_id,
                state: self.state.clone(),
                timestamp: Local::now(),
            });
        }
    }
}
