//! In-memory [`UsbPort`] that replays a script of transfer results

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferType, UsbError, UsbPort};

#[derive(Debug, Clone)]
pub(crate) enum ScriptedRead {
    /// Completes immediately with these bytes
    Report(Vec<u8>),
    /// Completes with zero bytes after the delay
    ZeroLength { after: Duration },
    /// Fails after the delay
    Fail { after: Duration },
}

// Parks a claim until the test lets it through
#[derive(Debug)]
struct ClaimGate {
    entered: std_mpsc::Sender<()>,
    proceed: std_mpsc::Receiver<()>,
}

#[derive(Debug)]
pub(crate) struct ScriptedPort {
    vendor_id: u16,
    product_id: u16,
    interfaces: Vec<InterfaceDescriptor>,
    reject_claims: bool,
    claim_gate: Mutex<Option<ClaimGate>>,
    reads: Mutex<VecDeque<ScriptedRead>>,
    pub claim_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    pub active_reads: AtomicUsize,
    released: AtomicBool,
    closed: AtomicBool,
}

pub(crate) fn endpoint(address: u8, transfer_type: TransferType) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        direction: if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        },
        transfer_type,
        max_packet_size: 64,
    }
}

pub(crate) fn interface(
    number: u8,
    class: (u8, u8, u8),
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        class: class.0,
        subclass: class.1,
        protocol: class.2,
        endpoints,
    }
}

/// Layout of the accessory: a HID gamepad interface plus the vendor side channel
pub(crate) fn backbone_interfaces() -> Vec<InterfaceDescriptor> {
    vec![
        interface(0, (3, 0, 0), vec![endpoint(0x81, TransferType::Interrupt)]),
        interface(
            1,
            (255, 2, 1),
            vec![
                endpoint(0x02, TransferType::Bulk),
                endpoint(0x82, TransferType::Bulk),
            ],
        ),
    ]
}

/// A 14-byte side channel report for `key_id`
pub(crate) fn key_report(key_id: u8, is_down: bool) -> Vec<u8> {
    let mut report = vec![0u8; 14];
    report[7] = key_id;
    report[12] = u8::from(is_down);
    report
}

impl ScriptedPort {
    pub fn new(vendor_id: u16, product_id: u16, interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            vendor_id,
            product_id,
            interfaces,
            reject_claims: false,
            claim_gate: Mutex::new(None),
            reads: Mutex::new(VecDeque::new()),
            claim_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            active_reads: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backbone() -> Self {
        Self::new(0x358A, 0x202, backbone_interfaces())
    }

    pub fn rejecting_claims(mut self) -> Self {
        self.reject_claims = true;
        self
    }

    /// Block the first claim until the returned sender fires
    ///
    /// The receiver gets a message once the claim has been entered.
    pub fn pausing_first_claim(self) -> (Self, std_mpsc::Receiver<()>, std_mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (proceed_tx, proceed_rx) = std_mpsc::channel();
        *self.claim_gate.lock().expect("gate lock") = Some(ClaimGate {
            entered: entered_tx,
            proceed: proceed_rx,
        });
        (self, entered_rx, proceed_tx)
    }

    pub fn with_reads(self, reads: impl IntoIterator<Item = ScriptedRead>) -> Self {
        self.reads
            .lock()
            .expect("script lock")
            .extend(reads);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    // Sleeps for `duration` unless the interface is released first
    fn wait(&self, duration: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < duration {
            if self.released.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn scripted_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        let next = self.reads.lock().expect("script lock").pop_front();
        match next {
            Some(ScriptedRead::Report(bytes)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            Some(ScriptedRead::ZeroLength { after }) => {
                if self.wait(after) {
                    return Err(UsbError::Cancelled);
                }
                Ok(0)
            }
            Some(ScriptedRead::Fail { after }) => {
                if self.wait(after) {
                    return Err(UsbError::Cancelled);
                }
                Err(UsbError::Usb(rusb::Error::Io))
            }
            None => {
                if self.wait(timeout) {
                    return Err(UsbError::Cancelled);
                }
                Err(UsbError::Timeout)
            }
        }
    }
}

impl UsbPort for ScriptedPort {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn interfaces(&self) -> Vec<InterfaceDescriptor> {
        self.interfaces.clone()
    }

    fn claim_interface(&self, _number: u8, _force: bool) -> Result<(), UsbError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.claim_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.proceed.recv();
        }
        if self.reject_claims {
            return Err(UsbError::Usb(rusb::Error::Busy));
        }
        Ok(())
    }

    fn release_interface(&self, _number: u8) -> Result<(), UsbError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read(
        &self,
        _endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(UsbError::Closed);
        }

        self.active_reads.fetch_add(1, Ordering::SeqCst);
        let result = self.scripted_read(buf, timeout);
        self.active_reads.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
