use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle};
use tracing::{debug, info, warn};

use super::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferType, UsbError, UsbPort};

/// Shared slot for an open handle that can be given up while transfers run
///
/// Transfers clone the handle out of the slot and hold it only for their own
/// duration. Once [`HandleSlot::take`] empties the slot, the handle is dropped
/// as soon as the last in-flight transfer returns.
pub(crate) struct HandleSlot<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> HandleSlot<T> {
    pub(crate) fn new(handle: T) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(handle))),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Empty the slot; returns false if it was already empty
    pub(crate) fn take(&self) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// libusb-backed [`UsbPort`]
///
/// The interface layout is captured once at open time. close() gives up the
/// libusb handle; libusb closes the device once a read still in flight on
/// another thread has returned.
pub struct RusbPort {
    handle: HandleSlot<DeviceHandle<Context>>,
    vendor_id: u16,
    product_id: u16,
    bus: u8,
    address: u8,
    interfaces: Vec<InterfaceDescriptor>,
    // Interfaces whose kernel driver we detached and must hand back on release
    detached: Mutex<HashSet<u8>>,
}

impl RusbPort {
    pub fn open(device: &Device<Context>) -> Result<Self, UsbError> {
        let descriptor = device.device_descriptor()?;
        let config = device.active_config_descriptor()?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            // Only alternate setting 0 is ever selected for the side channel
            if let Some(desc) = interface
                .descriptors()
                .find(|d| d.setting_number() == 0)
            {
                interfaces.push(InterfaceDescriptor {
                    number: interface.number(),
                    class: desc.class_code(),
                    subclass: desc.sub_class_code(),
                    protocol: desc.protocol_code(),
                    endpoints: desc
                        .endpoint_descriptors()
                        .map(|ep| EndpointDescriptor {
                            address: ep.address(),
                            direction: map_direction(ep.direction()),
                            transfer_type: map_transfer_type(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                });
            }
        }

        let handle = device.open()?;
        debug!(
            "Opened {:04x}:{:04x} (Bus {:03} Dev {:03}) with {} interfaces",
            descriptor.vendor_id(),
            descriptor.product_id(),
            device.bus_number(),
            device.address(),
            interfaces.len()
        );

        Ok(Self {
            handle: HandleSlot::new(handle),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus: device.bus_number(),
            address: device.address(),
            interfaces,
            detached: Mutex::new(HashSet::new()),
        })
    }

    fn handle(&self) -> Result<Arc<DeviceHandle<Context>>, UsbError> {
        self.handle.get().ok_or(UsbError::Closed)
    }
}

impl fmt::Debug for RusbPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusbPort")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.product_id))
            .field("bus", &self.bus)
            .field("address", &self.address)
            .field("open", &self.handle.is_open())
            .finish()
    }
}

impl UsbPort for RusbPort {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn interfaces(&self) -> Vec<InterfaceDescriptor> {
        self.interfaces.clone()
    }

    fn claim_interface(&self, number: u8, force: bool) -> Result<(), UsbError> {
        let handle = self.handle()?;

        if force {
            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    info!("Detaching kernel driver from interface {}", number);
                    handle.detach_kernel_driver(number)?;
                    self.detached
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(number);
                }
                Ok(false) => {}
                // Platforms without kernel driver control still allow the claim
                Err(rusb::Error::NotSupported) => {}
                Err(e) => return Err(e.into()),
            }
        }

        handle.claim_interface(number)?;
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<(), UsbError> {
        let handle = self.handle()?;
        let released = handle.release_interface(number);

        let was_detached = self
            .detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&number);
        if was_detached {
            if let Err(e) = handle.attach_kernel_driver(number) {
                warn!("Failed to reattach kernel driver to interface {}: {}", number, e);
            }
        }

        released.map_err(UsbError::from)
    }

    fn read(
        &self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let handle = self.handle()?;

        let result = match endpoint.transfer_type {
            TransferType::Interrupt => handle.read_interrupt(endpoint.address, buf, timeout),
            _ => handle.read_bulk(endpoint.address, buf, timeout),
        };

        match result {
            Ok(len) => Ok(len),
            Err(rusb::Error::Timeout) => Err(UsbError::Timeout),
            Err(rusb::Error::Interrupted) => Err(UsbError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    fn close(&self) {
        if self.handle.take() {
            debug!(
                "Closed port {:04x}:{:04x} (Bus {:03} Dev {:03})",
                self.vendor_id, self.product_id, self.bus, self.address
            );
        }
    }
}

fn map_direction(direction: rusb::Direction) -> Direction {
    match direction {
        rusb::Direction::In => Direction::In,
        rusb::Direction::Out => Direction::Out,
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> TransferType {
    match transfer_type {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountsDrops<'a>(&'a AtomicUsize);

    impl Drop for CountsDrops<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn taking_the_slot_drops_an_idle_handle() {
        let drops = AtomicUsize::new(0);
        let slot = HandleSlot::new(CountsDrops(&drops));

        assert!(slot.is_open());
        assert!(slot.take());

        assert!(!slot.is_open());
        assert!(slot.get().is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!slot.take());
    }

    #[test]
    fn in_flight_transfer_keeps_handle_until_it_returns() {
        let drops = AtomicUsize::new(0);
        let slot = HandleSlot::new(CountsDrops(&drops));

        let in_flight = slot.get().unwrap();
        assert!(slot.take());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(slot.get().is_none());

        drop(in_flight);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
