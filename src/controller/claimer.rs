use std::sync::Arc;

use statum::{machine, state};
use tracing::{debug, info, warn};

use super::error::ClaimError;
use crate::usb::{Direction, EndpointDescriptor, InterfaceDescriptor, UsbPort};

// Vendor-specific interface carrying the extra buttons
pub const SIDE_CHANNEL_CLASS: u8 = 255;
pub const SIDE_CHANNEL_SUBCLASS: u8 = 2;
pub const SIDE_CHANNEL_PROTOCOL: u8 = 1;

pub fn is_side_channel_interface(desc: &InterfaceDescriptor) -> bool {
    desc.class == SIDE_CHANNEL_CLASS
        && desc.subclass == SIDE_CHANNEL_SUBCLASS
        && desc.protocol == SIDE_CHANNEL_PROTOCOL
}

/// The claimed side channel and its single inbound endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedInterface {
    pub interface_number: u8,
    pub endpoint: EndpointDescriptor,
}

#[state]
#[derive(Debug, Clone)]
pub enum ClaimState {
    Located,
    Claimed,
}

#[machine]
#[derive(Debug)]
pub struct SideChannel<S: ClaimState> {
    port: Arc<dyn UsbPort>,
    interface: InterfaceDescriptor,
}

impl<S: ClaimState> SideChannel<S> {
    pub fn interface_number(&self) -> u8 {
        self.interface.number
    }
}

impl SideChannel<Located> {
    /// Find the first side channel interface on the device
    pub fn locate(port: Arc<dyn UsbPort>) -> Result<Self, ClaimError> {
        let interface = port
            .interfaces()
            .into_iter()
            .find(is_side_channel_interface)
            .ok_or(ClaimError::NoMatchingInterface)?;

        debug!(
            "Located side channel on interface {} with {} endpoints",
            interface.number,
            interface.endpoints.len()
        );
        Ok(Self::new(port, interface))
    }

    pub fn claim(self) -> Result<SideChannel<Claimed>, ClaimError> {
        if let Err(e) = self.port.claim_interface(self.interface.number, true) {
            warn!("Failed to claim interfaces: {}", e);
            return Err(ClaimError::ClaimRejected(e));
        }

        info!("Claimed side channel interface {}", self.interface.number);
        Ok(self.transition())
    }
}

impl SideChannel<Claimed> {
    /// Validate the endpoint layout, giving the interface back if it is unusable
    pub fn into_claimed(self) -> Result<ClaimedInterface, ClaimError> {
        match single_inbound_endpoint(&self.interface) {
            Ok(endpoint) => Ok(ClaimedInterface {
                interface_number: self.interface.number,
                endpoint,
            }),
            Err(e) => {
                warn!("{}", e);
                if let Err(release_err) = self.port.release_interface(self.interface.number) {
                    warn!(
                        "Failed to release interface {}: {}",
                        self.interface.number, release_err
                    );
                }
                Err(e)
            }
        }
    }
}

fn single_inbound_endpoint(interface: &InterfaceDescriptor) -> Result<EndpointDescriptor, ClaimError> {
    let mut inbound = None;
    for endpoint in &interface.endpoints {
        if endpoint.direction == Direction::In {
            if inbound.is_some() {
                return Err(ClaimError::DuplicateEndpoint);
            }
            inbound = Some(endpoint.clone());
        }
    }
    inbound.ok_or(ClaimError::MissingEndpoint)
}

/// Locate, claim and validate the side channel in one go
pub fn claim_side_channel(port: Arc<dyn UsbPort>) -> Result<ClaimedInterface, ClaimError> {
    SideChannel::<Located>::locate(port)?.claim()?.into_claimed()
}
