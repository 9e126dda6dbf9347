use tracing::{debug, info};

use super::controller_handle::{is_backbone_one, BackboneOneButton};
use super::driver::{ControllerDriver, DriverContext};

pub type DeviceMatcher = fn(u16, u16) -> bool;
pub type DriverConstructor = fn(DriverContext) -> Box<dyn ControllerDriver>;

#[derive(Debug, Clone, Copy)]
pub struct DriverEntry {
    pub name: &'static str,
    pub matches: DeviceMatcher,
    pub construct: DriverConstructor,
}

/// Maps (vendor id, product id) to the driver that handles the device
///
/// Entries are tried in registration order and the first match wins.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    entries: Vec<DriverEntry>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BackboneOneButton::NAME, is_backbone_one, BackboneOneButton::boxed);
        registry
    }

    pub fn register(&mut self, name: &'static str, matches: DeviceMatcher, construct: DriverConstructor) {
        debug!("Registering driver {}", name);
        self.entries.push(DriverEntry {
            name,
            matches,
            construct,
        });
    }

    pub fn find(&self, vendor_id: u16, product_id: u16) -> Option<&DriverEntry> {
        self.entries
            .iter()
            .find(|entry| (entry.matches)(vendor_id, product_id))
    }

    /// Construct the driver for the port in `ctx`, if any entry claims it
    pub fn build(&self, ctx: DriverContext) -> Option<Box<dyn ControllerDriver>> {
        let vendor_id = ctx.port.vendor_id();
        let product_id = ctx.port.product_id();
        let entry = self.find(vendor_id, product_id)?;

        info!(
            "Using {} driver for {:04x}:{:04x}",
            entry.name, vendor_id, product_id
        );
        Some((entry.construct)(ctx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
