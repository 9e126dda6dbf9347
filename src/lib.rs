//! Driver for the button side channel of the Backbone One controller
//!
//! The Backbone One exposes its Backbone and screenshot buttons on a
//! vendor-specific USB interface next to its HID gamepad interface. This
//! crate claims that interface, decodes its reports and surfaces both buttons
//! as the single guide/home button of a generic controller.

pub mod config;
pub mod controller;
pub mod usb;
