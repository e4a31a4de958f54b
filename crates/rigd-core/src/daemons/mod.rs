//! The closed set of peripheral drivers.
//!
//! One driver per supported peripheral class; discovery output is mapped
//! onto this set through [`build_driver`] and nothing else. Adding hardware
//! support means adding a variant here, not runtime type inspection.

use crate::daemon::PeripheralDriver;
use crate::peripheral::{PeripheralDescriptor, PeripheralKind};

/// Serial microcontroller driver (line wire protocol).
pub mod microcontroller;
/// RF instrument driver (long-running scans).
pub mod radio;
/// USB inference-accelerator driver.
pub mod accelerator;

pub use accelerator::AcceleratorDriver;
pub use microcontroller::MicrocontrollerDriver;
pub use radio::RadioDriver;

/// Build the driver matching a descriptor's class.
pub fn build_driver(descriptor: &PeripheralDescriptor) -> Box<dyn PeripheralDriver> {
    match descriptor.kind {
        PeripheralKind::Microcontroller => {
            Box::new(MicrocontrollerDriver::new(descriptor.clone()))
        }
        PeripheralKind::Radio => Box::new(RadioDriver::new(descriptor.clone())),
        PeripheralKind::Accelerator => Box::new(AcceleratorDriver::new(descriptor.clone())),
    }
}
