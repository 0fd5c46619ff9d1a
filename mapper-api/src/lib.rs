//! Traits and types shared by the mapper daemon and its protocol
//! drivers.
//!
//! The mapper mediates between a device-management control plane and
//! the devices attached to one edge node. This crate defines the
//! pieces both sides of that seam agree on: the device data model
//! (instances, models, twins), the error type, and the driver
//! interface a protocol implementation must provide.

pub mod driver;
pub mod types;

pub use types::Error;

/// A `Result` type where the error value is a
/// `mapper_api::types::Error`.

pub type Result<T> = std::result::Result<T, types::Error>;
