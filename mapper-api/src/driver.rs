//! Defines the interface between the mapper core and a protocol
//! driver.
//!
//! A driver is the only component allowed to touch device-specific
//! resources. The core hands it a [`ProtocolConfig`] at construction
//! and a [`Visitor`] per operation; everything else — scheduling,
//! twins, sinks — stays on the core's side of the seam.

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Represents the type used to specify the name of a driver.
pub type Name = Arc<str>;

/// Protocol settings for one device, as delivered by the control
/// plane. `config_data` is an opaque JSON object; its layout is a
/// contract between the device definition and the driver.
#[derive(Clone, Debug, Default)]
pub struct ProtocolConfig {
    pub protocol_name: String,
    pub config_data: String,
}

/// Property-specific addressing hint passed to a driver for a single
/// read or write. `offset` is resolved by the core before the call
/// (register index, channel number, or similar).
#[derive(Clone, Debug, Default)]
pub struct Visitor {
    pub property_name: String,
    pub protocol_name: String,

    /// Opaque visitor JSON from the device definition.
    pub config_data: String,

    pub offset: Option<i64>,
}

/// All protocol drivers implement `DeviceClient`.
///
/// One client instance serves exactly one device. The client owns its
/// own mutual exclusion: concurrent `read`/`write` calls on one
/// client must serialize inside the implementation, not in the
/// caller. Dropping the client releases its resources.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Establishes the connection to the device. Called once before
    /// the reconciliation loop starts; a failure here keeps the
    /// device offline.
    async fn init(&self) -> Result<()>;

    /// Reads the current raw value of the property addressed by
    /// `visitor`.
    async fn read(&self, visitor: &Visitor) -> Result<Vec<u8>>;

    /// Writes `value` to the property addressed by `visitor`.
    async fn write(&self, value: &str, visitor: &Visitor) -> Result<()>;

    /// Tells the device to stop. Read/write calls after `stop` may
    /// fail.
    async fn stop(&self) -> Result<()>;

    /// Returns the raw, driver-specific status string. The core
    /// normalizes it; drivers don't have to.
    async fn state(&self) -> Result<String>;
}
