//! Time-series recorders. Each backend keeps at most one cached
//! connection, serializes its operations behind a single lock, and
//! lazily connects on the first write that arrives with a usable
//! configuration.

pub mod influxdb2;
pub mod mysql;
pub mod redis;
pub mod tdengine;
