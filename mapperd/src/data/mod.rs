//! Sinks for sampled device data: time-series recorders and push
//! publishers.
//!
//! All sink handles live in one [`SinkSet`] owned by the main task
//! and shared into each device runtime. A sink failure never reaches
//! the reconciliation loop as anything but a logged warning.

use mapper_api::{
    types::device::{DbMethod, DeviceProperty},
    Result,
};
use serde_derive::Serialize;

pub mod publish;
pub mod recorder;

/// The canonical envelope a sampled value travels in, regardless of
/// which sink receives it.
#[derive(Clone, Debug, Serialize)]
pub struct DataModel {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    pub namespace: String,
    #[serde(rename = "propertyName")]
    pub property_name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: String,

    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl DataModel {
    pub fn new(
        ns: &str,
        device: &str,
        property: &str,
        value: &str,
        ts_ms: i64,
    ) -> DataModel {
        DataModel {
            device_name: device.to_string(),
            namespace: ns.to_string(),
            property_name: property.to_string(),
            value: value.to_string(),
            value_type: String::from("string"),
            timestamp: ts_ms,
        }
    }
}

/// Makes a string safe to use as a database identifier: lowercased,
/// restricted to ASCII letters, digits, `-`, `_` and `/`, with every
/// other byte replaced by `_`. An empty input yields the fallback.
pub fn sanitize_id(input: &str, fallback: &str) -> String {
    if input.is_empty() {
        return fallback.to_string();
    }

    let cleaned: String = input
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();

            if c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, '-' | '_' | '/')
            {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// The sink capabilities handed to every device runtime: one handle
/// per database backend plus the publisher cache. Each recorder
/// serializes its own operations, so fan-out from the device loops
/// stays sequential per backend.
pub struct SinkSet {
    pub mysql: recorder::mysql::MySqlRecorder,
    pub redis: recorder::redis::RedisRecorder,
    pub influx: recorder::influxdb2::InfluxRecorder,
    pub tdengine: recorder::tdengine::TdEngineRecorder,
    pub publishers: publish::PublisherCache,
}

impl SinkSet {
    pub fn new() -> SinkSet {
        SinkSet {
            mysql: recorder::mysql::MySqlRecorder::new(),
            redis: recorder::redis::RedisRecorder::new(),
            influx: recorder::influxdb2::InfluxRecorder::new(),
            tdengine: recorder::tdengine::TdEngineRecorder::new(),
            publishers: publish::PublisherCache::new(),
        }
    }

    /// Records one sample to the backend the property selects. A
    /// property without a database method is a no-op success.
    pub async fn record(
        &self,
        prop: &DeviceProperty,
        data: &DataModel,
    ) -> Result<()> {
        let db = match prop.push_method.as_ref().and_then(|pm| pm.db.as_ref())
        {
            Some(db) => db,
            None => return Ok(()),
        };

        match db {
            DbMethod::MySql(cfg) => self.mysql.record(cfg, data).await,
            DbMethod::Redis(cfg) => self.redis.record(cfg, data).await,
            DbMethod::Influx(cfg) => self.influx.record(cfg, data).await,
            DbMethod::TdEngine(cfg) => self.tdengine.record(cfg, data).await,
        }
    }

    /// Publishes one sample through the property's push channel. A
    /// property without one is a no-op success.
    pub async fn publish(
        &self,
        prop: &DeviceProperty,
        data: &DataModel,
    ) -> Result<()> {
        let channel =
            match prop.push_method.as_ref().and_then(|pm| pm.channel.as_ref())
            {
                Some(channel) => channel,
                None => return Ok(()),
            };

        self.publishers.publish_dynamic(channel, data).await
    }

    /// Tears down every cached connection. Used at process shutdown.
    pub async fn close(&self) {
        self.mysql.close().await;
        self.redis.close().await;
        self.influx.close().await;
        self.tdengine.close().await;
    }
}

impl Default for SinkSet {
    fn default() -> Self {
        SinkSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("", "default"), "default");
        assert_eq!(sanitize_id("ns1", "default"), "ns1");
        assert_eq!(sanitize_id("NS-1/dev_2", "x"), "ns-1/dev_2");
        assert_eq!(sanitize_id("temp sensor #7", "x"), "temp_sensor__7");
        assert_eq!(sanitize_id("Ärger", "x"), "_rger");
    }

    #[test]
    fn test_data_model_json_shape() {
        let dm = DataModel::new("ns1", "d1", "temp", "42", 1700000000000);
        let json = serde_json::to_value(&dm).unwrap();

        assert_eq!(json["deviceName"], "d1");
        assert_eq!(json["namespace"], "ns1");
        assert_eq!(json["propertyName"], "temp");
        assert_eq!(json["value"], "42");
        assert_eq!(json["type"], "string");
        assert_eq!(json["timestamp"], 1700000000000i64);
    }
}
