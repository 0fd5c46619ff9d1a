//! OpenTelemetry publisher: one OTLP-metrics JSON document per
//! sample, carrying a single gauge data point.
//!
//! Non-numeric values are encoded as `asDouble = len(value)`, which
//! keeps the gauge well-formed at the cost of turning the reading
//! into a cardinality signal.

use super::DataModel;
use chrono::Utc;
use mapper_api::{types::device::OtelPushConfig, Error, Result};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCOPE_NAME: &str = "mapperd/data/publish/otel";

pub struct OtelPublisher {
    cfg: OtelPushConfig,
    client: reqwest::Client,
}

fn as_double(value: &str) -> f64 {
    match value.parse::<f64>() {
        Ok(v) => v,
        Err(_) => value.len() as f64,
    }
}

fn build_payload(cfg: &OtelPushConfig, data: &DataModel) -> serde_json::Value {
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    json!({
        "resourceMetrics": [{
            "resource": {
                "attributes": [{
                    "key": "service.name",
                    "value": { "stringValue": &cfg.service_name }
                }]
            },
            "scopeMetrics": [{
                "scope": { "name": SCOPE_NAME },
                "metrics": [{
                    "name": &data.property_name,
                    "description": "Device property value",
                    "gauge": {
                        "dataPoints": [{
                            "attributes": [{
                                "key": "device_name",
                                "value": { "stringValue": &data.device_name }
                            }],
                            "timeUnixNano": now_ns.to_string(),
                            "asDouble": as_double(&data.value)
                        }]
                    }
                }]
            }]
        }]
    })
}

impl OtelPublisher {
    pub fn new(cfg: &OtelPushConfig) -> Result<OtelPublisher> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        info!("otel publisher created -- endpoint: {}", &cfg.endpoint);
        Ok(OtelPublisher {
            cfg: cfg.clone(),
            client,
        })
    }

    pub async fn publish(&self, data: &DataModel) -> Result<()> {
        let payload = build_payload(&self.cfg, data);
        let resp = self
            .client
            .post(&self.cfg.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        if resp.status().is_success() {
            debug!("otel publish ok -- metric: {}", &data.property_name);
            Ok(())
        } else {
            warn!("otel publish rejected -- status: {}", resp.status());
            Err(Error::SinkError(format!(
                "publish rejected with status {}",
                resp.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_values_parse() {
        assert_eq!(as_double("42"), 42.0);
        assert_eq!(as_double("-3.5"), -3.5);
    }

    #[test]
    fn test_non_numeric_values_degrade_to_length() {
        assert_eq!(as_double("running"), 7.0);
        assert_eq!(as_double(""), 0.0);
        assert_eq!(as_double("42 rpm"), 6.0);
    }

    #[test]
    fn test_payload_shape() {
        let cfg = OtelPushConfig::default();
        let dm = DataModel::new("ns1", "d1", "temp", "42", 0);
        let payload = build_payload(&cfg, &dm);
        let metric =
            &payload["resourceMetrics"][0]["scopeMetrics"][0]["metrics"][0];

        assert_eq!(metric["name"], "temp");

        let point = &metric["gauge"]["dataPoints"][0];

        assert_eq!(point["asDouble"], 42.0);
        assert_eq!(
            point["attributes"][0]["value"]["stringValue"],
            "d1"
        );
        assert_eq!(
            payload["resourceMetrics"][0]["resource"]["attributes"][0]["value"]
                ["stringValue"],
            "edge-mapper"
        );
    }
}
