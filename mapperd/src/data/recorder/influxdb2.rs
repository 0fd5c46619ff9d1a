//! InfluxDB2 recorder. Writes one line-protocol point per sample to
//! the v2 write endpoint. The API token comes from the `TOKEN`
//! environment variable; measurement and field names fall back to
//! sanitized identifiers derived from the sample itself.

use super::super::{sanitize_id, DataModel};
use mapper_api::{types::device::InfluxDbConfig, Error, Result};
use std::{env, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct Handle {
    cfg: InfluxDbConfig,
    token: String,
    client: reqwest::Client,
}

/// Recorder for the InfluxDB2 backend. Operations serialize behind
/// the recorder's lock, including the HTTP write.
pub struct InfluxRecorder {
    handle: Mutex<Option<Handle>>,
}

fn build_handle(cfg: &InfluxDbConfig) -> Result<Handle> {
    if cfg.url.is_empty() {
        return Err(Error::ConfigError(String::from(
            "influxdb2 config has no url",
        )));
    }

    let client = reqwest::Client::builder()
        .timeout(WRITE_TIMEOUT)
        .build()
        .map_err(|e| Error::SinkError(format!("{}", e)))?;

    info!("influxdb2 recorder ready -- url: {}", &cfg.url);
    Ok(Handle {
        cfg: cfg.clone(),
        token: env::var("TOKEN").unwrap_or_default(),
        client,
    })
}

// Assembles the line protocol for one sample: measurement, tags in
// configured order, then the field as a quoted string value.

fn build_line(cfg: &InfluxDbConfig, data: &DataModel) -> String {
    let measurement = cfg.measurement.clone().unwrap_or_else(|| {
        format!(
            "{}_{}",
            sanitize_id(&data.namespace, "default"),
            sanitize_id(&data.device_name, "device")
        )
    });
    let mut line = measurement;

    for (key, value) in &cfg.tags {
        let value = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };

        line.push_str(&format!(",{}={}", key, value));
    }

    let field = cfg
        .field_key
        .clone()
        .unwrap_or_else(|| sanitize_id(&data.property_name, "property"));

    line.push_str(&format!(" {}=\"{}\"", field, &data.value));
    line
}

impl InfluxRecorder {
    pub fn new() -> InfluxRecorder {
        InfluxRecorder {
            handle: Mutex::new(None),
        }
    }

    /// Replaces any existing handle with one for `cfg`.
    pub async fn set_db(&self, cfg: &InfluxDbConfig) -> Result<()> {
        let mut handle = self.handle.lock().await;

        *handle = Some(build_handle(cfg)?);
        Ok(())
    }

    /// Records one sample, setting the handle up lazily from `cfg`
    /// on first use.
    pub async fn record(
        &self,
        cfg: &InfluxDbConfig,
        data: &DataModel,
    ) -> Result<()> {
        let mut handle = self.handle.lock().await;

        if handle.is_none() {
            match build_handle(cfg) {
                Ok(h) => *handle = Some(h),
                Err(e) => {
                    warn!("influxdb2 recorder not available -- {}", &e);
                    return Err(e);
                }
            }
        }

        let h = handle.as_ref().unwrap();
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            &h.cfg.url, &h.cfg.org, &h.cfg.bucket
        );
        let line = build_line(&h.cfg, data);

        let resp = h
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", &h.token))
            .header("Content-Type", "text/plain")
            .body(line.clone())
            .send()
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        if resp.status().is_success() {
            debug!("influxdb2 record ok -- line: {}", &line);
            Ok(())
        } else {
            warn!("influxdb2 write rejected -- status: {}", resp.status());
            Err(Error::SinkError(format!(
                "write rejected with status {}",
                resp.status()
            )))
        }
    }

    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;

        *handle = None;
    }
}

impl Default for InfluxRecorder {
    fn default() -> Self {
        InfluxRecorder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataModel {
        DataModel::new("Factory A", "Press-1", "Oil Temp", "88.5", 0)
    }

    #[test]
    fn test_line_defaults() {
        let cfg = InfluxDbConfig::default();

        assert_eq!(
            build_line(&cfg, &sample()),
            "factory_a_press-1 oil_temp=\"88.5\""
        );
    }

    #[test]
    fn test_line_with_measurement_tags_and_field() {
        let cfg: InfluxDbConfig = serde_json::from_str(
            r#"{"url": "http://influx:8086", "org": "edge", "bucket": "b",
                "measurement": "presses",
                "tag": {"site": "plant7", "line": "3"},
                "fieldKey": "oil_temp"}"#,
        )
        .unwrap();

        // Tags must appear in configured order.

        assert_eq!(
            build_line(&cfg, &sample()),
            "presses,site=plant7,line=3 oil_temp=\"88.5\""
        );
    }

    #[tokio::test]
    async fn test_record_without_url_fails() {
        let rec = InfluxRecorder::new();

        assert!(rec
            .record(&InfluxDbConfig::default(), &sample())
            .await
            .is_err());
        assert!(rec.handle.lock().await.is_none());
    }
}
