//! HTTP publisher: a synchronous JSON POST (or PUT) per sample, with
//! bounded retries on transport failure or a non-2xx reply.

use super::DataModel;
use mapper_api::{types::device::HttpPushConfig, Error, Result};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct HttpPublisher {
    cfg: HttpPushConfig,
    client: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(cfg: &HttpPushConfig) -> Result<HttpPublisher> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        info!("http publisher created -- endpoint: {}", &cfg.endpoint);
        Ok(HttpPublisher {
            cfg: cfg.clone(),
            client,
        })
    }

    pub async fn publish(&self, data: &DataModel) -> Result<()> {
        let attempts = self.cfg.retry_count.max(1);

        for attempt in 1..=attempts {
            let req = if self.cfg.method == "PUT" {
                self.client.put(&self.cfg.endpoint)
            } else {
                self.client.post(&self.cfg.endpoint)
            };

            match req.json(data).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("http publish ok -- status: {}", resp.status());
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        "http publish rejected -- status: {} (attempt {}/{})",
                        resp.status(),
                        attempt,
                        attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "http publish failed -- {} (attempt {}/{})",
                        e, attempt, attempts
                    );
                }
            }
        }

        error!("http publish gave up after {} attempts", attempts);
        Err(Error::SinkError(format!(
            "publish to {} failed after {} attempts",
            &self.cfg.endpoint, attempts
        )))
    }
}
