//! Push publishers. A publisher is created per (method, config)
//! pair and memoized in a small fixed-size cache so per-property
//! channels reuse connections.

use super::DataModel;
use mapper_api::{types::device::PushChannel, Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub mod http;
pub mod mqtt;
pub mod otel;

/// One connected push channel.
pub enum Publisher {
    Http(http::HttpPublisher),
    Mqtt(mqtt::MqttPublisher),
    Otel(otel::OtelPublisher),
}

impl Publisher {
    /// Builds a publisher for a parsed channel config. Unknown
    /// methods are an error; the caller logs and drops the sample.
    pub fn new(channel: &PushChannel) -> Result<Publisher> {
        match channel {
            PushChannel::Http(cfg) => {
                Ok(Publisher::Http(http::HttpPublisher::new(cfg)?))
            }
            PushChannel::Mqtt(cfg) => {
                Ok(Publisher::Mqtt(mqtt::MqttPublisher::new(cfg)))
            }
            PushChannel::Otel(cfg) => {
                Ok(Publisher::Otel(otel::OtelPublisher::new(cfg)?))
            }
            PushChannel::Unknown(name) => Err(Error::ConfigError(format!(
                "unknown publish method '{}'",
                name
            ))),
        }
    }

    pub async fn publish(&self, data: &DataModel) -> Result<()> {
        match self {
            Publisher::Http(p) => p.publish(data).await,
            Publisher::Mqtt(p) => p.publish(data).await,
            Publisher::Otel(p) => p.publish(data).await,
        }
    }
}

const CACHE_CAPACITY: usize = 8;

struct Slot {
    key: String,
    publisher: Arc<Publisher>,
}

/// Fixed-size publisher cache keyed by `method|configJson`. When the
/// cache is full, slot 0 is replaced and its publisher dropped.
pub struct PublisherCache {
    slots: Mutex<Vec<Slot>>,
}

impl PublisherCache {
    pub fn new() -> PublisherCache {
        PublisherCache {
            slots: Mutex::new(Vec::with_capacity(CACHE_CAPACITY)),
        }
    }

    /// Returns the cached publisher for `channel`, creating and
    /// caching one on first use.
    pub async fn resolve(
        &self,
        channel: &PushChannel,
    ) -> Result<Arc<Publisher>> {
        let key =
            format!("{}|{}", channel.method_name(), channel.config_json());
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.iter().find(|s| s.key == key) {
            return Ok(Arc::clone(&slot.publisher));
        }

        let publisher = Arc::new(Publisher::new(channel)?);

        debug!("caching publisher -- key: {}", &key);
        if slots.len() < CACHE_CAPACITY {
            slots.push(Slot {
                key,
                publisher: Arc::clone(&publisher),
            });
        } else {
            slots[0] = Slot {
                key,
                publisher: Arc::clone(&publisher),
            };
        }
        Ok(publisher)
    }

    /// Resolves the publisher for `channel` and delegates the
    /// publish to it.
    pub async fn publish_dynamic(
        &self,
        channel: &PushChannel,
        data: &DataModel,
    ) -> Result<()> {
        let publisher = match self.resolve(channel).await {
            Ok(p) => p,
            Err(e) => {
                warn!("publisher unavailable -- {}", &e);
                return Err(e);
            }
        };

        publisher.publish(data).await
    }
}

impl Default for PublisherCache {
    fn default() -> Self {
        PublisherCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapper_api::types::device::{HttpPushConfig, PushChannel};

    fn http_channel(endpoint: &str) -> PushChannel {
        PushChannel::Http(HttpPushConfig {
            endpoint: endpoint.to_string(),
            ..HttpPushConfig::default()
        })
    }

    #[tokio::test]
    async fn test_cache_reuses_by_key() {
        let cache = PublisherCache::new();
        let chan = http_channel("http://sink:1/a");

        let a = cache.resolve(&chan).await.unwrap();
        let b = cache.resolve(&chan).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.slots.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_evicts_slot_zero_on_overflow() {
        let cache = PublisherCache::new();

        for i in 0..CACHE_CAPACITY {
            let chan = http_channel(&format!("http://sink:1/{}", i));

            cache.resolve(&chan).await.unwrap();
        }
        assert_eq!(cache.slots.lock().await.len(), CACHE_CAPACITY);

        let first_key = cache.slots.lock().await[0].key.clone();

        cache
            .resolve(&http_channel("http://sink:1/overflow"))
            .await
            .unwrap();

        let slots = cache.slots.lock().await;

        assert_eq!(slots.len(), CACHE_CAPACITY);
        assert_ne!(slots[0].key, first_key);
        assert!(slots[0].key.contains("overflow"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error() {
        let cache = PublisherCache::new();

        assert!(cache
            .resolve(&PushChannel::Unknown(String::from("pigeon")))
            .await
            .is_err());
    }
}
