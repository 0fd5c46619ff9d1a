//! Redis recorder. Samples land in a sorted set per device, scored
//! by the sample time in seconds, with a human-readable member
//! string. The single cached connection is re-established lazily
//! after a failure.

use super::super::{sanitize_id, DataModel};
use mapper_api::{types::device::RedisClientConfig, Error, Result};
use redis::{aio::MultiplexedConnection, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::env;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// Translates a redis error into a mapper error.

fn xlat_err(err: redis::RedisError) -> Error {
    Error::SinkError(format!(
        "{}: {}",
        err.category(),
        err.detail().unwrap_or("no further information")
    ))
}

fn split_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            (host.to_string(), port.parse().unwrap_or(6379))
        }
        None => (addr.to_string(), 6379),
    }
}

struct Handle {
    conn: MultiplexedConnection,
}

/// Recorder for the Redis backend. Operations serialize behind the
/// recorder's lock, including the remote write.
pub struct RedisRecorder {
    handle: Mutex<Option<Handle>>,
}

impl RedisRecorder {
    pub fn new() -> RedisRecorder {
        RedisRecorder {
            handle: Mutex::new(None),
        }
    }

    // Creates a connection: optional AUTH from the PASSWORD
    // environment variable, optional SELECT of a non-zero database,
    // and a PING to prove the server is really there.

    async fn connect(cfg: &RedisClientConfig) -> Result<Handle> {
        let (host, port) = split_addr(&cfg.addr);
        let password =
            env::var("PASSWORD").ok().filter(|pw| !pw.is_empty());
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.clone(), port),
            redis: RedisConnectionInfo {
                db: cfg.db,
                username: None,
                password,
                ..RedisConnectionInfo::default()
            },
        };

        debug!("connecting to redis -- addr: {}:{}, db#: {}", &host, port, cfg.db);

        let client = redis::Client::open(info).map_err(xlat_err)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(xlat_err)?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(xlat_err)?;

        if pong != "PONG" {
            return Err(Error::SinkError(String::from(
                "unexpected PING reply",
            )));
        }

        info!("connected to redis -- {}:{}", &host, port);
        Ok(Handle { conn })
    }

    /// Replaces any existing connection with one for `cfg`.
    pub async fn set_db(&self, cfg: &RedisClientConfig) -> Result<()> {
        let mut handle = self.handle.lock().await;

        *handle = Some(RedisRecorder::connect(cfg).await?);
        Ok(())
    }

    /// Records one sample. Connects lazily when no handle exists; a
    /// failed operation drops the handle so the next call
    /// reconnects.
    pub async fn record(
        &self,
        cfg: &RedisClientConfig,
        data: &DataModel,
    ) -> Result<()> {
        let mut handle = self.handle.lock().await;

        if handle.is_none() {
            match RedisRecorder::connect(cfg).await {
                Ok(h) => *handle = Some(h),
                Err(e) => {
                    warn!("redis recorder not available -- {}", &e);
                    return Err(e);
                }
            }
        }

        let conn = &mut handle.as_mut().unwrap().conn;
        let ts_secs = data.timestamp / 1000;
        let device = sanitize_id(&data.device_name, "device");
        let member = format!(
            "TimeStamp: {} PropertyName: {} data: {}",
            ts_secs,
            sanitize_id(&data.property_name, "property"),
            &data.value
        );

        let result: std::result::Result<i64, redis::RedisError> =
            redis::cmd("ZADD")
                .arg(&device)
                .arg(ts_secs)
                .arg(&member)
                .query_async(conn)
                .await;

        match result {
            Ok(_) => {
                debug!("redis record ok -- key: {}", &device);
                Ok(())
            }
            Err(e) => {
                // Drop the connection; the next record reconnects.

                *handle = None;
                warn!("redis record failed -- key: {}", &device);
                Err(xlat_err(e))
            }
        }
    }

    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;

        *handle = None;
    }
}

impl Default for RedisRecorder {
    fn default() -> Self {
        RedisRecorder::new()
    }
}
