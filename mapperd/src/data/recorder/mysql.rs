//! MySQL recorder. One row per sample in a per-property table named
//! `<ns>_<device>_<property>`, created on first use. Connections are
//! pooled and shared through a refcounted cache keyed by
//! `addr:port/db@user`, so two properties pointing at the same server
//! reuse one pool.

use super::super::{sanitize_id, DataModel};
use chrono::{Local, TimeZone};
use mapper_api::{types::device::MySqlClientConfig, Error, Result};
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode},
    Connection,
};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn cache_key(cfg: &MySqlClientConfig) -> String {
    format!(
        "{}:{}/{}@{}",
        &cfg.addr, cfg.port, &cfg.database, &cfg.user_name
    )
}

// The password can be left out of the wire config; `PASSWORD` wins
// over `MYSQL_PASSWORD`.

fn resolve_password(cfg: &MySqlClientConfig) -> Option<String> {
    if let Some(pw) = &cfg.password {
        if !pw.is_empty() {
            return Some(pw.clone());
        }
    }
    [env::var("PASSWORD"), env::var("MYSQL_PASSWORD")]
        .into_iter()
        .flatten()
        .find(|v| !v.is_empty())
}

fn resolve_ssl_mode() -> MySqlSslMode {
    match env::var("MYSQL_SSL_MODE")
        .unwrap_or_default()
        .to_ascii_uppercase()
        .as_str()
    {
        "PREFERRED" => MySqlSslMode::Preferred,
        "REQUIRED" => MySqlSslMode::Required,
        _ => MySqlSslMode::Disabled,
    }
}

struct CacheEntry {
    key: String,
    pool: MySqlPool,
    refcount: usize,
}

/// Refcounted pool cache. Releasing the last reference to a key
/// closes the pool.
pub struct PoolCache {
    entries: Mutex<Vec<CacheEntry>>,
}

impl PoolCache {
    fn new() -> PoolCache {
        PoolCache {
            entries: Mutex::new(vec![]),
        }
    }

    async fn acquire(&self, cfg: &MySqlClientConfig) -> Result<MySqlPool> {
        let key = cache_key(cfg);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.iter_mut().find(|e| e.key == key) {
            entry.refcount += 1;
            return Ok(entry.pool.clone());
        }

        let opts = MySqlConnectOptions::new()
            .host(&cfg.addr)
            .port(cfg.port)
            .username(&cfg.user_name)
            .database(&cfg.database)
            .ssl_mode(resolve_ssl_mode());
        let opts = match resolve_password(cfg) {
            Some(pw) => opts.password(&pw),
            None => opts,
        };

        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(opts)
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        info!("connected to mysql -- {}", &key);
        entries.push(CacheEntry {
            key,
            pool: pool.clone(),
            refcount: 1,
        });
        Ok(pool)
    }

    async fn release(&self, key: &str) {
        let mut entries = self.entries.lock().await;

        if let Some(idx) = entries.iter().position(|e| e.key == key) {
            entries[idx].refcount -= 1;
            if entries[idx].refcount == 0 {
                let entry = entries.remove(idx);

                entry.pool.close().await;
            }
        }
    }
}

struct Handle {
    key: String,
    pool: MySqlPool,
}

/// Recorder for the MySQL backend. All operations serialize behind
/// the recorder's lock; the remote write happens inside the critical
/// section so at most one insert is outstanding at a time.
pub struct MySqlRecorder {
    handle: Mutex<Option<Handle>>,
    cache: Arc<PoolCache>,
}

impl MySqlRecorder {
    pub fn new() -> MySqlRecorder {
        MySqlRecorder {
            handle: Mutex::new(None),
            cache: Arc::new(PoolCache::new()),
        }
    }

    /// Replaces any existing handle with one for `cfg`, closing the
    /// old connection if it was the last user.
    pub async fn set_db(&self, cfg: &MySqlClientConfig) -> Result<()> {
        let mut handle = self.handle.lock().await;

        if let Some(old) = handle.take() {
            self.cache.release(&old.key).await;
        }

        let pool = self.cache.acquire(cfg).await?;

        *handle = Some(Handle {
            key: cache_key(cfg),
            pool,
        });
        Ok(())
    }

    /// Records one sample. When no handle exists yet, connection
    /// setup is attempted once from `cfg`; on failure the handle
    /// stays absent and the next call retries.
    pub async fn record(
        &self,
        cfg: &MySqlClientConfig,
        data: &DataModel,
    ) -> Result<()> {
        let mut handle = self.handle.lock().await;

        if handle.is_none() {
            match self.cache.acquire(cfg).await {
                Ok(pool) => {
                    *handle = Some(Handle {
                        key: cache_key(cfg),
                        pool,
                    })
                }
                Err(e) => {
                    warn!("mysql recorder not available -- {}", &e);
                    return Err(e);
                }
            }
        }

        let pool = &handle.as_ref().unwrap().pool;

        // Probe the connection so a dead server surfaces as one
        // failed sample instead of a hung insert.

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        conn.ping()
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        let table = format!(
            "{}_{}_{}",
            sanitize_id(&data.namespace, "default"),
            sanitize_id(&data.device_name, "device"),
            sanitize_id(&data.property_name, "property")
        );

        let create = format!(
            "CREATE TABLE IF NOT EXISTS `{}` (\
               id INT AUTO_INCREMENT PRIMARY KEY,\
               ts DATETIME NOT NULL,\
               field TEXT\
             )",
            &table
        );

        sqlx::query(&create)
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::SinkError(format!("create table: {}", e)))?;

        let ts = Local
            .timestamp_opt(data.timestamp / 1000, 0)
            .single()
            .unwrap_or_else(Local::now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let insert =
            format!("INSERT INTO `{}` (ts, field) VALUES (?, ?)", &table);

        sqlx::query(&insert)
            .bind(&ts)
            .bind(&data.value)
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::SinkError(format!("insert: {}", e)))?;

        debug!("mysql record ok -- table: {}, value: {}", &table, &data.value);
        Ok(())
    }

    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;

        if let Some(old) = handle.take() {
            debug!("closing mysql handle -- {}", &old.key);
            self.cache.release(&old.key).await;
        }
    }
}

impl Default for MySqlRecorder {
    fn default() -> Self {
        MySqlRecorder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        let cfg = MySqlClientConfig {
            addr: String::from("db.local"),
            port: 3307,
            database: String::from("telemetry"),
            user_name: String::from("edge"),
            password: None,
        };

        assert_eq!(cache_key(&cfg), "db.local:3307/telemetry@edge");
    }

    #[tokio::test]
    async fn test_record_fails_cleanly_when_unreachable() {
        let rec = MySqlRecorder::new();
        let cfg = MySqlClientConfig {
            addr: String::from("127.0.0.1"),
            port: 1,
            ..MySqlClientConfig::default()
        };
        let dm = DataModel::new("ns", "dev", "prop", "1", 0);

        assert!(rec.record(&cfg, &dm).await.is_err());

        // The handle must not be latched by the failure.

        assert!(rec.handle.lock().await.is_none());
    }
}
