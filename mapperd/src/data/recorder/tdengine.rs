//! TDengine recorder, speaking the server's REST interface
//! (`/rest/sql`). Each device gets a super table named
//! `<ns>/<device>` with `-` replaced by `_`; samples insert into a
//! per-property child table via `INSERT … USING … TAGS`.

use super::super::DataModel;
use chrono::{Local, TimeZone};
use mapper_api::{types::device::TdEngineClientConfig, Error, Result};
use std::{collections::HashSet, env, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// Connection parameters with every fallback applied.

#[derive(Clone, Debug)]
struct Resolved {
    addr: String,
    db_name: String,
    username: String,
    password: String,
}

fn env_or(name: &str, fallback: &str) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| fallback.to_string())
}

fn resolve(cfg: &TdEngineClientConfig) -> Resolved {
    Resolved {
        addr: cfg
            .addr
            .clone()
            .unwrap_or_else(|| env_or("TDENGINE_ADDR", "localhost:6041")),
        db_name: cfg
            .db_name
            .clone()
            .unwrap_or_else(|| env_or("TDENGINE_DBNAME", "test")),
        username: cfg
            .username
            .clone()
            .unwrap_or_else(|| env_or("TDENGINE_USER", "root")),
        password: cfg
            .password
            .clone()
            .unwrap_or_else(|| env_or("TDENGINE_PASSWORD", "taosdata")),
    }
}

fn legalize(name: &str) -> String {
    name.replace('-', "_")
}

struct Handle {
    params: Resolved,
    client: reqwest::Client,

    // Super tables already created in this process.
    stables: HashSet<String>,
}

impl Handle {
    // Statements normally run in the configured database; `CREATE
    // DATABASE` itself must go to the bare endpoint.

    async fn exec_raw(&self, sql: &str, in_db: bool) -> Result<()> {
        let url = if in_db {
            format!(
                "http://{}/rest/sql/{}",
                &self.params.addr, &self.params.db_name
            )
        } else {
            format!("http://{}/rest/sql", &self.params.addr)
        };
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.params.username, Some(&self.params.password))
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::SinkError(format!(
                "statement rejected with status {}",
                resp.status()
            )));
        }

        // The REST endpoint reports SQL errors in the body with a
        // non-zero code.

        if let Ok(body) = resp.json::<serde_json::Value>().await {
            if let Some(code) = body.get("code").and_then(|c| c.as_i64()) {
                if code != 0 {
                    let desc = body
                        .get("desc")
                        .and_then(|d| d.as_str())
                        .unwrap_or("unknown");

                    return Err(Error::SinkError(format!(
                        "statement failed: {}",
                        desc
                    )));
                }
            }
        }
        Ok(())
    }

    async fn exec(&self, sql: &str) -> Result<()> {
        self.exec_raw(sql, true).await
    }
}

/// Recorder for the TDengine backend. Operations serialize behind
/// the recorder's lock, including the HTTP write.
pub struct TdEngineRecorder {
    handle: Mutex<Option<Handle>>,
}

impl TdEngineRecorder {
    pub fn new() -> TdEngineRecorder {
        TdEngineRecorder {
            handle: Mutex::new(None),
        }
    }

    async fn connect(cfg: &TdEngineClientConfig) -> Result<Handle> {
        // The server mangles non-UTF-8 values without this.

        env::set_var("LANG", "C.UTF-8");
        env::set_var("LC_ALL", "C.UTF-8");

        let params = resolve(cfg);
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .map_err(|e| Error::SinkError(format!("{}", e)))?;
        let handle = Handle {
            params,
            client,
            stables: HashSet::new(),
        };

        handle
            .exec_raw(
                &format!(
                    "CREATE DATABASE IF NOT EXISTS {}",
                    &handle.params.db_name
                ),
                false,
            )
            .await?;

        info!(
            "connected to tdengine -- addr: {}, db: {}",
            &handle.params.addr, &handle.params.db_name
        );
        Ok(handle)
    }

    /// Replaces any existing handle with one for `cfg`.
    pub async fn set_db(&self, cfg: &TdEngineClientConfig) -> Result<()> {
        let mut handle = self.handle.lock().await;

        *handle = Some(TdEngineRecorder::connect(cfg).await?);
        Ok(())
    }

    /// Records one sample, connecting lazily from `cfg` on first
    /// use. The device's super table is created on its first write.
    pub async fn record(
        &self,
        cfg: &TdEngineClientConfig,
        data: &DataModel,
    ) -> Result<()> {
        let mut handle = self.handle.lock().await;

        if handle.is_none() {
            match TdEngineRecorder::connect(cfg).await {
                Ok(h) => *handle = Some(h),
                Err(e) => {
                    warn!("tdengine recorder not available -- {}", &e);
                    return Err(e);
                }
            }
        }

        let h = handle.as_mut().unwrap();
        let table = format!("{}/{}", &data.namespace, &data.device_name);
        let stable = legalize(&table);
        let tag = legalize(&data.property_name);

        if !h.stables.contains(&stable) {
            h.exec(&format!(
                "CREATE STABLE IF NOT EXISTS {} (\
                   ts timestamp, deviceid binary(64), \
                   propertyname binary(64), data binary(64), \
                   type binary(64)\
                 ) TAGS (location binary(64))",
                &stable
            ))
            .await?;
            h.stables.insert(stable.clone());
        }

        let ts = Local
            .timestamp_opt(data.timestamp / 1000, 0)
            .single()
            .unwrap_or_else(Local::now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let insert = format!(
            "INSERT INTO {} USING {} TAGS ('{}') \
             VALUES('{}','{}', '{}', '{}', '{}')",
            &tag, &stable, &tag, &ts, &table, &data.property_name,
            &data.value, &data.value_type
        );

        h.exec(&insert).await?;
        debug!("tdengine record ok -- stable: {}, tag: {}", &stable, &tag);
        Ok(())
    }

    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;

        *handle = None;
    }
}

impl Default for TdEngineRecorder {
    fn default() -> Self {
        TdEngineRecorder::new()
    }
}
