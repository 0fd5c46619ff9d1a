//! MQTT publisher. The broker connection is established on the
//! first publish and re-established implicitly by the event loop
//! when it drops. Topic layout: `<topicPrefix>/<device>/<property>`.

use super::DataModel;
use mapper_api::{types::device::MqttPushConfig, Error, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

// The connack wait: 50 polls of 100 ms before a publish gives up.

const CONNECT_POLLS: u32 = 50;
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Conn {
    client: AsyncClient,
    _event_task: JoinHandle<()>,
}

pub struct MqttPublisher {
    cfg: MqttPushConfig,
    conn: Mutex<Option<Conn>>,
    connected: Arc<AtomicBool>,
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

impl MqttPublisher {
    pub fn new(cfg: &MqttPushConfig) -> MqttPublisher {
        info!(
            "mqtt publisher created -- broker: {}:{}",
            &cfg.broker_url, cfg.port
        );
        MqttPublisher {
            cfg: cfg.clone(),
            conn: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    // Builds the client and spawns the event-loop task that tracks
    // connection state. The event loop owns reconnection; this only
    // runs once per publisher.

    fn open(&self) -> Conn {
        let mut opts = MqttOptions::new(
            self.cfg.client_id.clone(),
            self.cfg.broker_url.clone(),
            self.cfg.port,
        );

        opts.set_keep_alive(Duration::from_secs(self.cfg.keep_alive));
        if let (Some(user), Some(pass)) =
            (&self.cfg.username, &self.cfg.password)
        {
            opts.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(opts, 10);
        let connected = Arc::clone(&self.connected);
        let event_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("mqtt connected");
                        connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => (),
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        debug!("mqtt event loop error -- {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Conn {
            client,
            _event_task: event_task,
        }
    }

    async fn ensure_connected(&self) -> Result<AsyncClient> {
        let mut conn = self.conn.lock().await;

        if conn.is_none() {
            *conn = Some(self.open());
        }

        let client = conn.as_ref().unwrap().client.clone();

        drop(conn);

        for _ in 0..CONNECT_POLLS {
            if self.connected.load(Ordering::SeqCst) {
                return Ok(client);
            }
            sleep(CONNECT_POLL_INTERVAL).await;
        }

        Err(Error::TimeoutError)
    }

    pub async fn publish(&self, data: &DataModel) -> Result<()> {
        let client = self.ensure_connected().await?;
        let topic = format!(
            "{}/{}/{}",
            &self.cfg.topic_prefix, &data.device_name, &data.property_name
        );
        let payload = serde_json::to_vec(data)
            .map_err(|e| Error::ParseError(format!("{}", e)))?;

        client
            .publish(topic.as_str(), to_qos(self.cfg.qos), false, payload)
            .await
            .map_err(|e| Error::SinkError(format!("{}", e)))?;

        debug!("mqtt published -- topic: {}", &topic);
        Ok(())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Ok(conn) = self.conn.try_lock() {
            if let Some(conn) = conn.as_ref() {
                conn._event_task.abort();
            }
        }
    }
}
