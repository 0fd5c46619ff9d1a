//! The mapper's side of the control-plane conversation: the one-shot
//! `MapperRegister` call and the best-effort reporting paths.

use super::v1beta1::{
    device_manager_service_client::DeviceManagerServiceClient, MapperInfo,
    MapperRegisterRequest,
};
use crate::config::Config;
use crate::data::{publish::Publisher, DataModel};
use crate::parse;
use chrono::Utc;
use mapper_api::{
    types::device::{DeviceInstance, DeviceModel, PushChannel, STATUS_OK},
    Error, Result,
};
use std::{env, sync::Arc, time::Duration};
use tokio::net::UnixStream;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

const REGISTER_DEADLINE: Duration = Duration::from_secs(5);

fn uds_target(path: &str) -> String {
    if path.starts_with("unix://") {
        path.to_string()
    } else {
        format!("unix://{}", path)
    }
}

/// Registers the mapper with the control plane over its UNIX socket
/// and returns the assigned device and model lists. A failure here
/// is fatal for startup.
pub async fn register_mapper(
    cfg: &Config,
    with_data: bool,
) -> Result<(Vec<DeviceInstance>, Vec<DeviceModel>)> {
    let sock = cfg.edgecore_sock();

    info!("registering mapper -- socket: {}", uds_target(&sock));

    // The URL only satisfies the endpoint builder; the connector
    // below dials the socket directly.

    let channel = Endpoint::try_from("http://[::]:50051")
        .map_err(|e| Error::ConfigError(format!("{}", e)))?
        .connect_timeout(REGISTER_DEADLINE)
        .timeout(REGISTER_DEADLINE)
        .connect_with_connector(service_fn(move |_: Uri| {
            UnixStream::connect(sock.clone())
        }))
        .await
        .map_err(|e| {
            Error::MissingPeer(format!("control plane unreachable: {}", e))
        })?;

    let mut client = DeviceManagerServiceClient::new(channel);
    let mapper = MapperInfo {
        name: cfg.common.name.clone(),
        version: cfg.common.version.clone(),
        api_version: cfg.common.api_version.clone(),
        protocol: cfg.common.protocol.clone(),
        address: cfg.grpc_server.socket_path.clone(),
        state: STATUS_OK.to_string(),
    };
    let request = MapperRegisterRequest {
        with_data,
        mapper: Some(mapper),
    };

    let response = client
        .mapper_register(request)
        .await
        .map_err(|e| {
            Error::ProtocolError(format!(
                "MapperRegister failed: code={} msg={}",
                e.code(),
                e.message()
            ))
        })?
        .into_inner();

    let models: Vec<DeviceModel> = response
        .model_list
        .iter()
        .map(parse::model_from_proto)
        .collect();
    let mut devices = vec![];

    for dev in &response.device_list {
        match parse::device_from_proto(dev, None) {
            Ok(instance) => devices.push(instance),
            Err(e) => warn!("skipping device '{}' -- {}", &dev.name, &e),
        }
    }

    info!(
        "mapper registered (devices: {}, models: {})",
        devices.len(),
        models.len()
    );
    Ok((devices, models))
}

/// Surfaces device state and twin values back to the control plane
/// through the process-level publish channel, when one is
/// configured. Reports are best effort: failures are logged and
/// never reach the reconciliation loop.
#[derive(Clone)]
pub struct Reporter {
    publisher: Option<Arc<Publisher>>,
}

impl Reporter {
    /// Builds the reporter from the `PUBLISH_METHOD` and
    /// `PUBLISH_CONFIG` environment variables. Without both set, the
    /// reporter is a no-op.
    pub fn from_env() -> Reporter {
        let method = env::var("PUBLISH_METHOD").unwrap_or_default();
        let config = env::var("PUBLISH_CONFIG").unwrap_or_default();

        if method.is_empty() || config.is_empty() {
            info!(
                "publish channel disabled \
                 (set PUBLISH_METHOD and PUBLISH_CONFIG to enable)"
            );
            return Reporter { publisher: None };
        }

        let channel = PushChannel::from_parts(&method, &config);

        match Publisher::new(&channel) {
            Ok(publisher) => {
                info!("publish channel ready: {}", &method);
                Reporter {
                    publisher: Some(Arc::new(publisher)),
                }
            }
            Err(e) => {
                warn!("failed to init publish channel {} -- {}", &method, &e);
                Reporter { publisher: None }
            }
        }
    }

    /// A reporter that drops everything. Used when no channel is
    /// configured, and by tests.
    pub fn disabled() -> Reporter {
        Reporter { publisher: None }
    }

    async fn publish(&self, data: DataModel) {
        let publisher = match &self.publisher {
            Some(p) => p,
            None => return,
        };

        if let Err(e) = publisher.publish(&data).await {
            warn!(
                "report failed -- device: {}, property: {}, {}",
                &data.device_name, &data.property_name, &e
            );
        } else {
            debug!(
                "reported {}/{} {}={}",
                &data.namespace,
                &data.device_name,
                &data.property_name,
                &data.value
            );
        }
    }

    /// Reports a device's normalized status under the synthetic
    /// `status` property.
    pub async fn report_device_states(&self, ns: &str, name: &str, state: &str) {
        self.publish(DataModel::new(
            ns,
            name,
            "status",
            state,
            Utc::now().timestamp_millis(),
        ))
        .await
    }

    /// Reports one twin key/value pair.
    pub async fn report_twin_kv(
        &self,
        ns: &str,
        name: &str,
        property_name: &str,
        value: &str,
        value_type: &str,
    ) {
        let mut dm = DataModel::new(
            ns,
            name,
            property_name,
            value,
            Utc::now().timestamp_millis(),
        );

        dm.value_type = value_type.to_string();
        self.publish(dm).await
    }
}
