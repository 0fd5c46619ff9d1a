//! The UDS gRPC service the control plane drives: CRUD on devices
//! and models, wired onto the device panel.

use super::v1beta1::{
    self,
    device_mapper_service_server::{
        DeviceMapperService, DeviceMapperServiceServer,
    },
};
use crate::parse;
use crate::registry::DevicePanel;
use mapper_api::types::device::{canonical_id, DeviceModel};
use mapper_api::{Error, Result};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{info, warn};

type GrpcResult<T> = std::result::Result<Response<T>, Status>;

pub struct MapperService {
    panel: Arc<DevicePanel>,
}

impl MapperService {
    pub fn new(panel: Arc<DevicePanel>) -> MapperService {
        MapperService { panel }
    }

    // Resolves the model an incoming device references, falling back
    // to a minimal one so a device can arrive before its model.

    fn model_for(&self, device: &v1beta1::Device) -> DeviceModel {
        let model_ref = device
            .spec
            .as_ref()
            .map(|s| s.device_model_reference.clone())
            .unwrap_or_default();

        self.panel
            .get_model(&device.namespace, &model_ref)
            .unwrap_or_else(|| {
                warn!(
                    "model {} not found for device {}, using a bare one",
                    &model_ref, &device.name
                );
                DeviceModel {
                    name: model_ref,
                    namespace: device.namespace.clone(),
                    ..DeviceModel::default()
                }
            })
    }

    async fn upsert_device(&self, device: &v1beta1::Device) -> Result<()> {
        let model = self.model_for(device);
        let instance = parse::device_from_proto(device, Some(&model))?;

        self.panel.update_device(model, instance).await
    }
}

#[tonic::async_trait]
impl DeviceMapperService for MapperService {
    async fn register_device(
        &self,
        request: Request<v1beta1::RegisterDeviceRequest>,
    ) -> GrpcResult<v1beta1::RegisterDeviceResponse> {
        let device = request
            .into_inner()
            .device
            .ok_or_else(|| Status::invalid_argument("empty request"))?;

        info!("RegisterDevice: ns={} name={}", &device.namespace, &device.name);

        // Re-registering an existing identity is fine; it replaces
        // the runtime the same way an update does.

        self.upsert_device(&device)
            .await
            .map_err(|e| Status::internal(format!("register failed: {}", e)))?;

        Ok(Response::new(v1beta1::RegisterDeviceResponse {
            device_name: device.name,
            device_namespace: device.namespace,
        }))
    }

    async fn remove_device(
        &self,
        request: Request<v1beta1::RemoveDeviceRequest>,
    ) -> GrpcResult<v1beta1::RemoveDeviceResponse> {
        let req = request.into_inner();

        if req.device_name.is_empty() {
            return Err(Status::invalid_argument("empty name"));
        }

        let rc = self
            .panel
            .remove_device(&req.device_namespace, &req.device_name)
            .await;

        info!(
            "RemoveDevice: ns={} name={} ok={}",
            &req.device_namespace,
            &req.device_name,
            rc.is_ok()
        );
        Ok(Response::new(v1beta1::RemoveDeviceResponse {}))
    }

    async fn update_device(
        &self,
        request: Request<v1beta1::UpdateDeviceRequest>,
    ) -> GrpcResult<v1beta1::UpdateDeviceResponse> {
        let device = request
            .into_inner()
            .device
            .ok_or_else(|| Status::invalid_argument("empty request"))?;

        info!("UpdateDevice: ns={} name={}", &device.namespace, &device.name);
        self.upsert_device(&device)
            .await
            .map_err(|e| Status::internal(format!("update failed: {}", e)))?;
        Ok(Response::new(v1beta1::UpdateDeviceResponse {}))
    }

    async fn create_device_model(
        &self,
        request: Request<v1beta1::CreateDeviceModelRequest>,
    ) -> GrpcResult<v1beta1::CreateDeviceModelResponse> {
        let model = request
            .into_inner()
            .model
            .ok_or_else(|| Status::invalid_argument("empty model"))?;

        info!(
            "CreateDeviceModel: ns={} name={}",
            &model.namespace, &model.name
        );

        let parsed = parse::model_from_proto(&model);

        self.panel.update_model(parsed);
        Ok(Response::new(v1beta1::CreateDeviceModelResponse {
            device_model_name: model.name,
            device_model_namespace: model.namespace,
        }))
    }

    async fn update_device_model(
        &self,
        request: Request<v1beta1::UpdateDeviceModelRequest>,
    ) -> GrpcResult<v1beta1::UpdateDeviceModelResponse> {
        let model = request
            .into_inner()
            .model
            .ok_or_else(|| Status::invalid_argument("empty model"))?;

        info!(
            "UpdateDeviceModel: ns={} name={}",
            &model.namespace, &model.name
        );

        if !self.panel.has_model(&model.namespace, &model.name) {
            return Err(Status::not_found("model not found"));
        }

        self.panel.update_model(parse::model_from_proto(&model));
        Ok(Response::new(v1beta1::UpdateDeviceModelResponse {}))
    }

    async fn remove_device_model(
        &self,
        request: Request<v1beta1::RemoveDeviceModelRequest>,
    ) -> GrpcResult<v1beta1::RemoveDeviceModelResponse> {
        let req = request.into_inner();

        if req.model_name.is_empty() {
            return Err(Status::invalid_argument("empty name"));
        }

        let id = canonical_id(&req.model_namespace, &req.model_name);

        info!("RemoveDeviceModel: id={}", &id);
        match self.panel.remove_model(&id) {
            Ok(()) => {
                Ok(Response::new(v1beta1::RemoveDeviceModelResponse {}))
            }
            Err(_) => Err(Status::not_found("model not found")),
        }
    }

    async fn get_device(
        &self,
        request: Request<v1beta1::GetDeviceRequest>,
    ) -> GrpcResult<v1beta1::GetDeviceResponse> {
        let req = request.into_inner();
        let id = canonical_id(&req.device_namespace, &req.device_name);
        let dev = self
            .panel
            .get_device(&id)
            .ok_or_else(|| Status::not_found("device not found"))?;

        let instance = dev.instance_snapshot().await;
        let status = dev.status().await;

        Ok(Response::new(v1beta1::GetDeviceResponse {
            device: Some(parse::device_to_proto(&instance, &status)),
        }))
    }
}

/// Serves the device-management RPCs on `socket_path` until
/// `shutdown` resolves. Any stale socket file is removed first, and
/// the fresh one is opened up to `0666` so the control plane's
/// user can reach it.
pub async fn serve(
    panel: Arc<DevicePanel>,
    socket_path: String,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let _ = tokio::fs::remove_file(&socket_path).await;

    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| Error::OperationError(format!("bind {}: {}", &socket_path, e)))?;

    let perms = std::fs::Permissions::from_mode(0o666);

    std::fs::set_permissions(&socket_path, perms)
        .map_err(|e| Error::OperationError(format!("{}", e)))?;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(
            super::v1beta1::FILE_DESCRIPTOR_SET,
        )
        .build()
        .map_err(|e| Error::OperationError(format!("reflection: {}", e)))?;

    info!("gRPC server listening on {}", &socket_path);

    Server::builder()
        .add_service(reflection)
        .add_service(DeviceMapperServiceServer::new(MapperService::new(
            panel,
        )))
        .serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            async {
                let _ = shutdown.await;
            },
        )
        .await
        .map_err(|e| Error::OperationError(format!("grpc server: {}", e)))
}
