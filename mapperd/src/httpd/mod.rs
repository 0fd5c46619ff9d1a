//! The admin/inspection HTTP server: a small GET-only surface over
//! the device panel, bound on every interface at the configured
//! port. Responses travel in a fixed JSON envelope.

use crate::parse::resource_id;
use crate::registry::DevicePanel;
use chrono::Local;
use hyper::service::{make_service_fn, service_fn};
use hyper::{server::Server, Body, Method, Response, StatusCode};
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use tracing::info;

const API_VERSION: &str = "v1";

fn time_str() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn envelope(status: u16, message: Option<String>, data: Option<Value>) -> Value {
    let mut resp = json!({
        "apiVersion": API_VERSION,
        "statusCode": status,
        "timeStamp": time_str(),
    });

    if let Some(message) = message {
        resp["message"] = Value::String(message);
    }
    if let Some(data) = data {
        resp["data"] = data;
    }
    resp
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

fn ok(data: Option<Value>, message: Option<String>) -> Response<Body> {
    json_response(StatusCode::OK, envelope(200, message, data))
}

fn server_error(message: String) -> Response<Body> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        envelope(500, Some(message), None),
    )
}

fn not_found() -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        envelope(404, Some(String::from("no such endpoint")), None),
    )
}

async fn handle_ping() -> Response<Body> {
    ok(
        None,
        Some(String::from(
            "This is v1 API, the server is running normally.",
        )),
    )
}

async fn handle_device_read(
    panel: &DevicePanel,
    ns: &str,
    name: &str,
    property: &str,
) -> Response<Body> {
    match panel.read_twin(&resource_id(ns, name), property).await {
        Ok((value, value_type)) => ok(
            Some(json!({
                "deviceName": name,
                "propertyName": property,
                "deviceNamespace": ns,
                "value": value,
                "type": value_type,
            })),
            None,
        ),
        Err(e) => server_error(format!("Get device data error: {}", e)),
    }
}

async fn handle_device_write(
    panel: &DevicePanel,
    ns: &str,
    name: &str,
    _method: &str,
    property: &str,
    data: &str,
) -> Response<Body> {
    let device_id = resource_id(ns, name);

    match panel.write_device(&device_id, property, data).await {
        Ok(()) => ok(
            None,
            Some(format!(
                "Write data {} to device {} successfully.",
                data, &device_id
            )),
        ),
        Err(e) => server_error(format!("Write device data error: {}", e)),
    }
}

async fn handle_device_methods(
    panel: &DevicePanel,
    ns: &str,
    name: &str,
) -> Response<Body> {
    let dev = match panel.get_device(&resource_id(ns, name)) {
        Some(dev) => dev,
        None => {
            return server_error(format!(
                "Get device method error: device {} not found",
                name
            ))
        }
    };
    let instance = dev.instance_snapshot().await;
    let methods: Vec<Value> = instance
        .methods
        .iter()
        .map(|m| {
            json!({
                "name": &m.name,
                "path": format!(
                    "/api/{}/devicemethod/{}/{}/{}/{{propertyName}}/{{data}}",
                    API_VERSION, ns, name, &m.name
                ),
                "parameters": m
                    .property_names
                    .iter()
                    .map(|p| json!({
                        "propertyName": p,
                        "valueType": "string",
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    ok(Some(json!({ "methods": methods })), None)
}

async fn handle_meta_model(
    panel: &DevicePanel,
    ns: &str,
    name: &str,
) -> Response<Body> {
    let dev = match panel.get_device(&resource_id(ns, name)) {
        Some(dev) => dev,
        None => {
            return server_error(format!(
                "Get device error: device {} not found",
                name
            ))
        }
    };
    let model = dev.model();

    ok(
        Some(json!({
            "name": &model.name,
            "namespace": &model.namespace,
            "description": &model.description,
        })),
        None,
    )
}

// The data-query endpoint is reserved; it answers with an empty
// array until recorder read-back lands.

async fn handle_database() -> Response<Body> {
    ok(Some(json!([])), None)
}

pub(crate) async fn route(
    panel: Arc<DevicePanel>,
    method: Method,
    path: &str,
) -> Response<Body> {
    if method != Method::GET {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::empty())
            .unwrap_or_default();
    }

    let rest = match path.strip_prefix("/api/v1/") {
        Some(rest) => rest,
        None => return not_found(),
    };
    let parts: Vec<&str> =
        rest.split('/').filter(|s| !s.is_empty()).collect();

    match parts.as_slice() {
        ["ping"] => handle_ping().await,
        ["device", ns, name, prop] => {
            handle_device_read(&panel, ns, name, prop).await
        }
        ["devicemethod", ns, name] => {
            handle_device_methods(&panel, ns, name).await
        }
        ["devicemethod", ns, name, method, prop, data] => {
            handle_device_write(&panel, ns, name, method, prop, data).await
        }
        ["meta", "model", ns, name] => {
            handle_meta_model(&panel, ns, name).await
        }
        ["database", _ns, _name] => handle_database().await,
        _ => not_found(),
    }
}

/// Runs the admin server until the process exits.
pub async fn server(
    panel: Arc<DevicePanel>,
    port: u16,
) -> std::result::Result<(), hyper::Error> {
    let addr = ([0, 0, 0, 0], port).into();

    // A `Service` is needed for every connection, so this creates
    // one from the router.

    let make_svc = make_service_fn(move |_| {
        let panel = Arc::clone(&panel);

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let panel = Arc::clone(&panel);

                async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();

                    Ok::<_, hyper::Error>(route(panel, method, &path).await)
                }
            }))
        }
    });

    info!("admin HTTP server listening on port {}", port);
    Server::bind(&addr).serve(make_svc).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SinkSet;
    use crate::device::tests::{test_device, test_instance, MockClient};
    use crate::grpc::client::Reporter;

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();

        serde_json::from_slice(&bytes).unwrap()
    }

    fn panel_with_device() -> Arc<DevicePanel> {
        let panel =
            DevicePanel::new(Arc::new(SinkSet::new()), Reporter::disabled());
        let client = MockClient::new(&["42"], "ok");

        panel
            .registry
            .add(test_device(test_instance(&["temp"]), client));
        panel
    }

    #[tokio::test]
    async fn test_ping() {
        let panel = panel_with_device();
        let resp = route(panel, Method::GET, "/api/v1/ping").await;

        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;

        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["statusCode"], 200);
        assert!(json["timeStamp"].is_string());
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let panel = panel_with_device();
        let resp = route(panel, Method::POST, "/api/v1/ping").await;

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let panel = panel_with_device();
        let resp = route(panel, Method::GET, "/api/v1/nope").await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_device_read_unknown_device_is_500_envelope() {
        let panel = panel_with_device();
        let resp =
            route(panel, Method::GET, "/api/v1/device/ns1/ghost/temp").await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(resp).await;

        assert_eq!(json["statusCode"], 500);
        assert!(json["message"].is_string());
    }

    #[tokio::test]
    async fn test_device_write_then_read() {
        let panel = panel_with_device();

        let resp = route(
            Arc::clone(&panel),
            Method::GET,
            "/api/v1/devicemethod/ns1/d1/SetProperty/temp/55",
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);

        let resp =
            route(panel, Method::GET, "/api/v1/device/ns1/d1/temp").await;
        let json = body_json(resp).await;

        assert_eq!(json["data"]["value"], "55");
        assert_eq!(json["data"]["deviceName"], "d1");
        assert_eq!(json["data"]["deviceNamespace"], "ns1");
    }

    #[tokio::test]
    async fn test_device_methods_listing() {
        let panel = panel_with_device();
        let resp =
            route(panel, Method::GET, "/api/v1/devicemethod/ns1/d1").await;
        let json = body_json(resp).await;
        let methods = json["data"]["methods"].as_array().unwrap();

        // The synthesized SetProperty method covers every property.

        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0]["name"], "SetProperty");
        assert_eq!(
            methods[0]["parameters"][0]["propertyName"],
            "temp"
        );
    }

    #[tokio::test]
    async fn test_database_endpoint_is_reserved() {
        let panel = panel_with_device();
        let resp =
            route(panel, Method::GET, "/api/v1/database/ns1/d1").await;
        let json = body_json(resp).await;

        assert_eq!(json["data"], json!([]));
    }
}
