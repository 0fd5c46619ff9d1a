//! Converts control-plane protocol messages into the internal device
//! model and back.
//!
//! Opaque configuration travels on the wire as maps of
//! `google.protobuf.Any`; this module is the one place that decodes
//! them, so everything past here works with plain JSON strings and
//! parsed sum types.

use crate::grpc::v1beta1;
use mapper_api::{
    driver::ProtocolConfig,
    types::device::{
        effective_namespace, DbMethod, DeviceInstance, DeviceMethod,
        DeviceModel, DeviceProperty, HttpPushConfig, InfluxDbConfig,
        InstanceStatus, ModelProperty, MqttPushConfig, MySqlClientConfig,
        OtelPushConfig, PushChannel, PushMethod, RedisClientConfig,
        TdEngineClientConfig, Twin, TwinMetadata, TwinValue,
    },
    Error, Result,
};
use prost::Message;
use serde_json::{json, Value};

// Wrapper messages for decoding the well-known types out of an
// `Any`. Only the payload field matters, so each is declared
// locally with its single tag.

#[derive(Clone, PartialEq, Message)]
struct PbString {
    #[prost(string, tag = "1")]
    value: String,
}

#[derive(Clone, PartialEq, Message)]
struct PbInt32 {
    #[prost(int32, tag = "1")]
    value: i32,
}

#[derive(Clone, PartialEq, Message)]
struct PbInt64 {
    #[prost(int64, tag = "1")]
    value: i64,
}

#[derive(Clone, PartialEq, Message)]
struct PbDouble {
    #[prost(double, tag = "1")]
    value: f64,
}

#[derive(Clone, PartialEq, Message)]
struct PbBool {
    #[prost(bool, tag = "1")]
    value: bool,
}

/// Decodes an `Any` into its string rendering. The five scalar
/// wrapper types decode directly; anything else falls through as raw
/// bytes, with a second attempt that reads a `{"value": …}` JSON
/// object.
pub fn any_to_string(any: &prost_types::Any) -> Option<String> {
    if any.value.is_empty() {
        return None;
    }

    let buf = &any.value[..];

    if any.type_url.contains("StringValue") {
        if let Ok(v) = PbString::decode(buf) {
            return Some(v.value);
        }
    }
    if any.type_url.contains("Int32Value") {
        if let Ok(v) = PbInt32::decode(buf) {
            return Some(v.value.to_string());
        }
    }
    if any.type_url.contains("Int64Value") {
        if let Ok(v) = PbInt64::decode(buf) {
            return Some(v.value.to_string());
        }
    }
    if any.type_url.contains("DoubleValue") {
        if let Ok(v) = PbDouble::decode(buf) {
            return Some(v.value.to_string());
        }
    }
    if any.type_url.contains("BoolValue") {
        if let Ok(v) = PbBool::decode(buf) {
            return Some(if v.value { "true" } else { "false" }.to_string());
        }
    }

    let raw = String::from_utf8_lossy(&any.value).to_string();

    if raw.starts_with('{') || raw.starts_with('[') {
        if let Ok(root) = serde_json::from_str::<Value>(&raw) {
            match root.get("value") {
                Some(Value::String(s)) => return Some(s.clone()),
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => (),
            }
        }
    }
    Some(raw)
}

// Flattens a CustomizedValue into a JSON object whose values are the
// string renderings of the entries.

fn customized_value_to_json(cv: &v1beta1::CustomizedValue) -> Value {
    let mut obj = serde_json::Map::new();

    for (key, any) in &cv.data {
        let value = any_to_string(any).unwrap_or_default();

        obj.insert(key.clone(), Value::String(value));
    }
    Value::Object(obj)
}

fn protocol_name(device: &v1beta1::Device) -> Result<String> {
    device
        .spec
        .as_ref()
        .and_then(|s| s.protocol.as_ref())
        .map(|p| p.protocol_name.clone())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            Error::ParseError(format!(
                "device '{}' carries no protocol name",
                &device.name
            ))
        })
}

/// Builds the driver-facing protocol config:
/// `{"protocolName": …, "configData": {…}}`.
pub fn protocol_from_proto(
    device: &v1beta1::Device,
) -> Result<ProtocolConfig> {
    let name = protocol_name(device)?;
    let mut root = json!({ "protocolName": &name });

    if let Some(cv) = device
        .spec
        .as_ref()
        .and_then(|s| s.protocol.as_ref())
        .and_then(|p| p.config_data.as_ref())
    {
        root["configData"] = customized_value_to_json(cv);
    }

    Ok(ProtocolConfig {
        protocol_name: name,
        config_data: root.to_string(),
    })
}

fn split_addr_port(addr: &str) -> (String, Option<u16>) {
    let stripped = match addr.find("://") {
        Some(pos) => &addr[pos + 3..],
        None => addr,
    };

    match stripped.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (stripped.to_string(), None),
        },
        _ => (stripped.to_string(), None),
    }
}

// Lowers a wire push method into the parsed channel + db sum types.

fn push_method_from_proto(pm: &v1beta1::PushMethod) -> PushMethod {
    let channel = if let Some(mqtt) = &pm.mqtt {
        let (host, port) = split_addr_port(&mqtt.address);

        Some(PushChannel::Mqtt(MqttPushConfig {
            broker_url: if host.is_empty() {
                String::from("127.0.0.1")
            } else {
                host
            },
            port: port.unwrap_or(1883),
            topic_prefix: if mqtt.topic.is_empty() {
                MqttPushConfig::default().topic_prefix
            } else {
                mqtt.topic.clone()
            },
            qos: mqtt.qos.clamp(0, 2) as u8,
            ..MqttPushConfig::default()
        }))
    } else if let Some(http) = &pm.http {
        let (host, host_port) = split_addr_port(&http.host_name);
        let host = if host.is_empty() {
            String::from("127.0.0.1")
        } else {
            host
        };
        let port = if http.port > 0 {
            http.port as u16
        } else {
            host_port.unwrap_or(80)
        };
        let path = if http.request_path.is_empty() {
            "/ingest"
        } else {
            &http.request_path
        };
        let mut cfg = HttpPushConfig {
            endpoint: format!("http://{}:{}{}", host, port, path),
            ..HttpPushConfig::default()
        };

        if http.timeout > 0 {
            cfg.timeout_ms = http.timeout as u64;
        }
        Some(PushChannel::Http(cfg))
    } else if let Some(otel) = &pm.otel {
        let mut cfg = OtelPushConfig::default();

        if !otel.endpoint_url.is_empty() {
            cfg.endpoint = otel.endpoint_url.clone();
        }
        Some(PushChannel::Otel(cfg))
    } else {
        None
    };

    let db = pm.db_method.as_ref().and_then(|db| {
        if let Some(cfg) = db.mysql.as_ref().and_then(|m| m.mysql_client_config.as_ref()) {
            Some(DbMethod::MySql(MySqlClientConfig {
                addr: cfg.addr.clone(),
                database: cfg.database.clone(),
                user_name: cfg.user_name.clone(),
                ..MySqlClientConfig::default()
            }))
        } else if let Some(cfg) =
            db.redis.as_ref().and_then(|r| r.redis_client_config.as_ref())
        {
            Some(DbMethod::Redis(RedisClientConfig {
                addr: if cfg.addr.is_empty() {
                    RedisClientConfig::default().addr
                } else {
                    cfg.addr.clone()
                },
                db: cfg.db,
                pool_size: cfg.pool_size.max(0) as u32,
                min_idle_conns: cfg.min_idle_conns.max(0) as u32,
            }))
        } else if let Some(influx) = db.influxdb2.as_ref() {
            influx.influxdb2_client_config.as_ref().map(|cfg| {
                let data = influx.influxdb2_data_config.as_ref();

                DbMethod::Influx(InfluxDbConfig {
                    url: cfg.url.clone(),
                    org: cfg.org.clone(),
                    bucket: cfg.bucket.clone(),
                    measurement: data
                        .map(|d| d.measurement.clone())
                        .filter(|m| !m.is_empty()),
                    field_key: data
                        .map(|d| d.field_key.clone())
                        .filter(|f| !f.is_empty()),
                    tags: data
                        .map(|d| {
                            d.tag
                                .iter()
                                .map(|(k, v)| {
                                    (k.clone(), Value::String(v.clone()))
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                })
            })
        } else {
            db.tdengine
                .as_ref()
                .and_then(|t| t.td_engine_client_config.as_ref())
                .map(|cfg| {
                    DbMethod::TdEngine(TdEngineClientConfig {
                        addr: Some(cfg.addr.clone()).filter(|a| !a.is_empty()),
                        db_name: Some(cfg.db_name.clone())
                            .filter(|d| !d.is_empty()),
                        username: None,
                        password: None,
                    })
                })
        }
    });

    PushMethod { channel, db }
}

fn visitors_json(prop: &v1beta1::DeviceProperty) -> String {
    let mut root = serde_json::Map::new();

    if let Some(vis) = &prop.visitors {
        root.insert(
            String::from("protocolName"),
            Value::String(vis.protocol_name.clone()),
        );
        root.insert(
            String::from("configData"),
            vis.config_data
                .as_ref()
                .map(customized_value_to_json)
                .unwrap_or_else(|| Value::Object(Default::default())),
        );
    }
    Value::Object(root).to_string()
}

fn twin_from_property(prop: &v1beta1::DeviceProperty) -> Twin {
    let mut twin = Twin {
        property_name: prop.name.clone(),
        ..Twin::default()
    };

    if let Some(desired) = &prop.desired {
        twin.observed_desired = TwinValue {
            value: desired.value.clone(),
            metadata: TwinMetadata {
                timestamp: desired
                    .metadata
                    .get("timestamp")
                    .cloned()
                    .unwrap_or_default(),
                value_type: desired
                    .metadata
                    .get("type")
                    .cloned()
                    .unwrap_or_default(),
            },
        };
    }
    twin
}

/// Builds a [`DeviceModel`] from its wire form.
pub fn model_from_proto(model: &v1beta1::DeviceModel) -> DeviceModel {
    DeviceModel {
        id: String::new(),
        name: model.name.clone(),
        namespace: effective_namespace(&model.namespace),
        description: String::new(),
        properties: model
            .spec
            .as_ref()
            .map(|spec| {
                spec.properties
                    .iter()
                    .map(|p| ModelProperty {
                        name: p.name.clone(),
                        data_type: p.data_type.clone(),
                        description: p.description.clone(),
                        access_mode: p.access_mode.clone(),
                        minimum: p.minimum.clone(),
                        maximum: p.maximum.clone(),
                        unit: p.unit.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Builds a [`DeviceInstance`] from its wire form. When `model` is
/// given, property references into it are resolved by name.
pub fn device_from_proto(
    device: &v1beta1::Device,
    model: Option<&DeviceModel>,
) -> Result<DeviceInstance> {
    let proto_name = protocol_name(device)?;
    let protocol = protocol_from_proto(device)?;
    let spec = device.spec.as_ref();
    let model_ref = spec
        .map(|s| s.device_model_reference.clone())
        .unwrap_or_default();

    let mut properties = vec![];
    let mut twins = vec![];

    if let Some(spec) = spec {
        for prop in &spec.properties {
            twins.push(twin_from_property(prop));
            properties.push(DeviceProperty {
                name: prop.name.clone(),
                model_name: model_ref.clone(),
                protocol: proto_name.clone(),
                visitors: visitors_json(prop),
                collect_cycle: prop.collect_cycle,
                report_cycle: prop.report_cycle,
                report_to_cloud: prop.report_to_cloud,
                push_method: prop
                    .push_method
                    .as_ref()
                    .map(push_method_from_proto),
                model_property_idx: None,
            });
        }
    }

    let methods = spec
        .map(|s| {
            s.methods
                .iter()
                .map(|m| DeviceMethod {
                    name: m.name.clone(),
                    description: m.description.clone(),
                    property_names: m.property_names.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut instance = DeviceInstance {
        id: String::new(),
        name: device.name.clone(),
        namespace: device.namespace.clone(),
        model: model_ref,
        protocol_name: format!("{}-{}", &proto_name, &device.name),
        protocol,
        properties,
        twins,
        methods,
        status: device
            .status
            .as_ref()
            .map(|st| InstanceStatus {
                report_to_cloud: st.report_to_cloud,
                report_cycle: st.report_cycle,
            })
            .unwrap_or_default(),
    };

    if let Some(model) = model {
        for prop in &mut instance.properties {
            prop.model_property_idx = model
                .properties
                .iter()
                .position(|mp| mp.name == prop.name);
        }
    }
    instance.resolve_twin_refs();

    Ok(instance)
}

/// Renders an instance back into its wire form, used for
/// `GetDevice` responses. The twins travel in the status block with
/// both sides of each record.
pub fn device_to_proto(
    instance: &DeviceInstance,
    status: &str,
) -> v1beta1::Device {
    let properties = instance
        .properties
        .iter()
        .map(|p| v1beta1::DeviceProperty {
            name: p.name.clone(),
            desired: None,
            visitors: None,
            report_cycle: p.report_cycle,
            collect_cycle: p.collect_cycle,
            report_to_cloud: p.report_to_cloud,
            push_method: None,
        })
        .collect();
    let methods = instance
        .methods
        .iter()
        .map(|m| v1beta1::DeviceMethod {
            name: m.name.clone(),
            description: m.description.clone(),
            property_names: m.property_names.clone(),
        })
        .collect();
    let twins = instance
        .twins
        .iter()
        .map(|t| v1beta1::Twin {
            property_name: t.property_name.clone(),
            observed_desired: Some(v1beta1::TwinProperty {
                value: t.observed_desired.value.clone(),
                metadata: [
                    (
                        String::from("timestamp"),
                        t.observed_desired.metadata.timestamp.clone(),
                    ),
                    (
                        String::from("type"),
                        t.observed_desired.metadata.value_type.clone(),
                    ),
                ]
                .into_iter()
                .collect(),
            }),
            reported: Some(v1beta1::TwinProperty {
                value: t.reported.value.clone(),
                metadata: [
                    (
                        String::from("timestamp"),
                        t.reported.metadata.timestamp.clone(),
                    ),
                    (
                        String::from("type"),
                        t.reported.metadata.value_type.clone(),
                    ),
                ]
                .into_iter()
                .collect(),
            }),
        })
        .collect();

    v1beta1::Device {
        name: instance.name.clone(),
        namespace: instance.namespace.clone(),
        spec: Some(v1beta1::DeviceSpec {
            device_model_reference: instance.model.clone(),
            protocol: Some(v1beta1::ProtocolConfig {
                protocol_name: instance.protocol.protocol_name.clone(),
                config_data: None,
            }),
            properties,
            methods,
        }),
        status: Some(v1beta1::DeviceStatus {
            twins,
            state: status.to_string(),
            report_to_cloud: instance.status.report_to_cloud,
            report_cycle: instance.status.report_cycle,
        }),
    }
}

/// The dotted resource id the admin API uses: `"<ns>.<name>"`.
pub fn resource_id(ns: &str, name: &str) -> String {
    format!("{}.{}", ns, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_of(type_url: &str, value: Vec<u8>) -> prost_types::Any {
        prost_types::Any {
            type_url: type_url.to_string(),
            value,
        }
    }

    #[test]
    fn test_any_wrapper_decoding() {
        let s = PbString {
            value: String::from("502"),
        };

        assert_eq!(
            any_to_string(&any_of(
                "type.googleapis.com/google.protobuf.StringValue",
                s.encode_to_vec()
            )),
            Some(String::from("502"))
        );

        let i = PbInt32 { value: -7 };

        assert_eq!(
            any_to_string(&any_of(
                "type.googleapis.com/google.protobuf.Int32Value",
                i.encode_to_vec()
            )),
            Some(String::from("-7"))
        );

        let b = PbBool { value: true };

        assert_eq!(
            any_to_string(&any_of(
                "type.googleapis.com/google.protobuf.BoolValue",
                b.encode_to_vec()
            )),
            Some(String::from("true"))
        );
    }

    #[test]
    fn test_any_raw_fallback() {
        assert_eq!(
            any_to_string(&any_of("application/x-unknown", b"raw".to_vec())),
            Some(String::from("raw"))
        );

        // A JSON body gets a second chance through its "value" key.

        assert_eq!(
            any_to_string(&any_of("", br#"{"value": "5"}"#.to_vec())),
            Some(String::from("5"))
        );
        assert_eq!(
            any_to_string(&any_of("", br#"{"value": 12}"#.to_vec())),
            Some(String::from("12"))
        );
        assert_eq!(any_to_string(&any_of("", vec![])), None);
    }

    #[test]
    fn test_split_addr_port() {
        assert_eq!(
            split_addr_port("tcp://broker.local:8883"),
            (String::from("broker.local"), Some(8883))
        );
        assert_eq!(
            split_addr_port("broker.local:1883"),
            (String::from("broker.local"), Some(1883))
        );
        assert_eq!(
            split_addr_port("broker.local"),
            (String::from("broker.local"), None)
        );
    }

    fn wire_device() -> v1beta1::Device {
        v1beta1::Device {
            name: String::from("d1"),
            namespace: String::from("ns1"),
            spec: Some(v1beta1::DeviceSpec {
                device_model_reference: String::from("m1"),
                protocol: Some(v1beta1::ProtocolConfig {
                    protocol_name: String::from("modbus-tcp"),
                    config_data: None,
                }),
                properties: vec![v1beta1::DeviceProperty {
                    name: String::from("temp"),
                    desired: Some(v1beta1::TwinProperty {
                        value: String::from("50"),
                        metadata: [(
                            String::from("type"),
                            String::from("int"),
                        )]
                        .into_iter()
                        .collect(),
                    }),
                    visitors: None,
                    report_cycle: 0,
                    collect_cycle: 0,
                    report_to_cloud: true,
                    push_method: Some(v1beta1::PushMethod {
                        http: None,
                        mqtt: Some(v1beta1::PushMethodMqtt {
                            address: String::from("tcp://broker:8883"),
                            topic: String::from("telemetry"),
                            qos: 2,
                            retained: false,
                        }),
                        db_method: Some(v1beta1::DbMethod {
                            mysql: None,
                            redis: Some(v1beta1::DbMethodRedis {
                                redis_client_config: Some(
                                    v1beta1::RedisClientConfig {
                                        addr: String::from("cache:6379"),
                                        db: 2,
                                        pool_size: 5,
                                        min_idle_conns: 1,
                                    },
                                ),
                            }),
                            influxdb2: None,
                            tdengine: None,
                        }),
                        otel: None,
                    }),
                }],
                methods: vec![v1beta1::DeviceMethod {
                    name: String::from("SetProperty"),
                    description: String::new(),
                    property_names: vec![String::from("temp")],
                }],
            }),
            status: None,
        }
    }

    #[test]
    fn test_device_from_proto() {
        let instance = device_from_proto(&wire_device(), None).unwrap();

        assert_eq!(instance.name, "d1");
        assert_eq!(instance.namespace, "ns1");
        assert_eq!(instance.model, "m1");
        assert_eq!(instance.protocol.protocol_name, "modbus-tcp");
        assert_eq!(instance.protocol_name, "modbus-tcp-d1");
        assert_eq!(instance.canonical_id(), "ns1/d1");

        assert_eq!(instance.twins.len(), 1);
        assert_eq!(instance.twins[0].observed_desired.value, "50");
        assert_eq!(
            instance.twins[0].observed_desired.metadata.value_type,
            "int"
        );
        assert_eq!(instance.twins[0].property_idx, Some(0));

        let pm = instance.properties[0].push_method.as_ref().unwrap();

        match pm.channel.as_ref().unwrap() {
            PushChannel::Mqtt(cfg) => {
                assert_eq!(cfg.broker_url, "broker");
                assert_eq!(cfg.port, 8883);
                assert_eq!(cfg.topic_prefix, "telemetry");
                assert_eq!(cfg.qos, 2);
                assert_eq!(cfg.keep_alive, 60);
            }
            other => panic!("expected mqtt channel, got {:?}", other),
        }
        match pm.db.as_ref().unwrap() {
            DbMethod::Redis(cfg) => {
                assert_eq!(cfg.addr, "cache:6379");
                assert_eq!(cfg.db, 2);
            }
            other => panic!("expected redis db method, got {:?}", other),
        }
    }

    #[test]
    fn test_http_push_lowering() {
        let pm = v1beta1::PushMethod {
            http: Some(v1beta1::PushMethodHttp {
                host_name: String::from("sink.local"),
                port: 9090,
                request_path: String::new(),
                timeout: 2000,
            }),
            mqtt: None,
            db_method: None,
            otel: None,
        };
        let parsed = push_method_from_proto(&pm);

        match parsed.channel.unwrap() {
            PushChannel::Http(cfg) => {
                assert_eq!(cfg.endpoint, "http://sink.local:9090/ingest");
                assert_eq!(cfg.method, "POST");
                assert_eq!(cfg.timeout_ms, 2000);
            }
            other => panic!("expected http channel, got {:?}", other),
        }
    }

    // Identity must survive a to-proto/from-proto round trip.

    #[test]
    fn test_round_trip_preserves_identity() {
        let original = device_from_proto(&wire_device(), None).unwrap();
        let wire = device_to_proto(&original, "ok");
        let round = device_from_proto(&wire, None).unwrap();

        assert_eq!(round.name, original.name);
        assert_eq!(round.namespace, original.namespace);
        assert_eq!(round.model, original.model);
        assert_eq!(
            round.protocol.protocol_name,
            original.protocol.protocol_name
        );
        assert_eq!(
            round
                .properties
                .iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>(),
            original
                .properties
                .iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>()
        );
        assert_eq!(
            round
                .methods
                .iter()
                .map(|m| m.name.clone())
                .collect::<Vec<_>>(),
            original
                .methods
                .iter()
                .map(|m| m.name.clone())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_model_namespace_defaulting() {
        let model = model_from_proto(&v1beta1::DeviceModel {
            name: String::from("m1"),
            namespace: String::new(),
            spec: None,
        });

        assert_eq!(model.namespace, "default");
        assert_eq!(model.canonical_id(), "default/m1");
    }

    #[test]
    fn test_resource_id_is_dotted() {
        assert_eq!(resource_id("ns1", "d1"), "ns1.d1");
    }
}
