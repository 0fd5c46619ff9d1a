//! Defines the device data model: models, instances, properties,
//! twins, and the per-property sink configuration.
//!
//! Ownership is by-value throughout. A `DeviceInstance` owns its
//! properties, twins, and methods; a twin refers to its property by
//! index into the owning instance's property list, never by pointer.

use serde_derive::{Deserialize, Serialize};

/// The device is reachable and reporting normally.
pub const STATUS_OK: &str = "ok";
/// Raw driver report; normalizes to [`STATUS_OK`].
pub const STATUS_ONLINE: &str = "online";
/// The device is unreachable or stopped.
pub const STATUS_OFFLINE: &str = "offline";
pub const STATUS_DISCONNECTED: &str = "disconnected";
pub const STATUS_UNHEALTHY: &str = "unhealthy";
pub const STATUS_UNKNOWN: &str = "unknown";

/// Normalizes a raw driver status string. An empty report means the
/// driver couldn't reach the device, so it maps to offline. `OK` and
/// `ONLINE` collapse to `ok`, `OFFLINE` and `DOWN` to `offline`, and
/// any other value passes through unchanged. The function is
/// idempotent.
pub fn normalize_status(raw: &str) -> String {
    if raw.is_empty() {
        return STATUS_OFFLINE.to_string();
    }
    if raw.eq_ignore_ascii_case("OK") || raw.eq_ignore_ascii_case("ONLINE") {
        return STATUS_OK.to_string();
    }
    if raw.eq_ignore_ascii_case("OFFLINE") || raw.eq_ignore_ascii_case("DOWN")
    {
        return STATUS_OFFLINE.to_string();
    }
    raw.to_string()
}

/// Returns the namespace to use for a resource. Empty namespaces, or
/// namespaces with no printable byte, fall back to `"default"`.
pub fn effective_namespace(ns: &str) -> String {
    if ns.bytes().any(|b| (32..127).contains(&b)) {
        ns.to_string()
    } else {
        String::from("default")
    }
}

/// Builds the canonical registry identity for a resource:
/// `"<namespace>/<name>"`.
pub fn canonical_id(ns: &str, name: &str) -> String {
    format!("{}/{}", effective_namespace(ns), name)
}

/// One property of a device model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelProperty {
    pub name: String,
    pub data_type: String,
    pub description: String,
    pub access_mode: String,
    pub minimum: String,
    pub maximum: String,
    pub unit: String,
}

/// A device model: the schema shared by all instances that reference
/// it. Unique within (namespace, name).
#[derive(Clone, Debug, Default)]
pub struct DeviceModel {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub properties: Vec<ModelProperty>,
}

impl DeviceModel {
    pub fn canonical_id(&self) -> String {
        canonical_id(&self.namespace, &self.name)
    }
}

/// Timestamp/type metadata attached to a twin value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TwinMetadata {
    pub timestamp: String,
    pub value_type: String,
}

/// One side of a twin: a value plus its metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TwinValue {
    pub value: String,
    pub metadata: TwinMetadata,
}

/// Per-property reconciliation record. `observed_desired` is the
/// target the control plane asked for; `reported` is what the device
/// last answered. `property_idx` indexes into the owning instance's
/// property list and is resolved after construction.
#[derive(Clone, Debug, Default)]
pub struct Twin {
    pub property_name: String,
    pub property_idx: Option<usize>,
    pub observed_desired: TwinValue,
    pub reported: TwinValue,
}

/// A callable method exposed by a device instance.
#[derive(Clone, Debug, Default)]
pub struct DeviceMethod {
    pub name: String,
    pub description: String,
    pub property_names: Vec<String>,
}

fn def_http_endpoint() -> String {
    String::from("http://localhost:8080/api/data")
}

fn def_http_method() -> String {
    String::from("POST")
}

fn def_timeout_ms() -> u64 {
    10_000
}

fn def_retry_count() -> u32 {
    3
}

/// Configuration for the HTTP push channel.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpPushConfig {
    pub endpoint: String,
    pub method: String,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
}

impl Default for HttpPushConfig {
    fn default() -> Self {
        HttpPushConfig {
            endpoint: def_http_endpoint(),
            method: def_http_method(),
            timeout_ms: def_timeout_ms(),
            retry_count: def_retry_count(),
        }
    }
}

fn def_mqtt_broker() -> String {
    String::from("localhost")
}

fn def_mqtt_port() -> u16 {
    1883
}

fn def_mqtt_client_id() -> String {
    String::from("mapper_client")
}

fn def_mqtt_topic_prefix() -> String {
    String::from("mapper/device")
}

fn def_mqtt_qos() -> u8 {
    1
}

fn def_mqtt_keep_alive() -> u64 {
    60
}

/// Configuration for the MQTT push channel.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttPushConfig {
    #[serde(rename = "brokerUrl")]
    pub broker_url: String,
    pub port: u16,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "topicPrefix")]
    pub topic_prefix: String,
    pub qos: u8,
    #[serde(rename = "keepAlive")]
    pub keep_alive: u64,
}

impl Default for MqttPushConfig {
    fn default() -> Self {
        MqttPushConfig {
            broker_url: def_mqtt_broker(),
            port: def_mqtt_port(),
            client_id: def_mqtt_client_id(),
            username: None,
            password: None,
            topic_prefix: def_mqtt_topic_prefix(),
            qos: def_mqtt_qos(),
            keep_alive: def_mqtt_keep_alive(),
        }
    }
}

fn def_otel_endpoint() -> String {
    String::from("http://localhost:4318/v1/metrics")
}

fn def_otel_service_name() -> String {
    String::from("edge-mapper")
}

fn def_otel_service_version() -> String {
    String::from("1.0.0")
}

/// Configuration for the OpenTelemetry push channel.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OtelPushConfig {
    #[serde(alias = "endpointUrl")]
    pub endpoint: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "serviceVersion")]
    pub service_version: String,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
}

impl Default for OtelPushConfig {
    fn default() -> Self {
        OtelPushConfig {
            endpoint: def_otel_endpoint(),
            service_name: def_otel_service_name(),
            service_version: def_otel_service_version(),
            timeout_ms: def_timeout_ms(),
        }
    }
}

/// The push channel a property's samples are published to. Parsed
/// once at the wire boundary; `Unknown` carries the original method
/// name so it can be reported back.
#[derive(Clone, Debug, PartialEq)]
pub enum PushChannel {
    Http(HttpPushConfig),
    Mqtt(MqttPushConfig),
    Otel(OtelPushConfig),
    Unknown(String),
}

impl PushChannel {
    /// Parses a channel from its method name and opaque JSON config.
    pub fn from_parts(method_name: &str, config_json: &str) -> Self {
        let json = if config_json.is_empty() {
            "{}"
        } else {
            config_json
        };

        match method_name.to_ascii_lowercase().as_str() {
            "http" => serde_json::from_str(json)
                .map(PushChannel::Http)
                .unwrap_or_else(|_| PushChannel::Http(Default::default())),
            "mqtt" => serde_json::from_str(json)
                .map(PushChannel::Mqtt)
                .unwrap_or_else(|_| PushChannel::Mqtt(Default::default())),
            "otel" => serde_json::from_str(json)
                .map(PushChannel::Otel)
                .unwrap_or_else(|_| PushChannel::Otel(Default::default())),
            other => PushChannel::Unknown(other.to_string()),
        }
    }

    pub fn method_name(&self) -> &str {
        match self {
            PushChannel::Http(_) => "http",
            PushChannel::Mqtt(_) => "mqtt",
            PushChannel::Otel(_) => "otel",
            PushChannel::Unknown(name) => name,
        }
    }

    /// Serializes the parsed config back into its canonical JSON
    /// form. Used as part of the publisher cache key.
    pub fn config_json(&self) -> String {
        let result = match self {
            PushChannel::Http(cfg) => serde_json::to_string(cfg),
            PushChannel::Mqtt(cfg) => serde_json::to_string(cfg),
            PushChannel::Otel(cfg) => serde_json::to_string(cfg),
            PushChannel::Unknown(_) => return String::from("{}"),
        };
        result.unwrap_or_else(|_| String::from("{}"))
    }
}

/// Connection parameters for the MySQL recorder.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MySqlClientConfig {
    pub addr: String,
    pub port: u16,
    pub database: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    pub password: Option<String>,
}

impl Default for MySqlClientConfig {
    fn default() -> Self {
        MySqlClientConfig {
            addr: String::from("127.0.0.1"),
            port: 3306,
            database: String::from("testdb"),
            user_name: String::from("mapper"),
            password: None,
        }
    }
}

/// Connection parameters for the Redis recorder. `addr` is
/// `host:port`; the password, if any, comes from the `PASSWORD`
/// environment variable at connect time.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisClientConfig {
    pub addr: String,
    pub db: i64,
    #[serde(rename = "poolSize")]
    pub pool_size: u32,
    #[serde(rename = "minIdleConns")]
    pub min_idle_conns: u32,
}

impl Default for RedisClientConfig {
    fn default() -> Self {
        RedisClientConfig {
            addr: String::from("localhost:6379"),
            db: 0,
            pool_size: 10,
            min_idle_conns: 3,
        }
    }
}

/// Connection and data-layout parameters for the InfluxDB2 recorder.
/// The API token comes from the `TOKEN` environment variable. Tags
/// are applied to the line protocol in configured order.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InfluxDbConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub measurement: Option<String>,
    #[serde(rename = "fieldKey")]
    pub field_key: Option<String>,
    #[serde(rename = "tag")]
    pub tags: serde_json::Map<String, serde_json::Value>,
}

/// Connection parameters for the TDengine recorder. Missing fields
/// fall back to the `TDENGINE_{ADDR,DBNAME,USER,PASSWORD}`
/// environment variables at connect time.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TdEngineClientConfig {
    pub addr: Option<String>,
    #[serde(rename = "dbName")]
    pub db_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for TdEngineClientConfig {
    fn default() -> Self {
        TdEngineClientConfig {
            addr: None,
            db_name: None,
            username: None,
            password: None,
        }
    }
}

/// The time-series backend a property's samples are recorded to.
#[derive(Clone, Debug, PartialEq)]
pub enum DbMethod {
    MySql(MySqlClientConfig),
    Redis(RedisClientConfig),
    Influx(InfluxDbConfig),
    TdEngine(TdEngineClientConfig),
}

impl DbMethod {
    pub fn method_name(&self) -> &'static str {
        match self {
            DbMethod::MySql(_) => "mysql",
            DbMethod::Redis(_) => "redis",
            DbMethod::Influx(_) => "influxdb2",
            DbMethod::TdEngine(_) => "tdengine",
        }
    }
}

/// Aggregates a property's push channel and optional database
/// backend.
#[derive(Clone, Debug, Default)]
pub struct PushMethod {
    pub channel: Option<PushChannel>,
    pub db: Option<DbMethod>,
}

/// One property of a device instance.
#[derive(Clone, Debug, Default)]
pub struct DeviceProperty {
    pub name: String,
    pub model_name: String,
    pub protocol: String,

    /// Opaque visitor JSON handed to the driver unchanged.
    pub visitors: String,

    pub collect_cycle: i64,
    pub report_cycle: i64,
    pub report_to_cloud: bool,
    pub push_method: Option<PushMethod>,

    /// Index of the matching property in the referenced model, when
    /// one resolved.
    pub model_property_idx: Option<usize>,
}

/// Reporting knobs carried on the instance's status block.
#[derive(Clone, Debug, Default)]
pub struct InstanceStatus {
    pub report_to_cloud: bool,
    pub report_cycle: i64,
}

/// A device instance: the desired-state specification for one
/// physical or virtual device.
#[derive(Clone, Debug, Default)]
pub struct DeviceInstance {
    pub id: String,
    pub name: String,
    pub namespace: String,

    /// Name of the model this instance references.
    pub model: String,

    pub protocol_name: String,
    pub protocol: crate::driver::ProtocolConfig,
    pub properties: Vec<DeviceProperty>,
    pub twins: Vec<Twin>,
    pub methods: Vec<DeviceMethod>,
    pub status: InstanceStatus,
}

impl DeviceInstance {
    /// The canonical registry identity, `"<namespace>/<name>"`.
    pub fn canonical_id(&self) -> String {
        canonical_id(&self.namespace, &self.name)
    }

    pub fn find_property(&self, name: &str) -> Option<&DeviceProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_twin(&self, property_name: &str) -> Option<&Twin> {
        self.twins.iter().find(|t| t.property_name == property_name)
    }

    pub fn find_twin_mut(
        &mut self,
        property_name: &str,
    ) -> Option<&mut Twin> {
        self.twins
            .iter_mut()
            .find(|t| t.property_name == property_name)
    }

    /// Points each twin at its property by index. Twins naming a
    /// property the instance doesn't carry keep `property_idx = None`.
    pub fn resolve_twin_refs(&mut self) {
        for twin in &mut self.twins {
            twin.property_idx = self
                .properties
                .iter()
                .position(|p| p.name == twin.property_name);
        }
    }

    /// Fills in runtime state the control plane may omit: twin
    /// property references are (re)resolved, an instance that arrives
    /// with properties but no twins gets one twin per property, and
    /// one with no methods gets a synthetic `SetProperty` method
    /// naming every property. Re-running is harmless.
    pub fn synthesize_runtime_state(&mut self) {
        self.resolve_twin_refs();

        if self.twins.is_empty() && !self.properties.is_empty() {
            self.twins = self
                .properties
                .iter()
                .enumerate()
                .map(|(idx, prop)| Twin {
                    property_name: prop.name.clone(),
                    property_idx: Some(idx),
                    ..Twin::default()
                })
                .collect();
        }

        if self.methods.is_empty() && !self.properties.is_empty() {
            self.methods = vec![DeviceMethod {
                name: String::from("SetProperty"),
                description: String::new(),
                property_names: self
                    .properties
                    .iter()
                    .map(|p| p.name.clone())
                    .collect(),
            }];
        }
    }

    /// Resolves the register offset for a property. Precedence: a
    /// top-level integer keyed by the property name in the protocol
    /// `configData` JSON; an integer under the nested `configData`
    /// object; otherwise `1 + index` of the property in this
    /// instance's property list.
    pub fn resolve_offset(&self, property_name: &str) -> Option<i64> {
        if let Ok(root) = serde_json::from_str::<serde_json::Value>(
            &self.protocol.config_data,
        ) {
            if let Some(v) = root.get(property_name).and_then(|v| v.as_i64())
            {
                if v > 0 {
                    return Some(v);
                }
            }
            if let Some(v) = root
                .get("configData")
                .and_then(|c| c.get(property_name))
                .and_then(|v| v.as_i64())
            {
                if v > 0 {
                    return Some(v);
                }
            }
        }

        self.properties
            .iter()
            .position(|p| p.name == property_name)
            .map(|idx| 1 + idx as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ProtocolConfig;

    #[test]
    fn test_status_normalization() {
        assert_eq!(normalize_status(""), STATUS_OFFLINE);
        assert_eq!(normalize_status("OK"), STATUS_OK);
        assert_eq!(normalize_status("ok"), STATUS_OK);
        assert_eq!(normalize_status("ONLINE"), STATUS_OK);
        assert_eq!(normalize_status("online"), STATUS_OK);
        assert_eq!(normalize_status("OFFLINE"), STATUS_OFFLINE);
        assert_eq!(normalize_status("DOWN"), STATUS_OFFLINE);
        assert_eq!(normalize_status("unhealthy"), "unhealthy");
        assert_eq!(normalize_status("weird-state"), "weird-state");
    }

    // Normalization must be idempotent for every input class.

    #[test]
    fn test_status_normalization_idempotent() {
        for raw in
            ["", "OK", "ONLINE", "OFFLINE", "DOWN", "unknown", "custom"]
        {
            let once = normalize_status(raw);

            assert_eq!(normalize_status(&once), once, "input {:?}", raw);
        }
    }

    #[test]
    fn test_namespace_defaulting() {
        assert_eq!(effective_namespace(""), "default");
        assert_eq!(effective_namespace("\u{7}\u{1}"), "default");
        assert_eq!(effective_namespace("ns1"), "ns1");
        assert_eq!(canonical_id("", "dev"), "default/dev");
        assert_eq!(canonical_id("ns1", "dev"), "ns1/dev");
    }

    fn instance_with_props(names: &[&str], config_data: &str) -> DeviceInstance {
        DeviceInstance {
            name: String::from("dev"),
            namespace: String::from("ns"),
            protocol: ProtocolConfig {
                protocol_name: String::from("modbus-tcp"),
                config_data: config_data.to_string(),
            },
            properties: names
                .iter()
                .map(|n| DeviceProperty {
                    name: n.to_string(),
                    ..DeviceProperty::default()
                })
                .collect(),
            ..DeviceInstance::default()
        }
    }

    #[test]
    fn test_offset_from_top_level_config() {
        let inst = instance_with_props(&["p"], r#"{"p": 5}"#);

        assert_eq!(inst.resolve_offset("p"), Some(5));
    }

    #[test]
    fn test_offset_from_nested_config() {
        let inst = instance_with_props(
            &["p"],
            r#"{"protocolName": "modbus-tcp", "configData": {"p": 7}}"#,
        );

        assert_eq!(inst.resolve_offset("p"), Some(7));
    }

    #[test]
    fn test_offset_positional_fallback() {
        let inst = instance_with_props(&["a", "p", "c"], "{}");

        assert_eq!(inst.resolve_offset("a"), Some(1));
        assert_eq!(inst.resolve_offset("p"), Some(2));
        assert_eq!(inst.resolve_offset("c"), Some(3));
        assert_eq!(inst.resolve_offset("missing"), None);
    }

    #[test]
    fn test_twin_and_method_synthesis() {
        let mut inst = instance_with_props(&["temp", "rpm"], "{}");

        assert!(inst.twins.is_empty());
        inst.synthesize_runtime_state();

        assert_eq!(inst.twins.len(), 2);
        assert_eq!(inst.twins[0].property_name, "temp");
        assert_eq!(inst.twins[0].property_idx, Some(0));
        assert_eq!(inst.twins[1].property_idx, Some(1));

        assert_eq!(inst.methods.len(), 1);
        assert_eq!(inst.methods[0].name, "SetProperty");
        assert_eq!(inst.methods[0].property_names, vec!["temp", "rpm"]);

        // Running it again must not duplicate anything.

        inst.synthesize_runtime_state();
        assert_eq!(inst.twins.len(), 2);
        assert_eq!(inst.methods.len(), 1);
    }

    #[test]
    fn test_existing_twins_are_rebound_not_replaced() {
        let mut inst = instance_with_props(&["temp"], "{}");

        inst.twins = vec![Twin {
            property_name: String::from("temp"),
            property_idx: None,
            observed_desired: TwinValue {
                value: String::from("42"),
                ..TwinValue::default()
            },
            ..Twin::default()
        }];

        inst.synthesize_runtime_state();

        assert_eq!(inst.twins.len(), 1);
        assert_eq!(inst.twins[0].property_idx, Some(0));
        assert_eq!(inst.twins[0].observed_desired.value, "42");
    }

    #[test]
    fn test_push_channel_parsing() {
        let http = PushChannel::from_parts(
            "http",
            r#"{"endpoint": "http://sink:9000/ingest", "retryCount": 1}"#,
        );

        if let PushChannel::Http(cfg) = &http {
            assert_eq!(cfg.endpoint, "http://sink:9000/ingest");
            assert_eq!(cfg.retry_count, 1);
            assert_eq!(cfg.method, "POST");
            assert_eq!(cfg.timeout_ms, 10_000);
        } else {
            panic!("expected an HTTP channel, got {:?}", http)
        }

        let mqtt = PushChannel::from_parts("MQTT", "{}");

        if let PushChannel::Mqtt(cfg) = &mqtt {
            assert_eq!(cfg.port, 1883);
            assert_eq!(cfg.qos, 1);
            assert_eq!(cfg.keep_alive, 60);
        } else {
            panic!("expected an MQTT channel, got {:?}", mqtt)
        }

        assert_eq!(
            PushChannel::from_parts("smoke-signal", "{}"),
            PushChannel::Unknown(String::from("smoke-signal"))
        );
    }

    #[test]
    fn test_otel_endpoint_alias() {
        let otel = PushChannel::from_parts(
            "otel",
            r#"{"endpointUrl": "http://collector:4318/v1/metrics"}"#,
        );

        if let PushChannel::Otel(cfg) = &otel {
            assert_eq!(cfg.endpoint, "http://collector:4318/v1/metrics");
        } else {
            panic!("expected an OTEL channel, got {:?}", otel)
        }
    }
}
