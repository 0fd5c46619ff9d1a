use std::env;

const DEF_ADDR: &str = "127.0.0.1";
const DEF_PORT: u16 = 1502;

/// Connection parameters for a modbus-tcp device, taken from the
/// protocol `configData` JSON with environment fallbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct Params {
    pub addr: String,
    pub port: u16,
    pub unit_id: u8,
}

fn sanitize_host(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
        .collect()
}

impl Params {
    /// Parses driver parameters from the protocol config. Host and
    /// port fall back to `MAPPER_MODBUS_ADDR` / `MAPPER_MODBUS_PORT`
    /// and then to the local defaults, so a device definition without
    /// connection details still produces a usable client.
    pub fn from_config(config_data: &str) -> Params {
        let root: serde_json::Value =
            serde_json::from_str(config_data).unwrap_or_default();
        let section = root.get("configData").unwrap_or(&root);

        let mut addr = section
            .get("addr")
            .or_else(|| section.get("host"))
            .and_then(|v| v.as_str())
            .map(sanitize_host)
            .unwrap_or_default();

        if addr.is_empty() {
            addr = env::var("MAPPER_MODBUS_ADDR")
                .map(|v| sanitize_host(&v))
                .unwrap_or_default();
        }
        if addr.is_empty() {
            addr = String::from(DEF_ADDR);
        }

        let mut port = section
            .get("port")
            .and_then(|v| v.as_i64())
            .filter(|p| (1..=65535).contains(p))
            .map(|p| p as u16);

        if port.is_none() {
            port = env::var("MAPPER_MODBUS_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .filter(|p| *p > 0);
        }

        let unit_id = section
            .get("unitId")
            .and_then(|v| v.as_i64())
            .filter(|u| (0..=255).contains(u))
            .map(|u| u as u8)
            .unwrap_or(1);

        Params {
            addr,
            port: port.unwrap_or(DEF_PORT),
            unit_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_on_empty_config() {
        let params = Params::from_config("{}");

        assert_eq!(params.addr, DEF_ADDR);
        assert_eq!(params.port, DEF_PORT);
        assert_eq!(params.unit_id, 1);
    }

    #[test]
    fn test_nested_config_section() {
        let params = Params::from_config(
            r#"{"protocolName": "modbus-tcp",
                "configData": {"addr": "plc-7.local", "port": 502, "unitId": 3}}"#,
        );

        assert_eq!(params.addr, "plc-7.local");
        assert_eq!(params.port, 502);
        assert_eq!(params.unit_id, 3);
    }

    #[test]
    fn test_host_sanitization() {
        let params =
            Params::from_config(r#"{"addr": " plc\n01.local ", "port": 502}"#);

        assert_eq!(params.addr, "plc01.local");
    }

    #[test]
    fn test_bad_port_falls_back() {
        let params = Params::from_config(r#"{"port": 700000}"#);

        assert_eq!(params.port, DEF_PORT);
    }
}
