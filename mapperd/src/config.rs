use mapper_api::{Error, Result};
use serde_derive::Deserialize;
use std::env;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_socket_path() -> String {
    String::from("/tmp/mapper_dmi.sock")
}

fn def_edgecore_sock() -> String {
    String::from("/var/lib/edgecore/edgecore.sock")
}

fn def_name() -> String {
    String::from("mapper")
}

fn def_version() -> String {
    String::from("v1.0.0")
}

fn def_api_version() -> String {
    String::from("v1.0.0")
}

fn def_protocol() -> String {
    String::from("modbus-tcp")
}

fn def_mysql_addr() -> String {
    String::from("127.0.0.1")
}

fn def_mysql_port() -> u16 {
    3306
}

fn def_mysql_database() -> String {
    String::from("testdb")
}

fn def_mysql_username() -> String {
    String::from("mapper")
}

fn def_mysql_ssl_mode() -> String {
    String::from("DISABLED")
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,
    #[serde(default)]
    pub grpc_server: GrpcServer,
    #[serde(default)]
    pub common: Common,
    #[serde(default)]
    pub database: Database,
}

#[derive(Deserialize)]
pub struct GrpcServer {
    #[serde(default = "def_socket_path")]
    pub socket_path: String,
}

impl Default for GrpcServer {
    fn default() -> Self {
        GrpcServer {
            socket_path: def_socket_path(),
        }
    }
}

#[derive(Deserialize)]
pub struct Common {
    #[serde(default = "def_name")]
    pub name: String,
    #[serde(default = "def_version")]
    pub version: String,
    #[serde(default = "def_api_version")]
    pub api_version: String,
    #[serde(default = "def_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "def_edgecore_sock")]
    pub edgecore_sock: String,
    pub http_port: Option<u16>,
}

impl Default for Common {
    fn default() -> Self {
        Common {
            name: def_name(),
            version: def_version(),
            api_version: def_api_version(),
            protocol: def_protocol(),
            address: String::new(),
            edgecore_sock: def_edgecore_sock(),
            http_port: None,
        }
    }
}

#[derive(Default, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub mysql: MySql,
}

#[derive(Deserialize)]
pub struct MySql {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "def_mysql_addr")]
    pub addr: String,
    #[serde(default = "def_mysql_port")]
    pub port: u16,
    #[serde(default = "def_mysql_database")]
    pub database: String,
    #[serde(default = "def_mysql_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "def_mysql_ssl_mode")]
    pub ssl_mode: String,
}

impl Default for MySql {
    fn default() -> Self {
        MySql {
            enabled: false,
            addr: def_mysql_addr(),
            port: def_mysql_port(),
            database: def_mysql_database(),
            username: def_mysql_username(),
            password: String::new(),
            ssl_mode: def_mysql_ssl_mode(),
        }
    }
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    /// The control-plane socket, with the `EDGECORE_SOCK` environment
    /// variable taking precedence over the config file.
    pub fn edgecore_sock(&self) -> String {
        match env::var("EDGECORE_SOCK") {
            Ok(path) if !path.is_empty() => path,
            _ => self.common.edgecore_sock.clone(),
        }
    }

    // Environment overrides that must win over the config file. These
    // are applied once, after the file is parsed.

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MYSQL_ENABLED") {
            match v.to_ascii_lowercase().as_str() {
                "0" | "false" => {
                    self.database.mysql.enabled = false;
                }
                "1" | "true" => {
                    self.database.mysql.enabled = true;
                }
                _ => (),
            }
        }
        if let Ok(v) = env::var("MYSQL_PASSWORD") {
            if !v.is_empty() {
                self.database.mysql.password = v;
            }
        }
        if let Ok(v) = env::var("MYSQL_SSL_MODE") {
            if !v.is_empty() {
                self.database.mysql.ssl_mode = v;
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            grpc_server: GrpcServer::default(),
            common: Common::default(),
            database: Database::default(),
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Option<String>, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    // Define the command line arguments.

    let matches = Command::new("Edge Device Mapper")
        .version(crate_version!())
        .about("Reconciles control-plane device specs against edge devices.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    // The number of '-v' options determines the log level.

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (
        matches.get_flag("print_cfg"),
        matches.get_one::<String>("config").cloned(),
        cfg,
    )
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents).map_err(|e| Error::ConfigError(format!("{}", e)))
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg(explicit: Option<&str>) -> Result<Config> {
    const CFG_FILE: &str = "mapper.toml";

    if let Some(path) = explicit {
        return match from_file(path).await {
            Some(cfg) => cfg,
            None => Err(Error::ConfigError(format!(
                "couldn't read config file '{}'",
                path
            ))),
        };
    }

    // Search the usual places; the first file that is found and can
    // be parsed is used as the configuration.

    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/etc/"));

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}\n", cfg.get_log_level());
    println!("gRPC server:");
    println!("    socket: {}\n", &cfg.grpc_server.socket_path);
    println!("Mapper:");
    println!("    name: {}", &cfg.common.name);
    println!("    version: {}", &cfg.common.version);
    println!("    protocol: {}", &cfg.common.protocol);
    println!("    control plane socket: {}", cfg.edgecore_sock());
    match cfg.common.http_port {
        Some(port) => println!("    admin HTTP port: {}\n", port),
        None => println!("    admin HTTP server disabled\n"),
    }
    if cfg.database.mysql.enabled {
        println!("MySQL recorder:");
        println!(
            "    addr: {}:{}",
            &cfg.database.mysql.addr, cfg.database.mysql.port
        );
        println!("    database: {}", &cfg.database.mysql.database);
        println!("    user: {}", &cfg.database.mysql.username);
        println!("    ssl mode: {}", &cfg.database.mysql.ssl_mode);
    } else {
        println!("MySQL recorder disabled.");
    }
}

pub async fn get() -> Option<Config> {
    // A first pass over the command line picks up the config file
    // path; a second pass lets `-v` flags override the file contents.

    let (_, explicit, _) = from_cmdline(Config::default());

    match find_cfg(explicit.as_deref()).await {
        Ok(cfg) => {
            let (print_cfg, _, mut cfg) = from_cmdline(cfg);

            cfg.apply_env_overrides();

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            eprintln!("ERROR: {}", &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();

        assert_eq!(cfg.grpc_server.socket_path, "/tmp/mapper_dmi.sock");
        assert_eq!(cfg.common.protocol, "modbus-tcp");
        assert!(!cfg.database.mysql.enabled);
        assert_eq!(cfg.database.mysql.port, 3306);
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = parse_config(
            r#"
log_level = "debug"

[grpc_server]
socket_path = "/run/mapper/dmi.sock"

[common]
name = "bench-mapper"
http_port = 7777
edgecore_sock = "/run/edgecore.sock"

[database.mysql]
enabled = true
addr = "db.local"
port = 3307
database = "telemetry"
username = "edge"
"#,
        )
        .unwrap();

        assert_eq!(cfg.get_log_level(), Level::DEBUG);
        assert_eq!(cfg.grpc_server.socket_path, "/run/mapper/dmi.sock");
        assert_eq!(cfg.common.name, "bench-mapper");
        assert_eq!(cfg.common.http_port, Some(7777));
        assert!(cfg.database.mysql.enabled);
        assert_eq!(cfg.database.mysql.addr, "db.local");
        assert_eq!(cfg.database.mysql.port, 3307);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(parse_config("log_level = [1, 2]").is_err());
    }
}
