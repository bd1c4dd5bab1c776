// MIT License - Copyright (c) 2021 TJForc
// Link configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::error::{LinkError, Result};

/// Parameter names understood by [`LinkConfig::from_source`].
pub mod params {
    pub const SERVER_ADDRESS: &str = "server_ip_address";
    pub const SERVER_PORT: &str = "server_port";
    pub const APN: &str = "apn";
    pub const NTP_SERVER: &str = "ntp_server";
    pub const NTP_TIMEZONE: &str = "ntp_timezone";
    pub const OTA_BASE_PATH: &str = "ota_base_path";
    pub const OTA_MANIFEST: &str = "ota_manifest";
    pub const STAGING_DIR: &str = "staging_dir";
    pub const ORDER_PATH: &str = "order_path";
    pub const REGISTRATION_ATTEMPTS: &str = "registration_attempts";
    pub const BEARER_ATTEMPTS: &str = "bearer_attempts";
    pub const SESSION_ATTEMPTS: &str = "session_attempts";
    pub const IDLE_READ_BUDGET: &str = "idle_read_budget";
    pub const KEEP_ALIVE: &str = "keep_alive";
}

/// Where endpoint URLs, credentials and operator identifiers come from.
pub trait ConfigSource {
    /// Look up a single parameter by name.
    fn param(&self, name: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn param(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Flat `key = value` TOML configuration file.
///
/// ```toml
/// server_ip_address = "ota.example.net"
/// server_port = 443
/// apn = "ETC"
/// registration_attempts = 10
/// ```
///
/// Omitted keys take the [`LinkConfig`] defaults; unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_server_address")]
    server_ip_address: String,
    #[serde(default = "default_server_port")]
    server_port: u16,
    #[serde(default = "default_apn")]
    apn: String,
    #[serde(default = "default_ntp_server")]
    ntp_server: String,
    #[serde(default = "default_ntp_timezone")]
    ntp_timezone: i8,
    #[serde(default = "default_ota_base_path")]
    ota_base_path: String,
    #[serde(default = "default_ota_manifest")]
    ota_manifest: String,
    #[serde(default = "default_staging_dir")]
    staging_dir: PathBuf,
    #[serde(default = "default_order_path")]
    order_path: String,
    #[serde(default = "default_registration_attempts")]
    registration_attempts: u32,
    #[serde(default = "default_bearer_attempts")]
    bearer_attempts: u32,
    #[serde(default = "default_session_attempts")]
    session_attempts: u32,
    #[serde(default = "default_idle_read_budget")]
    idle_read_budget: u32,
    #[serde(default = "default_keep_alive")]
    keep_alive: bool,
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    443
}
fn default_apn() -> String {
    "ETC".to_string()
}
fn default_ntp_server() -> String {
    "time.google.com".to_string()
}
fn default_ntp_timezone() -> i8 {
    12
}
fn default_ota_base_path() -> String {
    "/ota/".to_string()
}
fn default_ota_manifest() -> String {
    "manifest.txt".to_string()
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_order_path() -> String {
    "/ayer_admin/order".to_string()
}
fn default_registration_attempts() -> u32 {
    10
}
fn default_bearer_attempts() -> u32 {
    5
}
fn default_session_attempts() -> u32 {
    10
}
fn default_idle_read_budget() -> u32 {
    100
}
fn default_keep_alive() -> bool {
    true
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Malformed TOML and ill-typed values are both `ConfigFile` errors.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| LinkError::ConfigFile(e.to_string()))
    }

    pub fn into_link_config(self) -> LinkConfig {
        LinkConfig::builder()
            .server_address(self.server_ip_address)
            .server_port(self.server_port)
            .apn(self.apn)
            .ntp_server(self.ntp_server)
            .ntp_timezone(self.ntp_timezone)
            .ota_base_path(self.ota_base_path)
            .ota_manifest(self.ota_manifest)
            .staging_dir(self.staging_dir)
            .order_path(self.order_path)
            .registration_attempts(self.registration_attempts)
            .bearer_attempts(self.bearer_attempts)
            .session_attempts(self.session_attempts)
            .idle_read_budget(self.idle_read_budget)
            .keep_alive(self.keep_alive)
            .build()
    }
}

impl ConfigSource for FileConfig {
    fn param(&self, name: &str) -> Option<String> {
        let value = match name {
            params::SERVER_ADDRESS => self.server_ip_address.clone(),
            params::SERVER_PORT => self.server_port.to_string(),
            params::APN => self.apn.clone(),
            params::NTP_SERVER => self.ntp_server.clone(),
            params::NTP_TIMEZONE => self.ntp_timezone.to_string(),
            params::OTA_BASE_PATH => self.ota_base_path.clone(),
            params::OTA_MANIFEST => self.ota_manifest.clone(),
            params::STAGING_DIR => self.staging_dir.to_string_lossy().into_owned(),
            params::ORDER_PATH => self.order_path.clone(),
            params::REGISTRATION_ATTEMPTS => self.registration_attempts.to_string(),
            params::BEARER_ATTEMPTS => self.bearer_attempts.to_string(),
            params::SESSION_ATTEMPTS => self.session_attempts.to_string(),
            params::IDLE_READ_BUDGET => self.idle_read_budget.to_string(),
            params::KEEP_ALIVE => self.keep_alive.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Everything the link engine needs to reach the backend.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Backend host or IP used for HTTP and OTA sessions
    pub server_address: String,
    /// Backend port (default: 443)
    pub server_port: u16,
    /// Operator APN for the data bearer
    pub apn: String,
    /// NTP server for both the raw-socket and modem-clock time paths
    pub ntp_server: String,
    /// Modem clock timezone in quarter hours (`AT+CNTP`)
    pub ntp_timezone: i8,
    /// Path prefix for OTA artifacts on the backend
    pub ota_base_path: String,
    /// Manifest file name under `ota_base_path`
    pub ota_manifest: String,
    /// Directory receiving `<name>.new` staged files
    pub staging_dir: PathBuf,
    /// Default request path for order uploads
    pub order_path: String,
    /// Registration poll budget
    pub registration_attempts: u32,
    /// Bearer attach budget
    pub bearer_attempts: u32,
    /// Socket open budget
    pub session_attempts: u32,
    /// Consecutive empty reads ending an HTTP exchange
    pub idle_read_budget: u32,
    /// Send `Connection: keep-alive` on requests
    pub keep_alive: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_port: default_server_port(),
            apn: default_apn(),
            ntp_server: default_ntp_server(),
            ntp_timezone: default_ntp_timezone(),
            ota_base_path: default_ota_base_path(),
            ota_manifest: default_ota_manifest(),
            staging_dir: default_staging_dir(),
            order_path: default_order_path(),
            registration_attempts: default_registration_attempts(),
            bearer_attempts: default_bearer_attempts(),
            session_attempts: default_session_attempts(),
            idle_read_budget: default_idle_read_budget(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl LinkConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::default()
    }

    /// Build a config from a string-valued parameter source. Absent
    /// parameters keep their defaults; present but unparseable ones are an
    /// error.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            server_address: source
                .param(params::SERVER_ADDRESS)
                .unwrap_or(d.server_address),
            server_port: typed(source, params::SERVER_PORT, d.server_port)?,
            apn: source.param(params::APN).unwrap_or(d.apn),
            ntp_server: source.param(params::NTP_SERVER).unwrap_or(d.ntp_server),
            ntp_timezone: typed(source, params::NTP_TIMEZONE, d.ntp_timezone)?,
            ota_base_path: source
                .param(params::OTA_BASE_PATH)
                .unwrap_or(d.ota_base_path),
            ota_manifest: source.param(params::OTA_MANIFEST).unwrap_or(d.ota_manifest),
            staging_dir: source
                .param(params::STAGING_DIR)
                .map(PathBuf::from)
                .unwrap_or(d.staging_dir),
            order_path: source.param(params::ORDER_PATH).unwrap_or(d.order_path),
            registration_attempts: typed(
                source,
                params::REGISTRATION_ATTEMPTS,
                d.registration_attempts,
            )?,
            bearer_attempts: typed(source, params::BEARER_ATTEMPTS, d.bearer_attempts)?,
            session_attempts: typed(source, params::SESSION_ATTEMPTS, d.session_attempts)?,
            idle_read_budget: typed(source, params::IDLE_READ_BUDGET, d.idle_read_budget)?,
            keep_alive: typed(source, params::KEEP_ALIVE, d.keep_alive)?,
        })
    }

    /// Full request path of an OTA artifact.
    pub fn ota_path(&self, name: &str) -> String {
        if self.ota_base_path.ends_with('/') {
            format!("{}{}", self.ota_base_path, name)
        } else {
            format!("{}/{}", self.ota_base_path, name)
        }
    }
}

fn typed<T: FromStr>(source: &dyn ConfigSource, name: &str, default: T) -> Result<T> {
    match source.param(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| LinkError::InvalidParam {
            name: name.to_string(),
            value: raw,
        }),
    }
}

/// Builder for LinkConfig.
#[derive(Debug, Clone, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    pub fn server_address(mut self, address: impl Into<String>) -> Self {
        self.config.server_address = address.into();
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }

    pub fn apn(mut self, apn: impl Into<String>) -> Self {
        self.config.apn = apn.into();
        self
    }

    pub fn ntp_server(mut self, server: impl Into<String>) -> Self {
        self.config.ntp_server = server.into();
        self
    }

    pub fn ntp_timezone(mut self, quarter_hours: i8) -> Self {
        self.config.ntp_timezone = quarter_hours;
        self
    }

    pub fn ota_base_path(mut self, path: impl Into<String>) -> Self {
        self.config.ota_base_path = path.into();
        self
    }

    pub fn ota_manifest(mut self, name: impl Into<String>) -> Self {
        self.config.ota_manifest = name.into();
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    pub fn order_path(mut self, path: impl Into<String>) -> Self {
        self.config.order_path = path.into();
        self
    }

    pub fn registration_attempts(mut self, attempts: u32) -> Self {
        self.config.registration_attempts = attempts;
        self
    }

    pub fn bearer_attempts(mut self, attempts: u32) -> Self {
        self.config.bearer_attempts = attempts;
        self
    }

    pub fn session_attempts(mut self, attempts: u32) -> Self {
        self.config.session_attempts = attempts;
        self
    }

    pub fn idle_read_budget(mut self, reads: u32) -> Self {
        self.config.idle_read_budget = reads;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn build(self) -> LinkConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LinkConfig::builder()
            .server_address("10.0.0.1")
            .server_port(8443)
            .apn("internet")
            .session_attempts(3)
            .build();

        assert_eq!(config.server_address, "10.0.0.1");
        assert_eq!(config.server_port, 8443);
        assert_eq!(config.apn, "internet");
        assert_eq!(config.session_attempts, 3);
        assert_eq!(config.idle_read_budget, 100);
    }

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.registration_attempts, 10);
        assert_eq!(config.session_attempts, 10);
        assert_eq!(config.server_port, 443);
        assert!(config.keep_alive);
    }

    #[test]
    fn test_from_toml_source() {
        let file = FileConfig::parse(
            r#"
            server_ip_address = "ota.example.net"
            server_port = 8080
            apn = "safaricom"
            keep_alive = false
            staging_dir = "/flash"
            "#,
        )
        .unwrap();
        let config = file.into_link_config();
        assert_eq!(config.server_address, "ota.example.net");
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.apn, "safaricom");
        assert!(!config.keep_alive);
        assert_eq!(config.staging_dir, PathBuf::from("/flash"));
        assert_eq!(config.ntp_server, "time.google.com");
    }

    #[test]
    fn test_file_as_source() {
        let file = FileConfig::parse("apn = \"internet\"\nsession_attempts = 4\n").unwrap();
        assert_eq!(file.param(params::APN).as_deref(), Some("internet"));
        assert_eq!(file.param(params::SERVER_PORT).as_deref(), Some("443"));
        assert_eq!(file.param("panel_ip"), None);

        let config = LinkConfig::from_source(&file).unwrap();
        assert_eq!(config.session_attempts, 4);
        assert_eq!(config.bearer_attempts, 5);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = FileConfig::parse("").unwrap().into_link_config();
        let defaults = LinkConfig::default();
        assert_eq!(config.server_address, defaults.server_address);
        assert_eq!(config.ota_manifest, defaults.ota_manifest);
        assert_eq!(config.idle_read_budget, defaults.idle_read_budget);
    }

    #[test]
    fn test_mistyped_file_value() {
        match FileConfig::parse("server_port = \"https\"") {
            Err(LinkError::ConfigFile(msg)) => assert!(msg.contains("server_port")),
            other => panic!("expected ConfigFile, got {:?}", other),
        }
        assert!(matches!(
            FileConfig::parse("registration_attempts = -1"),
            Err(LinkError::ConfigFile(_))
        ));
    }

    #[test]
    fn test_invalid_param_is_error() {
        let mut source = HashMap::new();
        source.insert("server_port".to_string(), "https".to_string());
        match LinkConfig::from_source(&source) {
            Err(LinkError::InvalidParam { name, value }) => {
                assert_eq!(name, "server_port");
                assert_eq!(value, "https");
            }
            other => panic!("expected InvalidParam, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_file() {
        assert!(matches!(
            FileConfig::parse("server_port = "),
            Err(LinkError::ConfigFile(_))
        ));
    }

    #[test]
    fn test_ota_path_join() {
        let config = LinkConfig::builder().ota_base_path("/fw").build();
        assert_eq!(config.ota_path("main.py"), "/fw/main.py");
        let config = LinkConfig::builder().ota_base_path("/fw/").build();
        assert_eq!(config.ota_path("main.py.sha1"), "/fw/main.py.sha1");
    }
}
