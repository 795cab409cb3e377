use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Full configuration profile, one TOML table per section.
///
/// Every recognized option carries a default so a partial profile still
/// loads; operators override only what differs on their deployment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(rename = "web-app", default)]
    pub web_app: WebAppSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub path: PathSettings,
    #[serde(default)]
    pub openstack: OpenstackSettings,
    #[serde(rename = "module-option", default)]
    pub module_option: ModuleOptionSettings,
    #[serde(rename = "meta-data", default)]
    pub meta_data: MetaDataSettings,
    #[serde(default)]
    pub external: ExternalSettings,
    #[serde(default)]
    pub usg: UsgSettings,
}

impl Settings {
    /// Parse a profile file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server creations allowed to start per minute.
    #[serde(rename = "rate-limit", default = "default_rate_limit")]
    pub rate_limit: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), rate_limit: default_rate_limit() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WebAppSettings {
    #[serde(rename = "context-path", default)]
    pub context_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { host: default_host(), port: default_db_port() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PathSettings {
    #[serde(rename = "log-conf", default)]
    pub log_conf: String,
    #[serde(rename = "config-root", default)]
    pub config_root: String,
    #[serde(rename = "access-log", default)]
    pub access_log: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenstackSettings {
    /// Ceiling on pool floating IPs; `CheckAvailability` reports
    /// `maximum-fip − attached`.
    #[serde(rename = "maximum-fip", default = "default_maximum_fip")]
    pub maximum_fip: i64,
}

impl Default for OpenstackSettings {
    fn default() -> Self {
        Self { maximum_fip: default_maximum_fip() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleOptionSettings {
    /// Seconds to let the hypervisor settle between server-ready and the
    /// first networking call.
    #[serde(rename = "delay-between-os-calls", default = "default_os_delay")]
    pub delay_between_os_calls: u64,
}

impl Default for ModuleOptionSettings {
    fn default() -> Self {
        Self { delay_between_os_calls: default_os_delay() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MetaDataSettings {
    #[serde(rename = "signer-id", default)]
    pub signer_id: String,
    #[serde(rename = "nexus-url", default)]
    pub nexus_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ExternalSettings {
    #[serde(rename = "vertex-url", default)]
    pub vertex_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct UsgSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub authurl: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_port() -> u16 {
    5432
}

fn default_rate_limit() -> u32 {
    10
}

fn default_maximum_fip() -> i64 {
    10
}

fn default_os_delay() -> u64 {
    10
}
