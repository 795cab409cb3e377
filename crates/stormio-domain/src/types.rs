use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Fresh v4 UUID as the canonical string form used for asset ids and
/// serial keys.
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

// ── Request lifecycle ─────────────────────────────────────────────────────────

/// Lifecycle state of an [`AssetRequest`].
///
/// Transitions:
///   New → Build → ServerCreated → Fulfilled
///   Build → Retry → Build            (reconciler re-enqueue)
///   Fulfilled → Remediation → Build  (replace-in-place)
///   any → MarkedForDeletion → (record removed)
///
/// `Fail` is declared for wire compatibility but no path produces it today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RequestStatus {
    #[default]
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "BUILD")]
    Build,
    #[serde(rename = "SERVER_CREATED")]
    ServerCreated,
    #[serde(rename = "SERVICE_PROVISION")]
    ServiceProvision,
    #[serde(rename = "FUL_FILLED")]
    Fulfilled,
    #[serde(rename = "RETRY")]
    Retry,
    #[serde(rename = "RETRY_MINSTALL")]
    RetryModuleInstall,
    #[serde(rename = "RETRY_MCONFIG")]
    RetryModuleConfig,
    #[serde(rename = "MARKED_FOR_DELETION")]
    MarkedForDeletion,
    #[serde(rename = "NOTIFICATION_FAILED")]
    NotificationFailed,
    #[serde(rename = "REMEDIATION")]
    Remediation,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::New => "NEW",
            RequestStatus::Fail => "FAIL",
            RequestStatus::Build => "BUILD",
            RequestStatus::ServerCreated => "SERVER_CREATED",
            RequestStatus::ServiceProvision => "SERVICE_PROVISION",
            RequestStatus::Fulfilled => "FUL_FILLED",
            RequestStatus::Retry => "RETRY",
            RequestStatus::RetryModuleInstall => "RETRY_MINSTALL",
            RequestStatus::RetryModuleConfig => "RETRY_MCONFIG",
            RequestStatus::MarkedForDeletion => "MARKED_FOR_DELETION",
            RequestStatus::NotificationFailed => "NOTIFICATION_FAILED",
            RequestStatus::Remediation => "REMEDIATION",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(RequestStatus::New),
            "FAIL" => Ok(RequestStatus::Fail),
            "BUILD" => Ok(RequestStatus::Build),
            "SERVER_CREATED" => Ok(RequestStatus::ServerCreated),
            "SERVICE_PROVISION" => Ok(RequestStatus::ServiceProvision),
            "FUL_FILLED" => Ok(RequestStatus::Fulfilled),
            "RETRY" => Ok(RequestStatus::Retry),
            "RETRY_MINSTALL" => Ok(RequestStatus::RetryModuleInstall),
            "RETRY_MCONFIG" => Ok(RequestStatus::RetryModuleConfig),
            "MARKED_FOR_DELETION" => Ok(RequestStatus::MarkedForDeletion),
            "NOTIFICATION_FAILED" => Ok(RequestStatus::NotificationFailed),
            "REMEDIATION" => Ok(RequestStatus::Remediation),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

// ── IaaS credentials ──────────────────────────────────────────────────────────

/// IaaS tenant credentials plus optional per-service endpoint overrides.
///
/// An all-empty provider is a valid shape: it marks an agent-only request
/// that never touches the IaaS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AssetProvider {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "endPoint", default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(rename = "regionName", default)]
    pub region_name: String,
    #[serde(rename = "defaultNetName", default, skip_serializing_if = "String::is_empty")]
    pub default_net_name: String,
    #[serde(rename = "networkName", default, skip_serializing_if = "String::is_empty")]
    pub network_name: String,
    #[serde(rename = "routerId", default, skip_serializing_if = "String::is_empty")]
    pub router_id: String,
    #[serde(rename = "networkId", default, skip_serializing_if = "String::is_empty")]
    pub network_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compute: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub neutron: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity: String,
}

impl AssetProvider {
    /// True when every field is zero-valued — the agent-only marker.
    pub fn is_empty(&self) -> bool {
        *self == AssetProvider::default()
    }

    /// The provider declares a network service of its own.
    pub fn has_network_service(&self) -> bool {
        !self.neutron.is_empty()
    }
}

/// Flavor/image pair the request should be built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AssetModel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub image: String,
    /// Tenant networks to boot on, each `{"uuid": "..."}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<HashMap<String, String>>,
}

// ── Overlay control plane ─────────────────────────────────────────────────────

/// Uplink and beacon configuration attached to every agent registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StormBolt {
    #[serde(default)]
    pub uplinks: Vec<String>,
    #[serde(rename = "uplinkStrategy", default)]
    pub uplink_strategy: String,
    #[serde(rename = "allowRelay", default)]
    pub allow_relay: bool,
    #[serde(rename = "relayPort", default)]
    pub relay_port: i32,
    #[serde(rename = "allowedPorts", default)]
    pub allowed_ports: Vec<i32>,
    #[serde(rename = "listenPort", default)]
    pub listen_port: i32,
    #[serde(rename = "beaconInterval", default)]
    pub beacon_interval: i32,
    #[serde(rename = "beaconRetry", default)]
    pub beacon_retry: i32,
    #[serde(rename = "beaconValidity", default)]
    pub beacon_validity: i32,
}

/// Wire shape of an agent on the tracker service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StormAgent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "serialkey", default)]
    pub serial_key: String,
    #[serde(default)]
    pub stoken: String,
    #[serde(rename = "bolt", default)]
    pub storm_bolt: StormBolt,
}

/// Overlay control-plane coordinates for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ControlProvider {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "stormtracker", default)]
    pub stormtracker_url: String,
    #[serde(rename = "stormlight", default)]
    pub stormlight_url: String,
    #[serde(rename = "stormkeeper", default)]
    pub stormkeeper_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bolt: StormBolt,
    #[serde(rename = "domain", default)]
    pub default_domain_id: String,
}

// ── Caller callback ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotifyCaller {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

// ── Modules / logs ────────────────────────────────────────────────────────────

/// Install/configure progress of one module on the provisioned server.
/// Transient — never persisted or sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModuleStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogEntry {
    #[serde(default)]
    pub msg: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

// ── AssetRequest ──────────────────────────────────────────────────────────────

/// Durable record of one provisioning intent. One document per request,
/// keyed by `id` (UUID v4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssetRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "hostName", default)]
    pub host_name: String,
    #[serde(rename = "resource", default)]
    pub resource_id: String,
    #[serde(rename = "serverId", default)]
    pub server_id: String,
    #[serde(rename = "ipAddress", default)]
    pub ip_address: String,
    #[serde(rename = "receivedOn", default)]
    pub received_on: String,
    #[serde(rename = "modelId", default)]
    pub model_id: String,
    #[serde(rename = "assetProvider", default)]
    pub provider: AssetProvider,
    #[serde(rename = "assetModel", default)]
    pub model: AssetModel,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(rename = "previousStatus", default)]
    pub previous_status: Option<RequestStatus>,
    #[serde(default)]
    pub remediation: bool,
    #[serde(rename = "stormTokenId", default)]
    pub control_token_id: String,
    #[serde(rename = "serialkey", default)]
    pub serial_key: String,
    #[serde(rename = "agentId", default)]
    pub agent_id: String,
    #[serde(rename = "controlProvider", default)]
    pub control_provider: ControlProvider,
    #[serde(default)]
    pub notify: NotifyCaller,
    #[serde(rename = "attachFIP", default)]
    pub attach_fip: bool,
    #[serde(skip)]
    pub modules: Vec<ModuleStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
}

impl AssetRequest {
    /// Record a status change, keeping the previous one for diagnostics.
    pub fn set_status(&mut self, status: RequestStatus) {
        self.previous_status = Some(self.status);
        self.status = status;
    }

    /// Append a line to the durable request log.
    pub fn log(&mut self, kind: &str, msg: impl Into<String>) {
        self.logs.push(LogEntry { msg: msg.into(), kind: kind.to_string() });
    }
}
