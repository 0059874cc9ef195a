use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Instance insert types ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertInstanceRequest {
    pub name: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub metadata: Metadata,
    pub network_interfaces: Vec<NetworkInterface>,
    pub service_accounts: Vec<ServiceAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub auto_delete: bool,
    pub boot: bool,
    #[serde(rename = "type")]
    pub disk_kind: String,
    pub initialize_params: AttachedDiskInitializeParams,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskInitializeParams {
    pub disk_name: String,
    pub source_image: String,
    pub disk_type: String,
    pub disk_size_gb: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_configs: Option<Vec<AccessConfig>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(rename = "type")]
    pub config_kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

// ── Shared metadata types (sent on insert/setMetadata, read on get) ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: Option<String>,
}

// ── Instance read types ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterfaceInfo {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub subnetwork: Option<String>,
    #[serde(default, rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default, rename = "accessConfigs")]
    pub access_configs: Vec<AccessConfigInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfigInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "natIP")]
    pub nat_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceList {
    #[serde(default)]
    pub items: Vec<Instance>,
}

// ── Operation types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: String,
}

// ── Serial console / firewall types ──────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SerialPortOutput {
    #[serde(default)]
    pub contents: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallList {
    #[serde(default)]
    pub items: Vec<Firewall>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallAllowed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallAllowed {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}
